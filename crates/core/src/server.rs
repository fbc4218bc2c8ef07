use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crate::config::ServerConfig;
use crate::context::ServerContext;
use crate::error::{Result, RtspError};
use crate::media::MediaBackends;
use crate::transport::tcp;

/// High-level RTSP relay server.
///
/// Owns the shared [`ServerContext`] (ports, sessions, multicast groups,
/// media backends) and delegates each control connection to
/// [`transport::tcp`](crate::transport::tcp).
pub struct Server {
    ctx: Arc<ServerContext>,
    running: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
}

impl Server {
    /// A server backed by ffmpeg/ffprobe and files under `media_root`.
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let media = MediaBackends::ffmpeg(&config);
        Ok(Self::with_backends(config, media))
    }

    /// A server with custom content resolution, description and production.
    pub fn with_backends(config: ServerConfig, media: MediaBackends) -> Self {
        Self {
            ctx: ServerContext::new(config, media),
            running: Arc::new(AtomicBool::new(false)),
            local_addr: None,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(RtspError::AlreadyRunning);
        }

        let listener = TcpListener::bind(&self.ctx.config.bind_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);

        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        let ctx = self.ctx.clone();

        tracing::info!(addr = %local_addr, "RTSP server listening");

        let spawned = thread::Builder::new()
            .name("rtsp-accept".to_string())
            .spawn(move || tcp::accept_loop(listener, ctx, running));
        if let Err(e) = spawned {
            self.running.store(false, Ordering::SeqCst);
            return Err(e.into());
        }

        Ok(())
    }

    /// Stop accepting and tear down every live session.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let sessions = self.ctx.sessions.snapshot();
        tracing::info!(sessions = sessions.len(), "server stopping");
        for session in sessions {
            session.teardown(None);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}
