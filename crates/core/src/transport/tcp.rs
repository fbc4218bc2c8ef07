use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::context::ServerContext;
use crate::error::Result;
use crate::protocol::framing::{self, Frame, MAX_PENDING_BYTES};
use crate::protocol::{RtspRequest, RtspResponse};
use crate::session::Session;
use crate::transport::TransportMode;

const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const READ_CHUNK: usize = 4096;

/// Write half of an RTSP control connection.
///
/// Responses and interleaved media share one writer; the mutex keeps each
/// message contiguous on the wire.
pub struct ControlChannel {
    writer: Mutex<Box<dyn Write + Send>>,
    stream: Option<TcpStream>,
    broken: AtomicBool,
}

impl ControlChannel {
    pub fn new(stream: &TcpStream) -> io::Result<Self> {
        let writer = stream.try_clone()?;
        writer.set_write_timeout(Some(WRITE_TIMEOUT))?;
        Ok(Self {
            writer: Mutex::new(Box::new(writer)),
            stream: Some(stream.try_clone()?),
            broken: AtomicBool::new(false),
        })
    }

    /// A channel over an arbitrary writer, with nothing to shut down.
    pub fn from_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
            stream: None,
            broken: AtomicBool::new(false),
        }
    }

    /// Write a response. A failed write marks the channel broken.
    pub fn send_response(&self, response: &RtspResponse) {
        let mut writer = self.writer.lock();
        let written = writer
            .write_all(response.serialize().as_bytes())
            .and_then(|()| writer.flush());
        if let Err(e) = written {
            tracing::debug!(error = %e, "response write failed");
            self.broken.store(true, Ordering::SeqCst);
        }
    }

    /// Write one `$`-framed packet.
    pub fn send_interleaved(&self, channel: u8, payload: &[u8]) -> Result<()> {
        let frame = framing::encode_interleaved(channel, payload)?;
        let mut writer = self.writer.lock();
        writer.write_all(&frame).inspect_err(|_| {
            self.broken.store(true, Ordering::SeqCst);
        })?;
        Ok(())
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    /// Shut the connection down; the reader sees end of stream.
    pub fn close(&self) {
        if let Some(stream) = &self.stream {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Non-blocking TCP accept loop.
///
/// Checks the `running` flag between accepts with a 50ms poll interval
/// so that [`crate::server::Server::stop`] can terminate it promptly.
pub fn accept_loop(listener: TcpListener, ctx: Arc<ServerContext>, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let ctx = ctx.clone();
                let spawned = thread::Builder::new()
                    .name(format!("rtsp-{peer}"))
                    .spawn(move || Connection::handle(stream, peer, ctx));
                if let Err(e) = spawned {
                    tracing::error!(%peer, error = %e, "failed to spawn connection thread");
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
}

/// A single RTSP client connection and the session bound to it.
struct Connection {
    reader: TcpStream,
    control: Arc<ControlChannel>,
    session: Arc<Session>,
    pending: Vec<u8>,
}

impl Connection {
    /// Entry point: set up a connection and run its request loop.
    fn handle(stream: TcpStream, peer: SocketAddr, ctx: Arc<ServerContext>) {
        tracing::info!(%peer, "client connected");

        let control = match ControlChannel::new(&stream) {
            Ok(c) => Arc::new(c),
            Err(e) => {
                tracing::warn!(%peer, error = %e, "failed to prepare control connection");
                return;
            }
        };
        let session = match Session::open(ctx, peer, control.clone()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(%peer, error = %e, "failed to open session");
                control.close();
                return;
            }
        };

        let mut conn = Connection {
            reader: stream,
            control,
            session,
            pending: Vec::with_capacity(READ_CHUNK),
        };
        let reason = conn.run();
        conn.cleanup();

        tracing::info!(%peer, session_id = %conn.session.id, reason, "client disconnected");
    }

    /// Read loop. Returns the reason for exiting.
    fn run(&mut self) -> &'static str {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if self.session.is_closed() {
                return "session closed";
            }
            let n = match self.reader.read(&mut chunk) {
                Ok(0) => return "connection closed by client",
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return "read error",
            };
            self.session.touch();
            self.pending.extend_from_slice(&chunk[..n]);

            while let Some(frame) = framing::next_frame(&mut self.pending) {
                match frame {
                    Frame::Request(text) => self.dispatch(&text),
                    Frame::Oversized => {
                        tracing::warn!(session_id = %self.session.id, "request over size limit");
                        self.control.send_response(&RtspResponse::bad_request());
                    }
                    Frame::Interleaved { channel, payload } => {
                        tracing::trace!(
                            session_id = %self.session.id,
                            channel,
                            len = payload.len(),
                            "discarding inbound interleaved frame"
                        );
                    }
                }
                if self.control.is_broken() {
                    self.session.teardown(None);
                    return "write error";
                }
                if self.session.is_closed() {
                    return "session closed";
                }
            }

            if self.pending.len() > MAX_PENDING_BYTES {
                tracing::warn!(
                    session_id = %self.session.id,
                    pending = self.pending.len(),
                    "unframed input over limit, discarding"
                );
                self.pending.clear();
            }
        }
    }

    fn dispatch(&self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        match RtspRequest::parse(text) {
            Ok(request) => {
                tracing::debug!(
                    session_id = %self.session.id,
                    method = %request.method,
                    uri = %request.uri,
                    "request"
                );
                self.session.handle(&request);
            }
            Err(e) => {
                tracing::warn!(session_id = %self.session.id, error = %e, "parse error");
                self.control.send_response(&RtspResponse::bad_request());
            }
        }
    }

    /// Interleaved sessions die with their connection; UDP sessions are left
    /// to the idle watchdog.
    fn cleanup(&self) {
        match self.session.transport_mode() {
            None | Some(TransportMode::Interleaved) => self.session.teardown(None),
            Some(mode) => {
                tracing::debug!(session_id = %self.session.id, %mode, "connection gone, session kept until timeout");
            }
        }
    }
}
