//! Per-track relay engine.
//!
//! A [`Track`] owns at most one producer process. On PLAY the relay binds a
//! loopback port pair, starts the producer pointed at it, and runs one
//! worker thread per direction ([`relay`]) that rewrites timestamps and
//! hands packets to the session's transport.

pub mod relay;

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::context::ServerContext;
use crate::error::Result;
use crate::media::rtp::media_time;
use crate::media::{MediaSelector, ProduceJob, ProducerHandle};
use crate::ports::PortPurpose;
use crate::transport::{RelayChannel, Transport};
use relay::{RelayState, RelayWorker};

/// Track map shared between a multicast host and its watchers.
pub type SharedTracks = Arc<Mutex<BTreeMap<u32, Arc<Track>>>>;

/// Range of the random initial timestamp offset.
const INITIAL_OFFSET_RANGE: std::ops::Range<u32> = 10_000..65_535;

/// What to play on the next relay start.
#[derive(Debug, Clone)]
pub struct PlaySpec {
    pub content: String,
    /// Seek position; also the media time the first packet is stamped with.
    pub offset: f64,
    pub end: Option<f64>,
    pub looping: bool,
}

struct RunningRelay {
    producer: Option<Box<dyn ProducerHandle>>,
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl RunningRelay {
    fn shutdown(mut self, grace: Duration) {
        self.stop.store(true, Ordering::Release);
        if let Some(producer) = self.producer.as_mut() {
            producer.stop(grace);
        }
        for worker in self.workers {
            let _ = worker.join();
        }
    }
}

/// One elementary stream of a session.
pub struct Track {
    pub id: u32,
    pub ssrc: u32,
    pub selector: MediaSelector,
    pub clock_rate: u32,
    initial_ts_offset: u32,
    /// Port the producer sends from.
    source_port: u16,
    /// Loopback port the relay listens on (RTCP one above).
    relay_port: u16,
    relay: Arc<RelayState>,
    running: Mutex<Option<RunningRelay>>,
    released: AtomicBool,
}

impl Track {
    /// Create a track that relays from `relay_port`. Leases the producer's
    /// source port.
    pub fn new(
        ctx: &ServerContext,
        id: u32,
        ssrc: u32,
        selector: MediaSelector,
        clock_rate: u32,
        relay_port: u16,
    ) -> Result<Self> {
        let source_port = ctx.ports.allocate(PortPurpose::Relay)?;
        let config = &ctx.config;
        let initial_ts_offset = if config.zero_initial_timestamp {
            0
        } else {
            rand::random_range(INITIAL_OFFSET_RANGE)
        };
        let last_seq = if config.seq_start_at_one {
            0
        } else {
            rand::random_range(0..u16::MAX)
        };
        tracing::debug!(track_id = id, ssrc, ?selector, clock_rate, relay_port, source_port, "track created");
        Ok(Self {
            id,
            ssrc,
            selector,
            clock_rate,
            initial_ts_offset,
            source_port,
            relay_port,
            relay: Arc::new(RelayState::new(last_seq)),
            running: Mutex::new(None),
            released: AtomicBool::new(false),
        })
    }

    pub fn last_seq(&self) -> u16 {
        self.relay.last_seq()
    }

    pub fn initial_ts_offset(&self) -> u32 {
        self.initial_ts_offset
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// RTP timestamp of media position `offset` on this track's timeline.
    pub fn rtptime(&self, offset: f64) -> u32 {
        let ts = media_time(self.clock_rate, offset) + self.initial_ts_offset as i64;
        ts.rem_euclid(1 << 32) as u32
    }

    /// `RTP-Info` entry for this track (RFC 2326 §12.33).
    pub fn rtp_info(&self, url: &str, offset: f64, zero_rtptime: bool) -> String {
        let rtptime = if zero_rtptime { 0 } else { self.rtptime(offset) };
        format!(
            "url={url}/trackID={};seq={};rtptime={rtptime}",
            self.id,
            self.last_seq().wrapping_add(1)
        )
    }

    /// Start the producer and relay workers. Failures are logged; the track
    /// stays silent until the next start.
    pub fn start(&self, ctx: &ServerContext, transport: Arc<Transport>, play: &PlaySpec) {
        let mut running = self.running.lock();
        if running.is_some() {
            tracing::warn!(track_id = self.id, "relay already running");
            return;
        }

        self.relay
            .reset(media_time(self.clock_rate, play.offset) + self.initial_ts_offset as i64);

        let stop = Arc::new(AtomicBool::new(false));
        let mut channels = vec![(RelayChannel::Rtp, self.relay_port)];
        if !ctx.config.disable_rtcp {
            channels.push((RelayChannel::Rtcp, self.relay_port + 1));
        }

        let mut workers = Vec::with_capacity(channels.len());
        for (channel, port) in channels {
            let socket = match bind_relay_socket(port, ctx.config.relay_recv_timeout()) {
                Ok(socket) => socket,
                Err(e) => {
                    tracing::error!(track_id = self.id, port, error = %e, "relay port unavailable, not relaying");
                    RunningRelay { producer: None, stop, workers }.shutdown(Duration::ZERO);
                    return;
                }
            };
            let worker = RelayWorker {
                socket,
                channel,
                state: self.relay.clone(),
                transport: transport.clone(),
                track_id: self.id,
                stop: stop.clone(),
            };
            let spawned = thread::Builder::new()
                .name(format!("relay-{}-{:?}", self.id, channel).to_lowercase())
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    tracing::error!(track_id = self.id, error = %e, "failed to spawn relay worker");
                    RunningRelay { producer: None, stop, workers }.shutdown(Duration::ZERO);
                    return;
                }
            }
        }

        let job = ProduceJob {
            content: play.content.clone(),
            ssrc: self.ssrc,
            first_seq: self.last_seq().wrapping_add(1),
            start: play.offset,
            end: play.end,
            looping: play.looping,
            selector: self.selector,
            destination: SocketAddr::from((Ipv4Addr::LOCALHOST, self.relay_port)),
            local_port: self.source_port,
        };
        let producer = match ctx.media.producer.spawn(&job) {
            Ok(producer) => producer,
            Err(e) => {
                tracing::error!(track_id = self.id, error = %e, "failed to start producer");
                RunningRelay { producer: None, stop, workers }.shutdown(Duration::ZERO);
                return;
            }
        };

        tracing::debug!(track_id = self.id, offset = play.offset, end = ?play.end, "relay started");
        *running = Some(RunningRelay {
            producer: Some(producer),
            stop,
            workers,
        });
    }

    /// Stop the producer and wait for the relay workers to exit. Ports are
    /// kept for the next start.
    pub fn stop(&self, grace: Duration) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            running.shutdown(grace);
            tracing::debug!(track_id = self.id, "relay stopped");
        }
        self.relay.clear();
    }

    /// Stop and release the producer's source port. Only the first call
    /// releases.
    pub fn teardown(&self, ctx: &ServerContext) {
        self.stop(ctx.config.producer_stop_grace());
        if !self.released.swap(true, Ordering::AcqRel) {
            ctx.ports.release(self.source_port);
        }
    }
}

fn bind_relay_socket(port: u16, timeout: Duration) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, port))?;
    socket.set_read_timeout(Some(timeout))?;
    Ok(socket)
}
