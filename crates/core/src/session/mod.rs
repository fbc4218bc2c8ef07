//! RTSP session state machine (RFC 2326 §3, §A.1).
//!
//! One [`Session`] exists per control connection. It dispatches requests
//! through the [`SessionState`] table, builds tracks and transports on
//! SETUP, starts and stops track relays on PLAY and PAUSE, and releases
//! everything on TEARDOWN.
//!
//! ```text
//! OPTIONS   → compat / multicast / live detection, Public list
//! DESCRIBE  → resolve source, SDP, track counts        (Init+)
//! SETUP     → transport + track                         Init|Ready → Ready
//! PLAY      → RTP-Info, start relays                    Ready → Playing
//! PAUSE     → accumulate offset, stop relays            Playing → Ready
//! TEARDOWN  → release, close                            any → TornDown
//! ```
//!
//! A per-session watchdog tears the session down when no bytes arrive on
//! the control connection for the configured timeout.

pub mod registry;
pub mod state;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::context::ServerContext;
use crate::media::{ContentSource, DescribeRequest, MediaSelector};
use crate::multicast::Membership;
use crate::ports::PortPurpose;
use crate::protocol::{Method, RtspRequest, RtspResponse, TransportSpec};
use crate::track::{PlaySpec, SharedTracks, Track};
use crate::transport::{
    ControlChannel, InterleavedTransport, Transport, TransportMode, UnicastTransport,
};

pub use registry::SessionRegistry;
pub use state::SessionState;

/// Whether playback position is under the client's control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveMode {
    /// Seekable and pausable.
    Off,
    /// Treated as live by policy (legacy client, shared multicast, config).
    Forced,
    /// The source itself is live.
    TrueLive,
}

impl LiveMode {
    pub fn is_live(self) -> bool {
        self != Self::Off
    }
}

/// What the last DESCRIBE learned about the source.
#[derive(Debug, Clone)]
struct Description {
    video_tracks: usize,
    audio_tracks: usize,
    ssrcs: Vec<u32>,
    clock_rates: Vec<u32>,
    duration: Option<f64>,
}

impl Description {
    fn track_count(&self) -> usize {
        self.video_tracks + self.audio_tracks
    }
}

struct SessionInner {
    state: SessionState,
    url: String,
    source: Option<ContentSource>,
    live: LiveMode,
    compat: bool,
    wants_multicast: bool,
    description: Option<Description>,
    transport: Option<Arc<Transport>>,
    tracks: SharedTracks,
    multicast: Option<Membership>,
    play_offset: f64,
    play_started: Option<Instant>,
}

impl SessionInner {
    /// Whether this session's requests start and stop the producers.
    fn drives_playback(&self) -> bool {
        self.multicast.as_ref().is_none_or(|m| m.host)
    }
}

/// A client's RTSP session.
pub struct Session {
    pub id: String,
    pub peer: SocketAddr,
    control: Arc<ControlChannel>,
    ctx: Arc<ServerContext>,
    inner: Mutex<SessionInner>,
    activity: Mutex<bool>,
    activity_cv: Condvar,
    closed: AtomicBool,
}

impl Session {
    /// Create and register a session for a new control connection and start
    /// its idle watchdog.
    pub fn open(
        ctx: Arc<ServerContext>,
        peer: SocketAddr,
        control: Arc<ControlChannel>,
    ) -> io::Result<Arc<Self>> {
        let config = ctx.config.clone();
        let session = ctx.sessions.register_with(|id| {
            Arc::new(Session {
                id,
                peer,
                control,
                ctx: ctx.clone(),
                inner: Mutex::new(SessionInner {
                    state: SessionState::Init,
                    url: String::new(),
                    source: None,
                    live: if config.force_live {
                        LiveMode::Forced
                    } else {
                        LiveMode::Off
                    },
                    compat: config.always_compat,
                    wants_multicast: false,
                    description: None,
                    transport: None,
                    tracks: SharedTracks::default(),
                    multicast: None,
                    play_offset: 0.0,
                    play_started: None,
                }),
                activity: Mutex::new(true),
                activity_cv: Condvar::new(),
                closed: AtomicBool::new(false),
            })
        });

        let watched = session.clone();
        let spawned = thread::Builder::new()
            .name(format!("watchdog-{}", session.id))
            .spawn(move || watched.watch());
        if let Err(e) = spawned {
            ctx.sessions.remove(&session.id);
            return Err(e);
        }
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn play_offset(&self) -> f64 {
        self.inner.lock().play_offset
    }

    pub fn live_mode(&self) -> LiveMode {
        self.inner.lock().live
    }

    pub fn is_compat(&self) -> bool {
        self.inner.lock().compat
    }

    pub fn transport(&self) -> Option<Arc<Transport>> {
        self.inner.lock().transport.clone()
    }

    pub fn transport_mode(&self) -> Option<TransportMode> {
        self.inner.lock().transport.as_ref().map(|t| t.mode())
    }

    pub fn tracks(&self) -> SharedTracks {
        self.inner.lock().tracks.clone()
    }

    pub fn membership(&self) -> Option<Membership> {
        self.inner.lock().multicast.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Value of the `Session` response header.
    pub fn session_header(&self) -> String {
        format!("{};timeout={}", self.id, self.ctx.config.session_timeout_secs)
    }

    /// Record inbound activity on the control connection.
    pub fn touch(&self) {
        *self.activity.lock() = true;
        self.activity_cv.notify_one();
    }

    /// Dispatch one request. Replies are written to the control connection.
    pub fn handle(&self, request: &RtspRequest) {
        let cseq = request.cseq();

        let Some(method) = Method::parse(&request.method) else {
            tracing::warn!(session_id = %self.id, method = %request.method, "unknown method");
            self.respond(cseq, RtspResponse::bad_request());
            return;
        };
        if !method.is_implemented() {
            self.respond(cseq, RtspResponse::status(501));
            return;
        }

        let mut inner = self.inner.lock();
        if !inner.state.permits(method) {
            tracing::debug!(session_id = %self.id, %method, state = %inner.state, "method not valid in state");
            drop(inner);
            self.respond(cseq, RtspResponse::status(455));
            return;
        }

        let response = match method {
            Method::Options => self.options(&mut inner, request),
            Method::Describe => self.describe(&mut inner, request),
            Method::Setup => self.setup(&mut inner, request),
            Method::Play => {
                self.play(&mut inner, request);
                return;
            }
            Method::Pause => {
                self.pause(&mut inner, cseq);
                return;
            }
            Method::GetParameter => self.with_session(RtspResponse::ok()),
            Method::Teardown => {
                drop(inner);
                self.teardown(cseq);
                return;
            }
            Method::SetParameter | Method::Announce | Method::Record | Method::Redirect => {
                RtspResponse::status(501)
            }
        };
        drop(inner);
        self.respond(cseq, response);
    }

    fn options(&self, inner: &mut SessionInner, request: &RtspRequest) -> RtspResponse {
        let config = &self.ctx.config;
        let legacy = request
            .get_header("User-Agent")
            .is_some_and(|ua| config.is_legacy_client(ua));
        inner.compat = inner.compat || legacy;
        inner.wants_multicast = request.mentions("multicast");

        let shared_multicast = inner.wants_multicast && !self.ctx.multicast.policy().host_controls();
        if inner.live == LiveMode::Off && (inner.compat || shared_multicast) {
            inner.live = LiveMode::Forced;
        }

        tracing::debug!(
            session_id = %self.id,
            compat = inner.compat,
            multicast = inner.wants_multicast,
            live = ?inner.live,
            "options"
        );

        let methods: Vec<&str> = [
            Method::Options,
            Method::Describe,
            Method::Setup,
            Method::Play,
            Method::Pause,
            Method::Teardown,
            Method::GetParameter,
        ]
        .into_iter()
        .filter(|m| !(inner.live.is_live() && *m == Method::Pause))
        .map(Method::as_str)
        .collect();
        RtspResponse::ok().add_header("Public", &methods.join(", "))
    }

    fn describe(&self, inner: &mut SessionInner, request: &RtspRequest) -> RtspResponse {
        let ctx = &self.ctx;
        let Some(source) = ctx.media.resolver.resolve(request) else {
            tracing::debug!(session_id = %self.id, uri = %request.uri, "no content for uri");
            return RtspResponse::not_found();
        };
        if source.live {
            inner.live = LiveMode::TrueLive;
        }

        let mut url = request.uri.trim_end_matches('/').to_string();
        let mut target = ctx
            .config
            .public_host
            .clone()
            .or_else(|| url_host(&url).map(str::to_string))
            .unwrap_or_else(|| self.peer.ip().to_string());

        if inner.wants_multicast && ctx.config.allow_udp_multicast {
            let membership = match self.multicast_membership(inner, &source.path) {
                Ok(m) => m,
                Err(response) => return response,
            };
            let group = membership.group.address.to_string();
            url = with_host(&url, &group);
            target = group;
        }

        let port = match ctx.ports.allocate(PortPurpose::Describe) {
            Ok(port) => port,
            Err(e) => {
                tracing::error!(session_id = %self.id, error = %e, "no describe port");
                return RtspResponse::status(500);
            }
        };
        let described = ctx.media.describer.describe(&DescribeRequest {
            source: &source,
            target: &target,
            port,
            live: inner.live.is_live(),
            compat: inner.compat,
        });
        ctx.ports.release(port);

        let description = match described {
            Ok(d) => d,
            Err(e) => {
                tracing::error!(session_id = %self.id, source = %source.path, error = %e, "describe failed");
                return RtspResponse::status(500);
            }
        };

        let (ssrcs, duration) = match inner.description.take() {
            Some(previous) => (previous.ssrcs, previous.duration),
            None => (description.ssrcs, description.duration),
        };
        inner.description = Some(Description {
            video_tracks: description.video_tracks,
            audio_tracks: description.audio_tracks,
            ssrcs,
            clock_rates: description.clock_rates,
            duration,
        });
        inner.source = Some(source);
        inner.url = url;

        tracing::debug!(
            session_id = %self.id,
            url = %inner.url,
            video = description.video_tracks,
            audio = description.audio_tracks,
            "described"
        );

        RtspResponse::ok()
            .add_header("Content-Base", &format!("{}/", inner.url))
            .add_header("Content-Type", "application/sdp")
            .with_body(description.sdp)
    }

    /// Existing membership for `source`, or a fresh join (leaving any group
    /// for a different source first).
    fn multicast_membership(
        &self,
        inner: &mut SessionInner,
        source: &str,
    ) -> Result<Membership, RtspResponse> {
        if let Some(m) = &inner.multicast {
            if m.group.source == source {
                return Ok(m.clone());
            }
        }
        if let Some(previous) = inner.multicast.take() {
            self.leave_group(inner, previous);
        }
        match self.ctx.multicast.join(source, &self.id) {
            Ok(m) => {
                inner.multicast = Some(m.clone());
                Ok(m)
            }
            Err(e) => {
                tracing::error!(session_id = %self.id, error = %e, "multicast join failed");
                Err(RtspResponse::status(500))
            }
        }
    }

    fn setup(&self, inner: &mut SessionInner, request: &RtspRequest) -> RtspResponse {
        let ctx = &self.ctx;
        let config = &ctx.config;

        let Some(description) = inner.description.clone() else {
            return RtspResponse::status(455);
        };
        let track_id = request.track_id();
        let index = track_id as usize;
        if index >= description.track_count() {
            tracing::debug!(session_id = %self.id, track_id, "unknown track");
            return RtspResponse::not_found();
        }

        let Some(spec) = request.get_header("Transport").and_then(TransportSpec::parse) else {
            return RtspResponse::status(461);
        };
        let allowed = match spec {
            TransportSpec::Interleaved { .. } => config.allow_tcp,
            TransportSpec::Unicast { client_ports } => {
                config.allow_udp_unicast && client_ports.is_some()
            }
            TransportSpec::Multicast => config.allow_udp_multicast && inner.wants_multicast,
        };
        if !allowed {
            tracing::debug!(session_id = %self.id, ?spec, "transport refused");
            return RtspResponse::status(461);
        }

        let transport = match inner.transport.clone() {
            Some(existing) if existing.mode() != spec_mode(&spec) => {
                tracing::debug!(session_id = %self.id, mode = %existing.mode(), "transport mode change refused");
                return RtspResponse::status(461);
            }
            Some(existing) => existing,
            None => {
                let transport = match spec {
                    TransportSpec::Interleaved { .. } => {
                        self.drop_membership(inner);
                        Arc::new(Transport::Interleaved(InterleavedTransport::new(
                            self.control.clone(),
                        )))
                    }
                    TransportSpec::Unicast { .. } => {
                        self.drop_membership(inner);
                        Arc::new(Transport::Unicast(UnicastTransport::new()))
                    }
                    TransportSpec::Multicast => {
                        let Some(source) = inner.source.as_ref().map(|s| s.path.clone()) else {
                            return RtspResponse::status(455);
                        };
                        let membership = match self.multicast_membership(inner, &source) {
                            Ok(m) => m,
                            Err(response) => return response,
                        };
                        inner.tracks = membership.group.tracks.clone();
                        membership.group.transport.clone()
                    }
                };
                inner.transport = Some(transport.clone());
                transport
            }
        };

        if !inner.drives_playback() {
            // Watchers share the host's transport and tracks as-is.
            return match transport.setup_reply(track_id) {
                Some(line) => {
                    inner.state = SessionState::Ready;
                    self.with_session(RtspResponse::ok().add_header("Transport", &line))
                }
                None => {
                    tracing::debug!(session_id = %self.id, track_id, "host has not set up track");
                    RtspResponse::status(455)
                }
            };
        }

        let configured = transport
            .add_track(track_id, &spec, &ctx.ports)
            .and_then(|fits| {
                if !fits {
                    return Ok(None);
                }
                let relay_port = transport.configure_track(track_id, &ctx.ports)?;
                let ssrc = description
                    .ssrcs
                    .get(index)
                    .copied()
                    .unwrap_or_else(rand::random);
                let clock_rate = description.clock_rates.get(index).copied().unwrap_or(90_000);
                let selector = MediaSelector::for_track(track_id, description.video_tracks);
                Track::new(ctx, track_id, ssrc, selector, clock_rate, relay_port).map(Some)
            });

        let track = match configured {
            Ok(Some(track)) => Arc::new(track),
            Ok(None) => return RtspResponse::status(461),
            Err(e) => {
                tracing::error!(session_id = %self.id, track_id, error = %e, "setup failed");
                return RtspResponse::status(500);
            }
        };

        let replaced = inner.tracks.lock().insert(track_id, track);
        if let Some(old) = replaced {
            old.teardown(ctx);
        }

        let Some(line) = transport.setup_reply(track_id) else {
            return RtspResponse::status(500);
        };
        inner.state = SessionState::Ready;
        tracing::debug!(session_id = %self.id, track_id, transport = %line, "track set up");
        self.with_session(RtspResponse::ok().add_header("Transport", &line))
    }

    /// Whether this session may seek and pause.
    fn controls_stream(&self, inner: &SessionInner) -> bool {
        match &inner.multicast {
            None => true,
            Some(m) => m.host && self.ctx.multicast.policy().host_controls(),
        }
    }

    fn play(&self, inner: &mut SessionInner, request: &RtspRequest) {
        let cseq = request.cseq();
        let ctx = &self.ctx;

        let (start, mut end) = request.npt_range().unwrap_or((inner.play_offset, None));
        let repositioned = start != inner.play_offset;
        let invalid = (inner.live.is_live() && repositioned)
            || end.is_some_and(|e| e < start)
            || (!self.controls_stream(inner) && repositioned);
        if invalid {
            tracing::debug!(session_id = %self.id, start, ?end, offset = inner.play_offset, "invalid range");
            self.respond(cseq, RtspResponse::status(457));
            return;
        }

        if !inner.live.is_live() {
            if let Some(duration) = inner.description.as_ref().and_then(|d| d.duration) {
                if start > duration {
                    self.respond(cseq, RtspResponse::status(416));
                    return;
                }
                end = end.map(|e| e.min(duration));
            }
        }
        inner.play_offset = start;

        let drives = inner.drives_playback();
        let tracks: Vec<Arc<Track>> = inner.tracks.lock().values().cloned().collect();
        if drives {
            for track in &tracks {
                track.stop(ctx.config.producer_stop_grace());
            }
        }

        let zero_rtptime = inner.compat || ctx.config.report_zero_rtptime;
        let rtp_info: Vec<String> = tracks
            .iter()
            .map(|t| t.rtp_info(&inner.url, inner.play_offset, zero_rtptime))
            .collect();

        let response = self.with_session(
            RtspResponse::ok()
                .add_header("Range", &format!("npt={:.3}-", inner.play_offset))
                .add_header("RTP-Info", &rtp_info.join(",")),
        );
        self.respond(cseq, response);
        inner.state = SessionState::Playing;
        tracing::debug!(session_id = %self.id, offset = inner.play_offset, ?end, tracks = tracks.len(), "playing");

        if drives {
            if let (Some(transport), Some(source)) = (&inner.transport, &inner.source) {
                transport.on_play(self.peer.ip());
                let play = PlaySpec {
                    content: source.path.clone(),
                    offset: inner.play_offset,
                    end,
                    looping: ctx.config.stream_loop && inner.live == LiveMode::Forced,
                };
                for track in &tracks {
                    track.start(ctx, transport.clone(), &play);
                }
            }
        }
        inner.play_started = Some(Instant::now());
    }

    /// The reply goes out before the relays stop; stopping a producer can
    /// take up to the stop grace.
    fn pause(&self, inner: &mut SessionInner, cseq: Option<&str>) {
        if inner.live.is_live() || !self.controls_stream(inner) {
            self.respond(cseq, RtspResponse::status(455));
            return;
        }

        if let Some(started) = inner.play_started.take() {
            inner.play_offset += started.elapsed().as_secs_f64();
        }
        inner.state = SessionState::Ready;
        self.respond(cseq, self.with_session(RtspResponse::ok()));

        if let Some(transport) = &inner.transport {
            transport.on_pause();
        }
        let tracks: Vec<Arc<Track>> = inner.tracks.lock().values().cloned().collect();
        for track in tracks {
            track.stop(self.ctx.config.producer_stop_grace());
        }
        tracing::debug!(session_id = %self.id, offset = inner.play_offset, "paused");
    }

    /// Release everything and close the control connection. Safe to call
    /// from any thread, any number of times.
    ///
    /// With a `cseq` (a client TEARDOWN) a 200 reply is sent first.
    pub fn teardown(&self, cseq: Option<&str>) {
        let mut inner = self.inner.lock();
        if !inner.state.is_live() {
            return;
        }

        let release = match inner.multicast.take() {
            Some(membership) => self.leave_group(&mut inner, membership),
            None => true,
        };
        self.release(&mut inner);
        inner.state = SessionState::TornDown;
        self.closed.store(true, Ordering::SeqCst);
        drop(inner);

        if cseq.is_some() {
            self.respond(cseq, self.with_session(RtspResponse::ok()));
        }
        self.control.close();
        self.ctx.sessions.remove(&self.id);
        self.activity_cv.notify_all();
        tracing::info!(session_id = %self.id, peer = %self.peer, released = release, "session torn down");
    }

    /// Tear down every track and the transport.
    fn release(&self, inner: &mut SessionInner) {
        let tracks: Vec<Arc<Track>> = {
            let mut map = inner.tracks.lock();
            let drained = map.values().cloned().collect();
            map.clear();
            drained
        };
        for track in tracks {
            track.teardown(&self.ctx);
        }
        if let Some(transport) = &inner.transport {
            transport.on_teardown(&self.ctx.ports);
        }
    }

    /// Leave a group and detach from its shared transport. Returns `true` if
    /// this session released the group.
    fn leave_group(&self, inner: &mut SessionInner, membership: Membership) -> bool {
        let released = self.ctx.multicast.leave(&membership, &self.id);
        if released {
            let tracks: Vec<Arc<Track>> = {
                let mut map = membership.group.tracks.lock();
                let drained = map.values().cloned().collect();
                map.clear();
                drained
            };
            for track in tracks {
                track.teardown(&self.ctx);
            }
            membership.group.transport.on_teardown(&self.ctx.ports);
        }
        if inner
            .transport
            .as_ref()
            .is_some_and(|t| Arc::ptr_eq(t, &membership.group.transport))
        {
            inner.transport = None;
            inner.tracks = SharedTracks::default();
        }
        released
    }

    /// Leave any multicast group joined at DESCRIBE; the session is
    /// switching to a unicast transport.
    fn drop_membership(&self, inner: &mut SessionInner) {
        if let Some(membership) = inner.multicast.take() {
            tracing::debug!(session_id = %self.id, group = %membership.group.address, "leaving multicast group for unicast setup");
            self.leave_group(inner, membership);
        }
    }

    fn with_session(&self, response: RtspResponse) -> RtspResponse {
        response.add_header("Session", &self.session_header())
    }

    fn respond(&self, cseq: Option<&str>, response: RtspResponse) {
        let response = match cseq {
            Some(cseq) => response.add_header("CSeq", cseq),
            None => response,
        };
        tracing::debug!(session_id = %self.id, status = response.status_code, "response");
        self.control.send_response(&response);
    }

    /// Idle watchdog: tears the session down after a full timeout without
    /// inbound activity.
    fn watch(self: Arc<Self>) {
        let timeout = self.ctx.config.session_timeout();
        loop {
            let mut active = self.activity.lock();
            let waited = self.activity_cv.wait_while_for(
                &mut active,
                |active| !*active && !self.closed.load(Ordering::SeqCst),
                timeout,
            );
            if self.is_closed() {
                return;
            }
            if waited.timed_out() && !*active {
                drop(active);
                tracing::info!(session_id = %self.id, peer = %self.peer, "session timed out");
                self.teardown(None);
                return;
            }
            *active = false;
        }
    }
}

fn spec_mode(spec: &TransportSpec) -> TransportMode {
    match spec {
        TransportSpec::Interleaved { .. } => TransportMode::Interleaved,
        TransportSpec::Unicast { .. } => TransportMode::Unicast,
        TransportSpec::Multicast => TransportMode::Multicast,
    }
}

/// Host part of an `rtsp://host[:port]/path` URL.
fn url_host(url: &str) -> Option<&str> {
    let rest = url.split_once("://")?.1;
    let authority = rest.split('/').next()?;
    let host = match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    };
    (!host.is_empty()).then_some(host)
}

/// Replace the host of an `rtsp://host[:port]/path` URL.
fn with_host(url: &str, host: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let (authority, path) = match rest.find('/') {
        Some(slash) => rest.split_at(slash),
        None => (rest, ""),
    };
    let port = match authority.rsplit_once(':') {
        Some((_, port)) if port.chars().all(|c| c.is_ascii_digit()) => Some(port),
        _ => None,
    };
    match port {
        Some(port) => format!("{scheme}://{host}:{port}{path}"),
        None => format!("{scheme}://{host}{path}"),
    }
}
