//! Media delivery transports and the RTSP control connection.
//!
//! A session delivers RTP/RTCP through exactly one [`Transport`]:
//!
//! - **Interleaved** ([`interleaved`]): packets are framed onto the RTSP TCP
//!   connection with `$` headers (RFC 2326 §10.12).
//! - **Unicast** ([`unicast`]): packets are sent from server-side UDP ports
//!   to the client's `client_port` pair.
//! - **Multicast** ([`multicast`]): one host-owned socket sends to a group
//!   address shared by every session watching the same source.
//!
//! The control connection itself (accept loop, request framing, response
//! writes) lives in [`tcp`].
//!
//! Every variant leases a loopback relay port pair per track in
//! [`Transport::configure_track`]; the track's relay listens there for the
//! producer's output and hands packets back through
//! [`Transport::on_traffic`].

pub mod interleaved;
pub mod multicast;
pub mod tcp;
pub mod unicast;

use std::fmt;
use std::net::IpAddr;

use crate::error::Result;
use crate::ports::{PortPurpose, PortRegistry};
use crate::protocol::TransportSpec;

pub use interleaved::InterleavedTransport;
pub use multicast::MulticastTransport;
pub use tcp::ControlChannel;
pub use unicast::UnicastTransport;

/// Which half of a track's stream a packet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayChannel {
    Rtp = 0,
    Rtcp = 1,
}

impl RelayChannel {
    /// Pick the RTP or RTCP element of a pair.
    pub fn select<T: Copy>(self, pair: (T, T)) -> T {
        match self {
            Self::Rtp => pair.0,
            Self::Rtcp => pair.1,
        }
    }
}

/// Delivery mode of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Interleaved,
    Unicast,
    Multicast,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interleaved => write!(f, "tcp"),
            Self::Unicast => write!(f, "udp"),
            Self::Multicast => write!(f, "udp-multicast"),
        }
    }
}

/// A session's delivery transport.
pub enum Transport {
    Interleaved(InterleavedTransport),
    Unicast(UnicastTransport),
    Multicast(MulticastTransport),
}

impl Transport {
    pub fn mode(&self) -> TransportMode {
        match self {
            Self::Interleaved(_) => TransportMode::Interleaved,
            Self::Unicast(_) => TransportMode::Unicast,
            Self::Multicast(_) => TransportMode::Multicast,
        }
    }

    /// Record the client-facing parameters of a track from its SETUP.
    ///
    /// Returns `Ok(false)` when the requested transport does not fit this
    /// one (a different mode, or unicast without `client_port`); nothing is
    /// leased in that case.
    pub fn add_track(
        &self,
        track_id: u32,
        spec: &TransportSpec,
        ports: &PortRegistry,
    ) -> Result<bool> {
        match (self, spec) {
            (Self::Interleaved(t), TransportSpec::Interleaved { channels }) => {
                t.add_track(track_id, *channels);
            }
            (
                Self::Unicast(t),
                TransportSpec::Unicast {
                    client_ports: Some(client),
                },
            ) => {
                t.add_track(track_id, *client, ports)?;
            }
            (Self::Multicast(t), TransportSpec::Multicast) => {
                t.add_track(track_id, ports)?;
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Lease the loopback port pair the track's relay will listen on.
    ///
    /// Returns the RTP port; RTCP is the port above it.
    pub fn configure_track(&self, track_id: u32, ports: &PortRegistry) -> Result<u16> {
        let port = ports.allocate(PortPurpose::Relay)?;
        let relays = match self {
            Self::Interleaved(t) => &t.relay_ports,
            Self::Unicast(t) => &t.relay_ports,
            Self::Multicast(t) => &t.relay_ports,
        };
        if let Some(previous) = relays.lock().insert(track_id, port) {
            ports.release(previous);
        }
        tracing::trace!(track_id, port, mode = %self.mode(), "relay port leased");
        Ok(port)
    }

    /// Prepare for delivery. `client` is the control connection's peer.
    pub fn on_play(&self, client: IpAddr) {
        match self {
            Self::Interleaved(_) => {}
            Self::Unicast(t) => t.open(client),
            Self::Multicast(t) => t.open(),
        }
    }

    /// Deliver one relayed packet.
    pub fn on_traffic(&self, track_id: u32, channel: RelayChannel, packet: &[u8]) -> Result<()> {
        match self {
            Self::Interleaved(t) => t.send(track_id, channel, packet),
            Self::Unicast(t) => t.send(track_id, channel, packet),
            Self::Multicast(t) => t.send(track_id, channel, packet),
        }
    }

    /// Stop delivery; per-track configuration is kept for the next PLAY.
    pub fn on_pause(&self) {
        match self {
            Self::Interleaved(_) => {}
            Self::Unicast(t) => t.close(),
            Self::Multicast(t) => t.close(),
        }
    }

    /// Close everything and release every port this transport leased.
    pub fn on_teardown(&self, ports: &PortRegistry) {
        self.on_pause();
        let (relays, own) = match self {
            Self::Interleaved(t) => (&t.relay_ports, Vec::new()),
            Self::Unicast(t) => (&t.relay_ports, t.take_server_ports()),
            Self::Multicast(t) => (&t.relay_ports, t.take_group_ports()),
        };
        let relays: Vec<u16> = relays.lock().drain().map(|(_, port)| port).collect();
        for port in relays.into_iter().chain(own) {
            ports.release(port);
        }
        tracing::debug!(mode = %self.mode(), "transport torn down");
    }

    /// `Transport` header value answering a SETUP for `track_id`, or `None`
    /// if the track is not configured on this transport.
    pub fn setup_reply(&self, track_id: u32) -> Option<String> {
        match self {
            Self::Interleaved(t) => t.reply(track_id),
            Self::Unicast(t) => t.reply(track_id),
            Self::Multicast(t) => t.reply(track_id),
        }
    }
}
