use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, UdpSocket};

use parking_lot::Mutex;

use super::RelayChannel;
use crate::error::{Result, RtspError};
use crate::ports::{PortPurpose, PortRegistry};

#[derive(Debug, Clone, Copy)]
struct UnicastTrack {
    client_ports: (u16, u16),
    server_port: u16,
}

impl UnicastTrack {
    fn server_ports(&self) -> (u16, u16) {
        (self.server_port, self.server_port + 1)
    }
}

struct OpenTrack {
    sockets: (UdpSocket, UdpSocket),
    client: (SocketAddr, SocketAddr),
}

/// RTP/RTCP sent from a leased server port pair to the client's ports.
pub struct UnicastTransport {
    tracks: Mutex<HashMap<u32, UnicastTrack>>,
    open: Mutex<HashMap<u32, OpenTrack>>,
    pub(super) relay_ports: Mutex<HashMap<u32, u16>>,
}

impl Default for UnicastTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UnicastTransport {
    pub fn new() -> Self {
        Self {
            tracks: Mutex::new(HashMap::new()),
            open: Mutex::new(HashMap::new()),
            relay_ports: Mutex::new(HashMap::new()),
        }
    }

    /// Lease the server port pair for a track and remember the client's.
    ///
    /// Returns the server RTP port.
    pub fn add_track(
        &self,
        track_id: u32,
        client_ports: (u16, u16),
        ports: &PortRegistry,
    ) -> Result<u16> {
        let server_port = ports.allocate(PortPurpose::Unicast)?;
        let previous = self.tracks.lock().insert(
            track_id,
            UnicastTrack {
                client_ports,
                server_port,
            },
        );
        if let Some(previous) = previous {
            ports.release(previous.server_port);
        }
        tracing::trace!(
            track_id,
            server_port,
            client_rtp = client_ports.0,
            client_rtcp = client_ports.1,
            "unicast ports"
        );
        Ok(server_port)
    }

    /// Bind every track's server ports. Bind failures are logged and leave
    /// that track silent.
    pub(super) fn open(&self, client: IpAddr) {
        let tracks: Vec<(u32, UnicastTrack)> =
            self.tracks.lock().iter().map(|(id, t)| (*id, *t)).collect();
        let mut open = self.open.lock();
        for (track_id, track) in tracks {
            if open.contains_key(&track_id) {
                continue;
            }
            let (rtp, rtcp) = track.server_ports();
            let sockets = match (UdpSocket::bind(("0.0.0.0", rtp)), UdpSocket::bind(("0.0.0.0", rtcp))) {
                (Ok(a), Ok(b)) => (a, b),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::error!(track_id, port = rtp, error = %e, "failed to bind server ports");
                    continue;
                }
            };
            let client_addrs = (
                SocketAddr::new(client, track.client_ports.0),
                SocketAddr::new(client, track.client_ports.1),
            );
            open.insert(
                track_id,
                OpenTrack {
                    sockets,
                    client: client_addrs,
                },
            );
        }
    }

    pub(super) fn send(&self, track_id: u32, channel: RelayChannel, packet: &[u8]) -> Result<()> {
        let open = self.open.lock();
        let track = open.get(&track_id).ok_or(RtspError::UnknownTrack(track_id))?;
        let socket = match channel {
            RelayChannel::Rtp => &track.sockets.0,
            RelayChannel::Rtcp => &track.sockets.1,
        };
        socket.send_to(packet, channel.select(track.client))?;
        Ok(())
    }

    pub(super) fn close(&self) {
        self.open.lock().clear();
    }

    pub(super) fn take_server_ports(&self) -> Vec<u16> {
        self.tracks.lock().drain().map(|(_, t)| t.server_port).collect()
    }

    pub(super) fn reply(&self, track_id: u32) -> Option<String> {
        let track = *self.tracks.lock().get(&track_id)?;
        let (c0, c1) = track.client_ports;
        let (s0, s1) = track.server_ports();
        Some(format!(
            "RTP/AVP;unicast;client_port={c0}-{c1};server_port={s0}-{s1}"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::PortRange;
    use crate::transport::Transport;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn registry(base: u16) -> PortRegistry {
        PortRegistry::new(
            PortRange::new(base, base + 10),
            PortRange::new(base + 10, base + 20),
            PortRange::new(base + 20, base + 30),
        )
    }

    #[test]
    fn setup_reply_lists_both_port_pairs() {
        let ports = registry(42000);
        let transport = UnicastTransport::new();
        let server = transport.add_track(0, (5000, 5001), &ports).unwrap();
        assert_eq!(server, 42010);
        assert_eq!(
            transport.reply(0).as_deref(),
            Some("RTP/AVP;unicast;client_port=5000-5001;server_port=42010-42011")
        );
    }

    #[test]
    fn delivers_to_client_ports_after_play() {
        let ports = registry(42100);
        let client_rtp = UdpSocket::bind("127.0.0.1:0").unwrap();
        let client_rtcp = UdpSocket::bind("127.0.0.1:0").unwrap();
        client_rtp.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        client_rtcp.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let pair = (
            client_rtp.local_addr().unwrap().port(),
            client_rtcp.local_addr().unwrap().port(),
        );

        let inner = UnicastTransport::new();
        inner.add_track(0, pair, &ports).unwrap();
        let transport = Transport::Unicast(inner);

        // Nothing is bound before PLAY.
        assert!(transport.on_traffic(0, RelayChannel::Rtp, b"x").is_err());

        transport.on_play(IpAddr::V4(Ipv4Addr::LOCALHOST));
        transport.on_traffic(0, RelayChannel::Rtp, b"rtp").unwrap();
        transport.on_traffic(0, RelayChannel::Rtcp, b"rtcp").unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = client_rtp.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"rtp");
        assert_eq!(from.port(), 42110);
        let (n, from) = client_rtcp.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"rtcp");
        assert_eq!(from.port(), 42111);

        transport.on_pause();
        assert!(transport.on_traffic(0, RelayChannel::Rtp, b"x").is_err());

        transport.on_teardown(&ports);
        assert_eq!(ports.leased_count(), 0);
    }
}
