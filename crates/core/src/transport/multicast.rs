use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};

use parking_lot::Mutex;

use super::RelayChannel;
use crate::error::{Result, RtspError};
use crate::ports::{PortPurpose, PortRegistry};

/// RTP/RTCP sent to a multicast group.
///
/// Created by the group's host; watchers share it without ever opening or
/// closing the socket.
pub struct MulticastTransport {
    group: Ipv4Addr,
    ttl: u32,
    ports: Mutex<HashMap<u32, u16>>,
    socket: Mutex<Option<UdpSocket>>,
    pub(super) relay_ports: Mutex<HashMap<u32, u16>>,
}

impl MulticastTransport {
    pub fn new(group: Ipv4Addr, ttl: u32) -> Self {
        Self {
            group,
            ttl,
            ports: Mutex::new(HashMap::new()),
            socket: Mutex::new(None),
            relay_ports: Mutex::new(HashMap::new()),
        }
    }

    /// Lease the group port pair a track is delivered on.
    pub fn add_track(&self, track_id: u32, ports: &PortRegistry) -> Result<u16> {
        let port = ports.allocate(PortPurpose::Unicast)?;
        if let Some(previous) = self.ports.lock().insert(track_id, port) {
            ports.release(previous);
        }
        tracing::trace!(track_id, group = %self.group, port, "multicast ports");
        Ok(port)
    }

    pub(super) fn open(&self) {
        let mut socket = self.socket.lock();
        if socket.is_some() {
            return;
        }
        let bound = UdpSocket::bind("0.0.0.0:0").and_then(|s| {
            s.set_multicast_ttl_v4(self.ttl)?;
            Ok(s)
        });
        match bound {
            Ok(s) => *socket = Some(s),
            Err(e) => tracing::error!(group = %self.group, error = %e, "failed to open multicast socket"),
        }
    }

    pub(super) fn send(&self, track_id: u32, channel: RelayChannel, packet: &[u8]) -> Result<()> {
        let port = self
            .ports
            .lock()
            .get(&track_id)
            .copied()
            .ok_or(RtspError::UnknownTrack(track_id))?;
        let target = SocketAddrV4::new(self.group, channel.select((port, port + 1)));
        let socket = self.socket.lock();
        let socket = socket.as_ref().ok_or(RtspError::UnknownTrack(track_id))?;
        socket.send_to(packet, target)?;
        Ok(())
    }

    pub(super) fn close(&self) {
        self.socket.lock().take();
    }

    pub(super) fn take_group_ports(&self) -> Vec<u16> {
        self.ports.lock().drain().map(|(_, port)| port).collect()
    }

    pub(super) fn reply(&self, track_id: u32) -> Option<String> {
        let port = *self.ports.lock().get(&track_id)?;
        Some(format!(
            "RTP/AVP/UDP;multicast;destination={};port={}-{};ttl={}",
            self.group,
            port,
            port + 1,
            self.ttl
        ))
    }
}
