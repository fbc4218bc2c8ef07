use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{ControlChannel, RelayChannel};
use crate::error::{Result, RtspError};

/// RTP/RTCP framed onto the RTSP connection (RFC 2326 §10.12).
pub struct InterleavedTransport {
    control: Arc<ControlChannel>,
    channels: Mutex<HashMap<u32, (u8, u8)>>,
    pub(super) relay_ports: Mutex<HashMap<u32, u16>>,
}

impl InterleavedTransport {
    pub fn new(control: Arc<ControlChannel>) -> Self {
        Self {
            control,
            channels: Mutex::new(HashMap::new()),
            relay_ports: Mutex::new(HashMap::new()),
        }
    }

    /// Record the channel pair for a track; defaults to
    /// `(2·track, 2·track + 1)` when the client did not ask for one.
    pub fn add_track(&self, track_id: u32, requested: Option<(u8, u8)>) -> (u8, u8) {
        let channels = requested.unwrap_or_else(|| default_channels(track_id));
        self.channels.lock().insert(track_id, channels);
        tracing::trace!(track_id, rtp = channels.0, rtcp = channels.1, "interleaved channels");
        channels
    }

    pub(super) fn send(&self, track_id: u32, channel: RelayChannel, packet: &[u8]) -> Result<()> {
        let pair = self
            .channels
            .lock()
            .get(&track_id)
            .copied()
            .ok_or(RtspError::UnknownTrack(track_id))?;
        self.control.send_interleaved(channel.select(pair), packet)
    }

    pub(super) fn reply(&self, track_id: u32) -> Option<String> {
        let (rtp, rtcp) = *self.channels.lock().get(&track_id)?;
        Some(format!("RTP/AVP/TCP;unicast;interleaved={rtp}-{rtcp}"))
    }
}

fn default_channels(track_id: u32) -> (u8, u8) {
    let rtp = (track_id * 2).min(254) as u8;
    (rtp, rtp + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use crate::testutil::SharedBuf;

    #[test]
    fn default_channels_follow_track_id() {
        let transport = InterleavedTransport::new(Arc::new(ControlChannel::from_writer(Vec::new())));
        assert_eq!(transport.add_track(0, None), (0, 1));
        assert_eq!(transport.add_track(1, None), (2, 3));
        assert_eq!(transport.add_track(2, Some((10, 11))), (10, 11));
        assert_eq!(
            transport.reply(1).as_deref(),
            Some("RTP/AVP/TCP;unicast;interleaved=2-3")
        );
        assert_eq!(transport.reply(7), None);
    }

    #[test]
    fn traffic_is_framed_onto_control_connection() {
        let buf = SharedBuf::default();
        let control = Arc::new(ControlChannel::from_writer(buf.clone()));
        let inner = InterleavedTransport::new(control);
        inner.add_track(1, None);
        let transport = Transport::Interleaved(inner);

        transport.on_traffic(1, RelayChannel::Rtcp, &[0xAA, 0xBB]).unwrap();
        assert_eq!(buf.bytes(), vec![0x24, 3, 0, 2, 0xAA, 0xBB]);
    }

    #[test]
    fn traffic_for_unknown_track_is_an_error() {
        let transport = Transport::Interleaved(InterleavedTransport::new(Arc::new(
            ControlChannel::from_writer(Vec::new()),
        )));
        assert!(matches!(
            transport.on_traffic(4, RelayChannel::Rtp, &[1]),
            Err(RtspError::UnknownTrack(4))
        ));
    }
}
