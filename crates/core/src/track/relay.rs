//! Patch-and-forward loops between a producer and the session's transport.

use std::io::ErrorKind;
use std::net::UdpSocket;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};

use parking_lot::Mutex;

use crate::media::rtp::{self, TimestampRewriter};
use crate::media::rtcp;
use crate::transport::{RelayChannel, Transport};

/// Largest datagram the relay accepts.
const MAX_DATAGRAM: usize = 65_536;

/// State shared by a track's RTP and RTCP loops.
#[derive(Debug)]
pub struct RelayState {
    last_seq: AtomicU16,
    rewriter: Mutex<TimestampRewriter>,
}

impl RelayState {
    pub fn new(last_seq: u16) -> Self {
        Self {
            last_seq: AtomicU16::new(last_seq),
            rewriter: Mutex::new(TimestampRewriter::default()),
        }
    }

    pub fn last_seq(&self) -> u16 {
        self.last_seq.load(Ordering::Acquire)
    }

    /// Arm timestamp rewriting for a new play cycle.
    pub fn reset(&self, base: i64) {
        self.rewriter.lock().reset(base);
    }

    pub fn clear(&self) {
        self.rewriter.lock().clear();
    }

    pub fn offset(&self) -> Option<i64> {
        self.rewriter.lock().offset()
    }

    /// Record the sequence number and rewrite the timestamp of an RTP
    /// packet in place. Returns whether the packet should be forwarded.
    pub fn patch_rtp(&self, packet: &mut [u8]) -> bool {
        let (Some(seq), Some(raw)) = (rtp::sequence(packet), rtp::timestamp(packet)) else {
            return false;
        };
        self.last_seq.store(seq, Ordering::Release);
        match self.rewriter.lock().rewrite_rtp(raw) {
            Some(ts) => {
                rtp::set_timestamp(packet, ts);
                true
            }
            None => false,
        }
    }

    /// Rewrite a sender report's RTP timestamp in place. Other RTCP passes
    /// through untouched. Returns whether the packet should be forwarded.
    pub fn patch_rtcp(&self, packet: &mut [u8]) -> bool {
        if !rtcp::is_sender_report(packet) {
            return true;
        }
        let Some(raw) = rtcp::report_timestamp(packet) else {
            return false;
        };
        match self.rewriter.lock().rewrite_report(raw) {
            Some(ts) => {
                rtcp::set_report_timestamp(packet, ts);
                true
            }
            None => false,
        }
    }
}

/// One direction of a track's relay.
pub(crate) struct RelayWorker {
    pub socket: UdpSocket,
    pub channel: RelayChannel,
    pub state: Arc<RelayState>,
    pub transport: Arc<Transport>,
    pub track_id: u32,
    pub stop: Arc<AtomicBool>,
}

impl RelayWorker {
    /// Receive, patch and forward until stopped or an I/O error occurs.
    ///
    /// The socket must carry a read timeout so the stop flag is observed.
    pub fn run(self) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut forwarded: u64 = 0;

        let reason = loop {
            if self.stop.load(Ordering::Acquire) {
                break "stopped";
            }
            let n = match self.socket.recv(&mut buf) {
                Ok(n) => n,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    tracing::debug!(track_id = self.track_id, error = %e, "relay receive failed");
                    break "receive error";
                }
            };

            let packet = &mut buf[..n];
            let forward = match self.channel {
                RelayChannel::Rtp => self.state.patch_rtp(packet),
                RelayChannel::Rtcp => self.state.patch_rtcp(packet),
            };
            if !forward {
                continue;
            }
            if let Err(e) = self.transport.on_traffic(self.track_id, self.channel, packet) {
                tracing::debug!(track_id = self.track_id, error = %e, "relay delivery failed");
                break "delivery error";
            }
            forwarded += 1;
        };

        tracing::trace!(
            track_id = self.track_id,
            channel = ?self.channel,
            forwarded,
            reason,
            "relay exited"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rtp_packet(seq: u16, ts: u32) -> Vec<u8> {
        let mut p = vec![0x80, 96];
        p.extend_from_slice(&seq.to_be_bytes());
        p.extend_from_slice(&ts.to_be_bytes());
        p.extend_from_slice(&[0, 0, 0, 1]);
        p.push(0xFF);
        p
    }

    fn sender_report(ts: u32) -> Vec<u8> {
        let mut p = vec![0x80, 200, 0, 6, 0, 0, 0, 1];
        p.extend_from_slice(&[0; 8]);
        p.extend_from_slice(&ts.to_be_bytes());
        p.extend_from_slice(&[0; 8]);
        p
    }

    #[test]
    fn rtp_records_sequence_and_rewrites() {
        let state = RelayState::new(0);
        state.reset(1000);
        let mut p = rtp_packet(77, 5000);
        assert!(state.patch_rtp(&mut p));
        assert_eq!(state.last_seq(), 77);
        assert_eq!(rtp::timestamp(&p), Some(1000));
    }

    #[test]
    fn zero_timestamp_dropped_until_offset_known() {
        let state = RelayState::new(0);
        state.reset(1000);
        let mut p = rtp_packet(5, 0);
        assert!(!state.patch_rtp(&mut p));
        // The sequence number is still recorded.
        assert_eq!(state.last_seq(), 5);
        assert_eq!(state.offset(), None);
    }

    #[test]
    fn sender_report_waits_for_rtp() {
        let state = RelayState::new(0);
        state.reset(90_000);
        let mut sr = sender_report(100);
        assert!(!state.patch_rtcp(&mut sr));

        let mut p = rtp_packet(1, 10);
        assert!(state.patch_rtp(&mut p));
        let mut sr = sender_report(100);
        assert!(state.patch_rtcp(&mut sr));
        assert_eq!(rtcp::report_timestamp(&sr), Some(90_090));
    }

    #[test]
    fn non_sr_rtcp_passes_through() {
        let state = RelayState::new(0);
        let mut sdes = vec![0x81, 202, 0, 1, 0, 0, 0, 1];
        let before = sdes.clone();
        assert!(state.patch_rtcp(&mut sdes));
        assert_eq!(sdes, before);
    }

    #[test]
    fn runt_packets_dropped() {
        let state = RelayState::new(3);
        assert!(!state.patch_rtp(&mut [0x80, 96, 0]));
        assert_eq!(state.last_seq(), 3);
    }
}
