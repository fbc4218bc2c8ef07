//! RTP fixed-header access and timestamp rewriting (RFC 3550 §5.1).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           Timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                             SSRC                              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The producer restarts its clock on every PLAY. The relay shifts each
//! packet's timestamp so the client sees one continuous timeline across
//! pause, resume and seek.

/// Length of the RTP fixed header.
pub const HEADER_LEN: usize = 12;

const WRAP: i64 = 1 << 32;

/// Sequence number (bytes 2–3).
pub fn sequence(packet: &[u8]) -> Option<u16> {
    (packet.len() >= HEADER_LEN).then(|| u16::from_be_bytes([packet[2], packet[3]]))
}

/// Media timestamp (bytes 4–7).
pub fn timestamp(packet: &[u8]) -> Option<u32> {
    (packet.len() >= HEADER_LEN)
        .then(|| u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]))
}

/// Overwrite the media timestamp in place.
pub fn set_timestamp(packet: &mut [u8], ts: u32) {
    packet[4..8].copy_from_slice(&ts.to_be_bytes());
}

/// RTP timestamp of a media position: `round(clock_rate × seconds)`.
pub fn media_time(clock_rate: u32, seconds: f64) -> i64 {
    (clock_rate as f64 * seconds).round() as i64
}

/// Per-play-cycle timestamp offset shared by a track's RTP and RTCP relays.
///
/// The offset is established from the first nonzero timestamp so that
/// packet reads `base`, where `base = round(clock × playOffset) + initial`.
/// It is cleared on pause and teardown.
#[derive(Debug, Default)]
pub struct TimestampRewriter {
    base: i64,
    offset: Option<i64>,
}

impl TimestampRewriter {
    /// Arm the rewriter for a new play cycle.
    pub fn reset(&mut self, base: i64) {
        self.base = base;
        self.offset = None;
    }

    /// Forget the offset; RTCP sender reports are dropped until the next
    /// RTP packet re-establishes it.
    pub fn clear(&mut self) {
        self.offset = None;
    }

    pub fn offset(&self) -> Option<i64> {
        self.offset
    }

    /// Rewrite an RTP timestamp.
    ///
    /// Returns `None` while no offset is established and `raw` is zero; the
    /// producer may emit one such packet right after a restart.
    pub fn rewrite_rtp(&mut self, raw: u32) -> Option<u32> {
        let offset = match self.offset {
            Some(offset) => offset,
            None if raw == 0 => return None,
            None => {
                let offset = self.base - raw as i64;
                self.offset = Some(offset);
                offset
            }
        };
        Some(self.apply(raw, offset))
    }

    /// Rewrite a sender-report RTP timestamp; `None` before an offset exists.
    pub fn rewrite_report(&mut self, raw: u32) -> Option<u32> {
        let offset = self.offset?;
        Some(self.apply(raw, offset))
    }

    fn apply(&mut self, raw: u32, offset: i64) -> u32 {
        let sum = raw as i64 + offset;
        if (0..WRAP).contains(&sum) {
            return sum as u32;
        }
        let wrapped = sum.rem_euclid(WRAP);
        self.offset = Some((wrapped - raw as i64).rem_euclid(WRAP));
        wrapped as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(seq: u16, ts: u32) -> Vec<u8> {
        let mut p = vec![0x80, 96];
        p.extend_from_slice(&seq.to_be_bytes());
        p.extend_from_slice(&ts.to_be_bytes());
        p.extend_from_slice(&0xAABBCCDDu32.to_be_bytes());
        p.extend_from_slice(&[1, 2, 3]);
        p
    }

    #[test]
    fn header_fields() {
        let mut p = packet(0xBEEF, 0x0102_0304);
        assert_eq!(sequence(&p), Some(0xBEEF));
        assert_eq!(timestamp(&p), Some(0x0102_0304));
        set_timestamp(&mut p, 7);
        assert_eq!(timestamp(&p), Some(7));
        assert_eq!(&p[8..12], &0xAABBCCDDu32.to_be_bytes());
    }

    #[test]
    fn short_packet_has_no_header() {
        assert_eq!(sequence(&[0x80, 96, 0]), None);
        assert_eq!(timestamp(&[0u8; 11]), None);
    }

    #[test]
    fn media_time_rounds() {
        assert_eq!(media_time(90000, 30.0), 2_700_000);
        assert_eq!(media_time(44100, 0.00001), 0);
        assert_eq!(media_time(8000, 1.00006), 8000);
    }

    #[test]
    fn first_rewritten_timestamp_equals_base() {
        let mut rw = TimestampRewriter::default();
        let base = media_time(90000, 30.0) + 12345;
        rw.reset(base);
        assert_eq!(rw.rewrite_rtp(987_654), Some(base as u32));
        assert_eq!(rw.rewrite_rtp(987_654 + 3000), Some(base as u32 + 3000));
    }

    #[test]
    fn zero_timestamp_before_offset_is_dropped() {
        let mut rw = TimestampRewriter::default();
        rw.reset(500);
        assert_eq!(rw.rewrite_rtp(0), None);
        assert_eq!(rw.offset(), None);
        assert_eq!(rw.rewrite_rtp(100), Some(500));
        // Once established, zero is an ordinary timestamp.
        assert_eq!(rw.rewrite_rtp(0), Some(400));
    }

    #[test]
    fn offset_is_modular_across_wrap() {
        let mut rw = TimestampRewriter::default();
        rw.reset(u32::MAX as i64 - 10);
        assert_eq!(rw.rewrite_rtp(1000), Some(u32::MAX - 10));
        let offset = rw.offset().unwrap();
        for raw in [1010u32, 1011, 5000, 1_000_000] {
            let expected = ((raw as i64 + offset).rem_euclid(WRAP)) as u32;
            assert_eq!(rw.rewrite_rtp(raw), Some(expected));
        }
        assert_eq!(rw.rewrite_rtp(1011), Some(0));
    }

    #[test]
    fn negative_offset_underflow_wraps() {
        let mut rw = TimestampRewriter::default();
        rw.reset(0);
        assert_eq!(rw.rewrite_rtp(5000), Some(0));
        // Producer timestamp going backwards would underflow.
        assert_eq!(rw.rewrite_rtp(4999), Some(u32::MAX));
        assert_eq!(rw.rewrite_rtp(5001), Some(1));
    }

    #[test]
    fn report_uses_same_offset() {
        let mut rw = TimestampRewriter::default();
        rw.reset(90_000);
        assert_eq!(rw.rewrite_report(10), None);
        rw.rewrite_rtp(1_000).unwrap();
        assert_eq!(rw.rewrite_report(4_000), Some(93_000));
    }

    #[test]
    fn clear_forgets_offset() {
        let mut rw = TimestampRewriter::default();
        rw.reset(10);
        rw.rewrite_rtp(20).unwrap();
        rw.clear();
        assert_eq!(rw.rewrite_report(20), None);
        assert_eq!(rw.rewrite_rtp(99), Some(10));
    }
}
