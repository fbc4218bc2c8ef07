//! RTCP sender-report timestamp access (RFC 3550 §6.4.1).
//!
//! ```text
//!  0               1               2               3
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|    RC   |   PT=SR=200   |             length            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         SSRC of sender                        |
//! +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
//! |              NTP timestamp, most significant word             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |             NTP timestamp, least significant word             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         RTP timestamp                         |  bytes 16..20
//! ```

/// Packet type of a sender report.
pub const PT_SENDER_REPORT: u8 = 200;

const RTP_TS: std::ops::Range<usize> = 16..20;

/// Whether the (first) packet of a compound packet is a sender report.
pub fn is_sender_report(packet: &[u8]) -> bool {
    packet.len() >= 2 && packet[1] == PT_SENDER_REPORT
}

/// RTP timestamp field of a sender report.
pub fn report_timestamp(packet: &[u8]) -> Option<u32> {
    let bytes = packet.get(RTP_TS)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub fn set_report_timestamp(packet: &mut [u8], ts: u32) {
    packet[RTP_TS].copy_from_slice(&ts.to_be_bytes());
}
