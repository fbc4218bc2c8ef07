//! Control-connection framing.
//!
//! The RTSP connection carries three kinds of data:
//!
//! - Plain-text requests terminated by a blank line, optionally followed by
//!   a `Content-Length` body.
//! - Interleaved binary frames (RFC 2326 §10.12), used by the server for
//!   TCP delivery and by clients for RTCP receiver reports:
//!
//! ```text
//! +------+---------+----------------+-----------------+
//! | 0x24 | channel | length (u16 BE)| payload ...     |
//! +------+---------+----------------+-----------------+
//! ```
//!
//! - Base64-encoded requests, as sent by clients that tunnel RTSP.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::{Result, RtspError};

/// Marker byte (`$`) that starts an interleaved frame.
pub const INTERLEAVED_MARKER: u8 = 0x24;

/// Buffers larger than this without a complete frame are discarded.
pub const MAX_PENDING_BYTES: usize = 64 * 1024;

const HEADER_END: &[u8] = b"\r\n\r\n";

/// One complete unit read off the control connection.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    /// Request text including headers and body.
    Request(String),
    /// Inbound interleaved data (typically client RTCP).
    Interleaved { channel: u8, payload: Vec<u8> },
    /// A request whose declared length exceeds [`MAX_PENDING_BYTES`]. The
    /// buffer has been discarded.
    Oversized,
}

/// Wrap a packet in an interleaved frame header.
pub fn encode_interleaved(channel: u8, payload: &[u8]) -> Result<Vec<u8>> {
    let len = u16::try_from(payload.len()).map_err(|_| RtspError::PacketTooLarge(payload.len()))?;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.push(INTERLEAVED_MARKER);
    frame.push(channel);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Remove and return the next complete frame from `buf`, if any.
pub fn next_frame(buf: &mut Vec<u8>) -> Option<Frame> {
    // Stray line breaks between requests (keepalive CRLFs).
    let leading = buf.iter().take_while(|b| matches!(b, b'\r' | b'\n')).count();
    buf.drain(..leading);

    let first = *buf.first()?;
    if first == INTERLEAVED_MARKER {
        return next_interleaved(buf);
    }

    if let Some(pos) = find(buf, HEADER_END) {
        let head_len = pos + HEADER_END.len();
        let body_len = content_length(&buf[..head_len]);
        let total = match head_len.checked_add(body_len) {
            Some(total) if total <= MAX_PENDING_BYTES => total,
            _ => {
                buf.clear();
                return Some(Frame::Oversized);
            }
        };
        if buf.len() < total {
            return None;
        }
        let raw: Vec<u8> = buf.drain(..total).collect();
        return Some(Frame::Request(String::from_utf8_lossy(&raw).into_owned()));
    }

    next_base64(buf)
}

fn next_interleaved(buf: &mut Vec<u8>) -> Option<Frame> {
    if buf.len() < 4 {
        return None;
    }
    let channel = buf[1];
    let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if buf.len() < 4 + len {
        return None;
    }
    let payload = buf[4..4 + len].to_vec();
    buf.drain(..4 + len);
    Some(Frame::Interleaved { channel, payload })
}

fn next_base64(buf: &mut Vec<u8>) -> Option<Frame> {
    let is_b64 = |b: &u8| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'=');
    if !buf.iter().all(|b| is_b64(b) || b.is_ascii_whitespace()) {
        return None;
    }
    let compact: Vec<u8> = buf.iter().copied().filter(|b| !b.is_ascii_whitespace()).collect();
    let decoded = STANDARD.decode(&compact).ok()?;
    let pos = find(&decoded, HEADER_END)?;
    buf.clear();
    let text = String::from_utf8_lossy(&decoded[..pos + HEADER_END.len()]).into_owned();
    Some(Frame::Request(text))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn content_length(head: &[u8]) -> usize {
    String::from_utf8_lossy(head)
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("Content-Length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}
