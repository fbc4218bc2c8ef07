//! Error types for the RTSP relay.

use std::fmt;

use crate::ports::PortPurpose;

/// Errors that can occur in the relay.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Protocol**: [`Parse`](Self::Parse) for malformed RTSP messages,
///   [`PacketTooLarge`](Self::PacketTooLarge) for unframeable payloads.
/// - **Network**: [`Io`](Self::Io) for socket failures.
/// - **Resources**: [`PortsExhausted`](Self::PortsExhausted),
///   [`MulticastPoolExhausted`](Self::MulticastPoolExhausted),
///   [`UnknownTrack`](Self::UnknownTrack).
/// - **Media backends**: [`Describe`](Self::Describe),
///   [`Producer`](Self::Producer).
/// - **Server**: [`Config`](Self::Config), [`AlreadyRunning`](Self::AlreadyRunning).
#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse an RTSP request message (RFC 2326 §6).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// Every pair in the purpose's configured range is leased.
    #[error("no free {0} port pair")]
    PortsExhausted(PortPurpose),

    /// Every address in the multicast pool is in use.
    #[error("multicast address pool exhausted")]
    MulticastPoolExhausted,

    /// A transport was asked to carry traffic for a track it never set up.
    #[error("track {0} is not configured on this transport")]
    UnknownTrack(u32),

    /// Interleaved frames carry a 16-bit length.
    #[error("packet of {0} bytes does not fit an interleaved frame")]
    PacketTooLarge(usize),

    /// The session-description backend failed.
    #[error("describe failed: {0}")]
    Describe(String),

    /// The media producer could not be started.
    #[error("producer failed: {0}")]
    Producer(String),

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// [`Server::start`](crate::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,
}

/// Specific kind of RTSP parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
        }
    }
}

/// Convenience alias for `Result<T, RtspError>`.
pub type Result<T> = std::result::Result<T, RtspError>;
