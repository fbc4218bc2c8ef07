//! RTSP protocol implementation (RFC 2326).
//!
//! This module handles the text-based RTSP signaling protocol: framing the
//! control connection, parsing requests, building responses, reading the
//! `Transport` header, and assembling SDP.
//!
//! ## RTSP message format (RFC 2326 §4)
//!
//! RTSP messages follow HTTP/1.1 syntax with a different method set:
//!
//! ```text
//! DESCRIBE rtsp://server/movie.mp4 RTSP/1.0\r\n
//! CSeq: 2\r\n
//! Accept: application/sdp\r\n
//! \r\n
//! ```
//!
//! ## Supported methods
//!
//! | Method | RFC section | Purpose |
//! |--------|-------------|---------|
//! | OPTIONS | §10.1 | Capability discovery |
//! | DESCRIBE | §10.2 | Retrieve SDP session description |
//! | SETUP | §10.4 | Negotiate transport (TCP, UDP, multicast) |
//! | PLAY | §10.5 | Start or resume media delivery |
//! | PAUSE | §10.6 | Suspend media delivery |
//! | TEARDOWN | §10.7 | Destroy session |
//! | GET_PARAMETER | §10.8 | Keepalive |
//!
//! The session state machine that acts on these lives in
//! [`crate::session`].

pub mod framing;
pub mod method;
pub mod request;
pub mod response;
pub mod sdp;
pub mod transport;

pub use framing::Frame;
pub use method::Method;
pub use request::RtspRequest;
pub use response::RtspResponse;
pub use transport::TransportSpec;
