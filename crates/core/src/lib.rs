//! RTSP control plane that relays RTP produced by external media
//! processes to clients over interleaved TCP, UDP unicast and UDP multicast.
//!
//! ```no_run
//! use rtsp_relay::{Server, ServerConfig};
//!
//! let config = ServerConfig {
//!     bind_addr: "0.0.0.0:8554".to_string(),
//!     media_root: "/srv/media".into(),
//!     ..ServerConfig::default()
//! };
//! let mut server = Server::new(config)?;
//! server.start()?;
//! # Ok::<(), rtsp_relay::RtspError>(())
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod media;
pub mod multicast;
pub mod ports;
pub mod protocol;
pub mod server;
pub mod session;
pub mod track;
pub mod transport;

#[cfg(test)]
mod testutil;

pub use config::{MulticastPolicy, ServerConfig};
pub use error::{Result, RtspError};
pub use server::Server;
