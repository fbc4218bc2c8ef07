//! Server configuration.
//!
//! Every option has a default, so an empty TOML file (or none at all) yields
//! a working server. Example:
//!
//! ```toml
//! bind_addr = "0.0.0.0:8554"
//! media_root = "/srv/media"
//! allow_udp_multicast = true
//! multicast_policy = "host-controlled"
//!
//! [relay_ports]
//! start = 20000
//! end = 30000
//! ```

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, RtspError};
use crate::ports::{PortRange, PortRegistry};

/// How long a multicast group outlives its members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MulticastPolicy {
    /// Release the group when the last member tears down.
    #[default]
    Shared,
    /// The host controls the stream: it may seek and pause, and its
    /// teardown releases the group for everyone.
    HostControlled,
    /// Never release a group once created.
    Retain,
}

impl MulticastPolicy {
    /// Whether the group's host may seek and pause.
    pub fn host_controls(self) -> bool {
        self == Self::HostControlled
    }

    /// Whether a member leaving should release the group's resources.
    pub fn should_release(self, leaving_host: bool, remaining: usize) -> bool {
        match self {
            Self::Shared => remaining == 0,
            Self::HostControlled => leaving_host || remaining == 0,
            Self::Retain => false,
        }
    }
}

/// Server-level configuration shared by every session.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// RTSP listen address (host:port).
    pub bind_addr: String,
    /// Host advertised in session descriptions. When `None`, the host of
    /// the request URI is used.
    pub public_host: Option<String>,
    /// Idle time after which a session is torn down.
    pub session_timeout_secs: u64,

    pub allow_tcp: bool,
    pub allow_udp_unicast: bool,
    pub allow_udp_multicast: bool,

    /// TTL for multicast delivery sockets and the SETUP reply.
    pub multicast_ttl: u32,
    /// First three octets of every multicast group address.
    pub multicast_prefix: Ipv4Addr,
    /// Last-octet range `[start, end)` of the multicast address pool.
    pub multicast_octets: (u8, u8),
    pub multicast_policy: MulticastPolicy,

    pub relay_ports: PortRange,
    pub unicast_ports: PortRange,
    pub describe_ports: PortRange,

    /// Start every track's RTP timestamps at zero instead of a random offset.
    pub zero_initial_timestamp: bool,
    /// Start sequence numbers at one instead of a random value.
    pub seq_start_at_one: bool,
    /// Loop the source when the session is in forced-live mode.
    pub stream_loop: bool,
    /// Report `rtptime=0` in RTP-Info.
    pub report_zero_rtptime: bool,
    /// Treat every client as a legacy client.
    pub always_compat: bool,
    /// Serve every source as live (no seek, no pause).
    pub force_live: bool,
    /// Do not relay RTCP from the producer.
    pub disable_rtcp: bool,
    /// User-Agent substrings (lowercase) that enable compat mode.
    pub legacy_user_agents: Vec<String>,

    /// Directory content paths are resolved against.
    pub media_root: PathBuf,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    /// Grace period between terminating a producer and killing it.
    pub producer_stop_grace_ms: u64,
    /// Receive timeout of the relay loops; bounds how long a stop takes.
    pub relay_recv_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8554".to_string(),
            public_host: None,
            session_timeout_secs: 60,
            allow_tcp: true,
            allow_udp_unicast: true,
            allow_udp_multicast: true,
            multicast_ttl: 1,
            multicast_prefix: Ipv4Addr::new(239, 0, 0, 0),
            multicast_octets: (1, 255),
            multicast_policy: MulticastPolicy::Shared,
            relay_ports: PortRange::new(20000, 30000),
            unicast_ports: PortRange::new(30000, 40000),
            describe_ports: PortRange::new(40000, 41000),
            zero_initial_timestamp: false,
            seq_start_at_one: false,
            stream_loop: false,
            report_zero_rtptime: false,
            always_compat: false,
            force_live: false,
            disable_rtcp: false,
            legacy_user_agents: vec!["helixdnaclient".to_string(), "realmedia player".to_string()],
            media_root: PathBuf::from("media"),
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            producer_stop_grace_ms: 2000,
            relay_recv_timeout_ms: 200,
        }
    }
}

impl ServerConfig {
    /// Load and validate a TOML configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RtspError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
            .map_err(|e| RtspError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Parse and validate TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: ServerConfig =
            toml::from_str(content).map_err(|e| RtspError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, range) in [
            ("relay_ports", self.relay_ports),
            ("unicast_ports", self.unicast_ports),
            ("describe_ports", self.describe_ports),
        ] {
            if range.start >= range.end {
                return Err(RtspError::Config(format!("{name} is empty")));
            }
            if range.start % 2 != 0 {
                return Err(RtspError::Config(format!("{name} must start on an even port")));
            }
        }
        let (lo, hi) = self.multicast_octets;
        if lo >= hi {
            return Err(RtspError::Config("multicast_octets is empty".to_string()));
        }
        if !self.multicast_prefix.is_multicast() {
            return Err(RtspError::Config(format!(
                "multicast_prefix {} is not a multicast address",
                self.multicast_prefix
            )));
        }
        if self.session_timeout_secs == 0 {
            return Err(RtspError::Config("session_timeout_secs must be positive".to_string()));
        }
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn producer_stop_grace(&self) -> Duration {
        Duration::from_millis(self.producer_stop_grace_ms)
    }

    pub fn relay_recv_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_recv_timeout_ms.max(1))
    }

    /// Build the port registry described by this configuration.
    pub fn port_registry(&self) -> PortRegistry {
        PortRegistry::new(self.relay_ports, self.unicast_ports, self.describe_ports)
    }

    /// Whether a User-Agent value belongs to a legacy client.
    pub fn is_legacy_client(&self, user_agent: &str) -> bool {
        let ua = user_agent.to_lowercase();
        self.legacy_user_agents.iter().any(|sig| ua.contains(sig.as_str()))
    }
}
