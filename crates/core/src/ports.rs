//! Port leasing shared by every session.
//!
//! Ports are handed out in pairs: the even port carries data (RTP) and its
//! odd successor is implicitly reserved for the control stream (RTCP). Only
//! the even port is recorded in the leased set.

use std::collections::HashSet;
use std::fmt;

use parking_lot::Mutex;
use serde::Deserialize;

use crate::error::{Result, RtspError};

/// What a leased port pair is used for. Each purpose has its own range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortPurpose {
    /// Loopback ports between the producer subprocess and the relay loops.
    Relay,
    /// Server-side ports for UDP unicast and multicast delivery.
    Unicast,
    /// Scratch ports used while generating a session description.
    Describe,
}

impl fmt::Display for PortPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Relay => write!(f, "relay"),
            Self::Unicast => write!(f, "unicast"),
            Self::Describe => write!(f, "describe"),
        }
    }
}

/// Half-open port range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Candidate pair bases: `start`, `start + 2`, ... below `end`.
    ///
    /// `end` is exclusive and at most `u16::MAX`, so the odd successor of
    /// every candidate is a valid port.
    fn candidates(&self) -> impl Iterator<Item = u16> + use<> {
        (self.start..self.end).step_by(2)
    }
}

/// Thread-safe registry of leased port pairs.
///
/// Lookups scan the purpose's range from its start, so the lowest free pair
/// is always reused first.
#[derive(Debug)]
pub struct PortRegistry {
    relay: PortRange,
    unicast: PortRange,
    describe: PortRange,
    leased: Mutex<HashSet<u16>>,
}

impl PortRegistry {
    pub fn new(relay: PortRange, unicast: PortRange, describe: PortRange) -> Self {
        Self {
            relay,
            unicast,
            describe,
            leased: Mutex::new(HashSet::new()),
        }
    }

    pub fn range(&self, purpose: PortPurpose) -> PortRange {
        match purpose {
            PortPurpose::Relay => self.relay,
            PortPurpose::Unicast => self.unicast,
            PortPurpose::Describe => self.describe,
        }
    }

    /// Find and lease a free pair in one critical section.
    pub fn allocate(&self, purpose: PortPurpose) -> Result<u16> {
        let mut leased = self.leased.lock();
        let port = self
            .range(purpose)
            .candidates()
            .find(|p| !leased.contains(p))
            .ok_or(RtspError::PortsExhausted(purpose))?;
        leased.insert(port);
        tracing::trace!(port, %purpose, "port pair allocated");
        Ok(port)
    }

    /// Return a pair to the pool.
    ///
    /// Releasing a port that is not leased is logged as a double free and
    /// otherwise ignored: ownership windows overlap during pause/resume and
    /// multicast hand-offs.
    pub fn release(&self, port: u16) -> bool {
        let removed = self.leased.lock().remove(&port);
        if removed {
            tracing::trace!(port, "port released");
        } else {
            tracing::warn!(port, "port double free");
        }
        removed
    }

    pub fn is_leased(&self, port: u16) -> bool {
        self.leased.lock().contains(&port)
    }

    pub fn leased_count(&self) -> usize {
        self.leased.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> PortRegistry {
        PortRegistry::new(
            PortRange::new(20000, 20006),
            PortRange::new(30000, 30004),
            PortRange::new(40000, 40002),
        )
    }

    #[test]
    fn allocates_even_ports_in_order() {
        let reg = registry();
        assert_eq!(reg.allocate(PortPurpose::Relay).unwrap(), 20000);
        assert_eq!(reg.allocate(PortPurpose::Relay).unwrap(), 20002);
        assert_eq!(reg.allocate(PortPurpose::Relay).unwrap(), 20004);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let reg = registry();
        reg.allocate(PortPurpose::Describe).unwrap();
        assert!(matches!(
            reg.allocate(PortPurpose::Describe),
            Err(RtspError::PortsExhausted(PortPurpose::Describe))
        ));
    }

    #[test]
    fn never_returns_a_leased_port() {
        let reg = registry();
        assert_eq!(reg.allocate(PortPurpose::Unicast).unwrap(), 30000);
        assert_eq!(reg.allocate(PortPurpose::Unicast).unwrap(), 30002);
        assert!(reg.allocate(PortPurpose::Unicast).is_err());
        assert_eq!(reg.leased_count(), 2);
    }

    #[test]
    fn released_port_is_reused_first() {
        let reg = registry();
        let a = reg.allocate(PortPurpose::Relay).unwrap();
        let _b = reg.allocate(PortPurpose::Relay).unwrap();
        assert!(reg.release(a));
        assert_eq!(reg.allocate(PortPurpose::Relay).unwrap(), a);
    }

    #[test]
    fn double_free_is_reported_not_fatal() {
        let reg = registry();
        let p = reg.allocate(PortPurpose::Relay).unwrap();
        let other = reg.allocate(PortPurpose::Relay).unwrap();
        assert!(reg.release(p));
        assert!(!reg.release(p));
        assert!(!reg.release(12345));
        assert!(reg.is_leased(other));
        assert_eq!(reg.leased_count(), 1);
    }

    #[test]
    fn purposes_use_separate_ranges() {
        let reg = registry();
        assert_eq!(reg.allocate(PortPurpose::Relay).unwrap(), 20000);
        assert_eq!(reg.allocate(PortPurpose::Unicast).unwrap(), 30000);
        assert_eq!(reg.allocate(PortPurpose::Describe).unwrap(), 40000);
    }

    #[test]
    fn range_at_top_of_port_space_keeps_odd_successor() {
        let reg = PortRegistry::new(
            PortRange::new(65532, 65535),
            PortRange::new(0, 0),
            PortRange::new(0, 0),
        );
        assert_eq!(reg.allocate(PortPurpose::Relay).unwrap(), 65532);
        assert_eq!(reg.allocate(PortPurpose::Relay).unwrap(), 65534);
        assert!(reg.allocate(PortPurpose::Relay).is_err());
        assert!(reg.allocate(PortPurpose::Unicast).is_err());
    }
}
