//! Multicast group coordination across sessions.
//!
//! The first session to ask for multicast delivery of a content source
//! becomes the group's **host**: it gets a group address from the pool and
//! owns a fresh multicast transport and track map. Later sessions for the
//! same source become **watchers** that share both and never start
//! producers or open sockets of their own.
//!
//! When a member leaves, the [`MulticastPolicy`] decides whether the group
//! is released. The member that removes the group from the index is the
//! only one that tears its resources down.

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::config::{MulticastPolicy, ServerConfig};
use crate::error::{Result, RtspError};
use crate::track::SharedTracks;
use crate::transport::{MulticastTransport, Transport};

/// A shared multicast delivery for one content source.
pub struct MulticastGroup {
    pub source: String,
    pub address: Ipv4Addr,
    pub transport: Arc<Transport>,
    pub tracks: SharedTracks,
    host_id: String,
    watchers: AtomicUsize,
}

impl MulticastGroup {
    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// Sessions currently in the group, host included.
    pub fn watchers(&self) -> usize {
        self.watchers.load(Ordering::SeqCst)
    }
}

/// A session's place in a group.
#[derive(Clone)]
pub struct Membership {
    pub group: Arc<MulticastGroup>,
    pub host: bool,
}

/// Group addresses `prefix.a.b.c` with the last octet drawn from a range.
struct AddressPool {
    prefix: [u8; 3],
    free: BTreeSet<u8>,
}

impl AddressPool {
    fn new(prefix: Ipv4Addr, octets: (u8, u8)) -> Self {
        let [a, b, c, _] = prefix.octets();
        Self {
            prefix: [a, b, c],
            free: (octets.0..octets.1).collect(),
        }
    }

    fn take(&mut self) -> Option<Ipv4Addr> {
        let octet = self.free.pop_first()?;
        let [a, b, c] = self.prefix;
        Some(Ipv4Addr::new(a, b, c, octet))
    }

    fn give_back(&mut self, address: Ipv4Addr) {
        self.free.insert(address.octets()[3]);
    }
}

/// Index of live multicast groups keyed by content source.
pub struct MulticastCoordinator {
    groups: Mutex<HashMap<String, Arc<MulticastGroup>>>,
    pool: Mutex<AddressPool>,
    policy: MulticastPolicy,
    ttl: u32,
}

impl MulticastCoordinator {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            pool: Mutex::new(AddressPool::new(
                config.multicast_prefix,
                config.multicast_octets,
            )),
            policy: config.multicast_policy,
            ttl: config.multicast_ttl,
        }
    }

    pub fn policy(&self) -> MulticastPolicy {
        self.policy
    }

    /// Join the group for `source`, creating it with `session_id` as host if
    /// none exists.
    pub fn join(&self, source: &str, session_id: &str) -> Result<Membership> {
        let mut groups = self.groups.lock();
        if let Some(group) = groups.get(source) {
            let watchers = group.watchers.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::debug!(
                session_id,
                source,
                group = %group.address,
                watchers,
                "joined multicast group as watcher"
            );
            return Ok(Membership {
                group: group.clone(),
                host: false,
            });
        }

        let address = self
            .pool
            .lock()
            .take()
            .ok_or(RtspError::MulticastPoolExhausted)?;
        let group = Arc::new(MulticastGroup {
            source: source.to_string(),
            address,
            transport: Arc::new(Transport::Multicast(MulticastTransport::new(
                address, self.ttl,
            ))),
            tracks: SharedTracks::default(),
            host_id: session_id.to_string(),
            watchers: AtomicUsize::new(1),
        });
        groups.insert(source.to_string(), group.clone());
        tracing::info!(session_id, source, group = %address, "created multicast group");
        Ok(Membership { group, host: true })
    }

    /// Leave a group. Returns `true` if the caller must release the group's
    /// tracks and transport; the group's address is already back in the pool.
    ///
    /// The count changes under the index lock so a concurrent [`join`]
    /// either lands before the release decision or finds the group gone.
    ///
    /// [`join`]: Self::join
    pub fn leave(&self, membership: &Membership, session_id: &str) -> bool {
        let group = &membership.group;
        let mut groups = self.groups.lock();
        let remaining = group
            .watchers
            .fetch_sub(1, Ordering::SeqCst)
            .saturating_sub(1);

        if !self.policy.should_release(membership.host, remaining) {
            tracing::debug!(session_id, group = %group.address, remaining, "left multicast group");
            return false;
        }

        let indexed = groups
            .get(&group.source)
            .is_some_and(|g| Arc::ptr_eq(g, group));
        if !indexed {
            return false;
        }
        groups.remove(&group.source);
        self.pool.lock().give_back(group.address);
        tracing::info!(session_id, group = %group.address, remaining, "released multicast group");
        true
    }

    pub fn group_count(&self) -> usize {
        self.groups.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator(policy: MulticastPolicy, octets: (u8, u8)) -> MulticastCoordinator {
        MulticastCoordinator::new(&ServerConfig {
            multicast_policy: policy,
            multicast_octets: octets,
            ..ServerConfig::default()
        })
    }

    #[test]
    fn first_joiner_hosts_second_watches() {
        let mc = coordinator(MulticastPolicy::Shared, (1, 255));
        let host = mc.join("clip.ts", "1").unwrap();
        let watcher = mc.join("clip.ts", "2").unwrap();

        assert!(host.host);
        assert!(!watcher.host);
        assert_eq!(host.group.address, Ipv4Addr::new(239, 0, 0, 1));
        assert!(Arc::ptr_eq(&host.group.transport, &watcher.group.transport));
        assert!(Arc::ptr_eq(&host.group.tracks, &watcher.group.tracks));
        assert_eq!(host.group.watchers(), 2);
        assert_eq!(host.group.host_id(), "1");
    }

    #[test]
    fn shared_policy_releases_at_zero() {
        let mc = coordinator(MulticastPolicy::Shared, (1, 255));
        let host = mc.join("clip.ts", "1").unwrap();
        let watcher = mc.join("clip.ts", "2").unwrap();

        assert!(!mc.leave(&host, "1"));
        assert_eq!(watcher.group.watchers(), 1);
        assert_eq!(mc.group_count(), 1);

        assert!(mc.leave(&watcher, "2"));
        assert_eq!(mc.group_count(), 0);

        // Address returned to the pool.
        let again = mc.join("other.ts", "3").unwrap();
        assert_eq!(again.group.address, Ipv4Addr::new(239, 0, 0, 1));
    }

    #[test]
    fn host_controlled_host_leaving_releases_once() {
        let mc = coordinator(MulticastPolicy::HostControlled, (1, 255));
        let host = mc.join("clip.ts", "1").unwrap();
        let watcher = mc.join("clip.ts", "2").unwrap();

        assert!(mc.leave(&host, "1"));
        assert!(!mc.leave(&watcher, "2"));
        assert_eq!(mc.group_count(), 0);
    }

    #[test]
    fn retain_policy_never_releases() {
        let mc = coordinator(MulticastPolicy::Retain, (1, 255));
        let host = mc.join("clip.ts", "1").unwrap();
        assert!(!mc.leave(&host, "1"));
        assert_eq!(mc.group_count(), 1);

        let later = mc.join("clip.ts", "2").unwrap();
        assert!(!later.host);
    }

    #[test]
    fn octet_range_excludes_its_end() {
        let mut pool = AddressPool::new(Ipv4Addr::new(239, 0, 0, 0), (1, 3));
        assert_eq!(pool.take(), Some(Ipv4Addr::new(239, 0, 0, 1)));
        assert_eq!(pool.take(), Some(Ipv4Addr::new(239, 0, 0, 2)));
        assert_eq!(pool.take(), None);

        let mut pool = AddressPool::new(Ipv4Addr::new(239, 0, 0, 0), (1, 255));
        let mut handed_out = 0;
        while let Some(address) = pool.take() {
            assert_ne!(address.octets()[3], 255);
            handed_out += 1;
        }
        assert_eq!(handed_out, 254);
    }

    #[test]
    fn join_racing_final_leave_never_orphans_a_watcher() {
        use std::sync::Barrier;
        use std::thread;

        let mc = Arc::new(coordinator(MulticastPolicy::Shared, (1, 255)));
        for i in 0..2000 {
            let host = mc.join("clip.ts", "1").unwrap();
            let barrier = Arc::new(Barrier::new(2));

            let leaving = {
                let (mc, barrier) = (mc.clone(), barrier.clone());
                thread::spawn(move || {
                    barrier.wait();
                    mc.leave(&host, "1")
                })
            };
            let joining = {
                let (mc, barrier) = (mc.clone(), barrier.clone());
                thread::spawn(move || {
                    barrier.wait();
                    mc.join("clip.ts", "2").unwrap()
                })
            };
            let released = leaving.join().unwrap();
            let joined = joining.join().unwrap();

            // Either the join came first and kept the group alive, or the
            // group was released and the joiner hosts a fresh one.
            assert_eq!(released, joined.host, "iteration {i}");
            assert_eq!(mc.group_count(), 1, "iteration {i}");
            assert_eq!(joined.group.watchers(), 1, "iteration {i}");

            assert!(mc.leave(&joined, "2"));
            assert_eq!(mc.group_count(), 0);
        }
    }

    #[test]
    fn pool_exhaustion() {
        let mc = coordinator(MulticastPolicy::Shared, (5, 6));
        assert_eq!(mc.join("a.ts", "1").unwrap().group.address, Ipv4Addr::new(239, 0, 0, 5));
        assert!(matches!(
            mc.join("b.ts", "2"),
            Err(RtspError::MulticastPoolExhausted)
        ));
        // Joining an existing group needs no address.
        assert!(mc.join("a.ts", "3").is_ok());
    }
}
