use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::Session;

/// Session identifiers are decimal numbers below this bound.
const MAX_SESSION_ID: u64 = 9_999_999_999;

/// Thread-safe index of live sessions.
///
/// A session is inserted when its control connection is accepted and
/// removed by its teardown.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick an unused id, build the session for it, and insert it, all
    /// under one lock so ids never collide.
    pub fn register_with(&self, make: impl FnOnce(String) -> Arc<Session>) -> Arc<Session> {
        let mut sessions = self.sessions.write();
        let id = loop {
            let candidate = rand::random_range(1..MAX_SESSION_ID).to_string();
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        let session = make(id.clone());
        sessions.insert(id.clone(), session.clone());
        tracing::debug!(session_id = %id, total_sessions = sessions.len(), "session registered");
        session
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.write().remove(id);
        if removed.is_some() {
            tracing::debug!(session_id = %id, "session removed");
        }
        removed
    }

    /// Every live session, for shutdown.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
