use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

/// What the server knows about one open worker connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: u64,
    pub peer: SocketAddr,
    /// Set from the first request that names a machine.
    pub machine_id: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_request_at: Option<DateTime<Utc>>,
    pub requests: u64,
}

/// Live worker sessions, owned by the server and shared with the status API.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    next_id: AtomicU64,
    sessions: DashMap<u64, SessionInfo>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection. The session is removed when the returned
    /// handle is dropped.
    pub fn register(self: &Arc<Self>, peer: SocketAddr) -> SessionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.sessions.insert(
            id,
            SessionInfo {
                id,
                peer,
                machine_id: None,
                connected_at: Utc::now(),
                last_request_at: None,
                requests: 0,
            },
        );
        tracing::debug!(session_id = id, peer = %peer, "Session registered");
        SessionHandle {
            registry: Arc::clone(self),
            id,
        }
    }

    pub fn record_request(&self, id: u64, machine_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(&id) {
            if session.machine_id.as_deref() != Some(machine_id) {
                session.machine_id = Some(machine_id.to_string());
            }
            session.last_request_at = Some(Utc::now());
            session.requests += 1;
        }
    }

    pub fn get(&self, id: u64) -> Option<SessionInfo> {
        self.sessions.get(&id).map(|s| s.clone())
    }

    pub fn find_by_machine(&self, machine_id: &str) -> Vec<SessionInfo> {
        let mut found: Vec<SessionInfo> = self
            .sessions
            .iter()
            .filter(|s| s.machine_id.as_deref() == Some(machine_id))
            .map(|s| s.clone())
            .collect();
        found.sort_by_key(|s| s.id);
        found
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self.sessions.iter().map(|s| s.clone()).collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn deregister(&self, id: u64) {
        if self.sessions.remove(&id).is_some() {
            tracing::debug!(session_id = id, "Session deregistered");
        }
    }
}

/// Keeps a session listed while alive.
#[derive(Debug)]
pub struct SessionHandle {
    registry: Arc<SessionRegistry>,
    id: u64,
}

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn sessions_live_as_long_as_their_handle() {
        let registry = Arc::new(SessionRegistry::new());
        let first = registry.register(peer());
        let second = registry.register(peer());
        assert_ne!(first.id(), second.id());
        assert_eq!(registry.len(), 2);

        drop(first);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.list()[0].id, second.id());
    }

    #[test]
    fn requests_name_the_machine() {
        let registry = Arc::new(SessionRegistry::new());
        let handle = registry.register(peer());
        registry.record_request(handle.id(), "m1");
        registry.record_request(handle.id(), "m1");

        let info = registry.get(handle.id()).unwrap();
        assert_eq!(info.machine_id.as_deref(), Some("m1"));
        assert_eq!(info.requests, 2);
        assert!(info.last_request_at.is_some());
        assert_eq!(registry.find_by_machine("m1").len(), 1);
        assert!(registry.find_by_machine("m2").is_empty());
    }
}
