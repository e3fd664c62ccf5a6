//! MQTT Session Management
//!
//! A [`Session`] is the registry's handle on one live client connection.
//! The [`SessionRegistry`] guarantees at most one live session per client
//! identifier; replacing a session signals the old owner through a watch
//! channel so its connection task can tear down.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::protocol::Will;


/// Lifecycle of a session as seen by other tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Owned by a running connection
    Live,
    /// Replaced by a newer connection, owner must tear down
    Evicted,
    /// Owner finished teardown and closed its transport
    Closed,
}

/// What to do when a CONNECT reuses a live client identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TakeoverPolicy {
    /// Evict the existing session (MQTT-3.1.4-2)
    #[default]
    Replace,
    /// Refuse the newcomer with IdentifierRejected
    Reject,
}

/// Live client session
pub struct Session {
    /// Client identifier
    pub client_id: Arc<str>,
    /// Negotiated keep alive interval in seconds (0 = disabled)
    pub keep_alive: u16,
    /// Clean session flag
    pub clean_session: bool,
    /// Creation timestamp
    pub created_at: Instant,
    /// Authenticated username
    pub username: Option<String>,
    /// Remote address, when the transport has one
    pub peer: Option<SocketAddr>,
    /// Will message, taken at most once
    will: Mutex<Option<Will>>,
    /// Status channel
    status: watch::Sender<SessionStatus>,
}

impl Session {
    pub fn new(client_id: impl Into<Arc<str>>, keep_alive: u16, clean_session: bool) -> Self {
        let (status, _) = watch::channel(SessionStatus::Live);
        Self {
            client_id: client_id.into(),
            keep_alive,
            clean_session,
            created_at: Instant::now(),
            username: None,
            peer: None,
            will: Mutex::new(None),
            status,
        }
    }

    pub fn with_will(self, will: Option<Will>) -> Self {
        *self.will.lock() = will;
        self
    }

    pub fn with_username(mut self, username: Option<String>) -> Self {
        self.username = username;
        self
    }

    pub fn with_peer(mut self, peer: Option<SocketAddr>) -> Self {
        self.peer = peer;
        self
    }

    /// Keep alive deadline: 1.5x the interval [MQTT-3.1.2-24]
    pub fn keep_alive_timeout(&self) -> Option<Duration> {
        if self.keep_alive == 0 {
            None
        } else {
            Some(Duration::from_millis(self.keep_alive as u64 * 1500))
        }
    }

    pub fn has_will(&self) -> bool {
        self.will.lock().is_some()
    }

    /// Take the will message, leaving none behind
    pub fn take_will(&self) -> Option<Will> {
        self.will.lock().take()
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn is_live(&self) -> bool {
        self.status() == SessionStatus::Live
    }

    /// Subscribe to status changes
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Ask the owning connection to tear down
    ///
    /// Returns false if the session was already evicted or closed.
    pub fn evict(&self) -> bool {
        self.status.send_if_modified(|status| {
            if *status == SessionStatus::Live {
                *status = SessionStatus::Evicted;
                true
            } else {
                false
            }
        })
    }

    /// Record that the owner has closed its transport
    pub fn mark_closed(&self) {
        self.status.send_replace(SessionStatus::Closed);
    }

    /// Wait until the owner has closed its transport
    ///
    /// Returns false if the timeout elapsed first.
    pub async fn wait_closed(&self, timeout: Duration) -> bool {
        let mut rx = self.subscribe();
        let closed = rx.wait_for(|status| *status == SessionStatus::Closed);
        let result = tokio::time::timeout(timeout, closed)
            .await
            .map(|changed| changed.is_ok());
        result.unwrap_or(false)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.client_id)
            .field("keep_alive", &self.keep_alive)
            .field("clean_session", &self.clean_session)
            .field("username", &self.username)
            .field("peer", &self.peer)
            .field("status", &self.status())
            .finish()
    }
}

/// Result of registering a session
#[derive(Debug)]
pub enum RegisterOutcome {
    /// No session held the identifier
    Inserted,
    /// The returned session held the identifier and has been removed
    Replaced(Arc<Session>),
}

/// Thread-safe registry of live sessions keyed by client identifier
pub struct SessionRegistry {
    sessions: DashMap<Arc<str>, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Register a session, replacing any session with the same identifier
    pub fn register(&self, session: Arc<Session>) -> RegisterOutcome {
        match self.sessions.insert(session.client_id.clone(), session) {
            Some(old) => RegisterOutcome::Replaced(old),
            None => RegisterOutcome::Inserted,
        }
    }

    /// Register a session only if the identifier is free
    ///
    /// On conflict the session currently holding the identifier is returned.
    pub fn register_exclusive(&self, session: Arc<Session>) -> Result<(), Arc<Session>> {
        match self.sessions.entry(session.client_id.clone()) {
            Entry::Occupied(existing) => Err(existing.get().clone()),
            Entry::Vacant(slot) => {
                slot.insert(session);
                Ok(())
            }
        }
    }

    /// Remove a session if it is still the one registered under its identifier
    ///
    /// A stale teardown never removes a newer session that reused the id.
    pub fn unregister(&self, session: &Arc<Session>) -> bool {
        self.sessions
            .remove_if(&session.client_id, |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    /// Get a session by client ID
    pub fn lookup(&self, client_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(client_id).map(|r| r.clone())
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.sessions.contains_key(client_id)
    }

    /// Get session count
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of registered client identifiers
    pub fn client_ids(&self) -> Vec<Arc<str>> {
        self.sessions.iter().map(|r| r.key().clone()).collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
