//! Hooks Module
//!
//! Collaborator seams of the connection core: authentication, will
//! publication, handling of non-handshake packets, and connect/disconnect
//! notifications.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;

use crate::protocol::{PacketType, RawPacket, ReturnCode, Will};


/// Hook error types
#[derive(Debug)]
pub enum HookError {
    /// Internal error
    Internal(String),
    /// Backing service (credential store, router) is unreachable
    Unavailable(String),
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookError::Internal(msg) => write!(f, "Internal error: {}", msg),
            HookError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

impl std::error::Error for HookError {}

/// Hook result type
pub type HookResult<T> = Result<T, HookError>;

/// Outcome of an authentication check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    /// Credentials accepted
    Accept,
    /// Credentials supplied but wrong
    BadCredentials,
    /// Credentials required but missing, or client not allowed
    NotAuthorized,
}

impl AuthDecision {
    /// CONNACK return code for this decision
    pub fn return_code(self) -> ReturnCode {
        match self {
            AuthDecision::Accept => ReturnCode::Accepted,
            AuthDecision::BadCredentials => ReturnCode::BadCredentials,
            AuthDecision::NotAuthorized => ReturnCode::NotAuthorized,
        }
    }
}

/// PINGRESP bytes
const PINGRESP: [u8; 2] = [0xD0, 0x00];

/// Broker hooks trait
///
/// Implement this trait to customize authentication and event handling.
/// All methods have default implementations that accept every client.
#[async_trait]
pub trait Hooks: Send + Sync {
    /// Called when a client attempts to authenticate
    ///
    /// # Returns
    /// * `Ok(decision)` - CONNACK is sent with `decision.return_code()`
    /// * `Err(_)` - Backend failure, refused with ServerUnavailable
    async fn on_authenticate(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _password: Option<&[u8]>,
    ) -> HookResult<AuthDecision> {
        Ok(AuthDecision::Accept) // Default: allow all
    }

    /// Called after a client successfully connects
    ///
    /// This is called after the session is registered and CONNACK is sent.
    async fn on_client_connected(&self, _client_id: &str, _username: Option<&str>) {
        // Default: no-op
    }

    /// Called after a client disconnects
    ///
    /// # Arguments
    /// * `client_id` - The client identifier
    /// * `graceful` - Whether the disconnect was graceful (DISCONNECT packet received)
    async fn on_client_disconnected(&self, _client_id: &str, _graceful: bool) {
        // Default: no-op
    }

    /// Called when a session ends abnormally and carried a will message
    async fn on_will(&self, _client_id: &str, _will: &Will) {
        // Default: no-op
    }

    /// Called for every packet an established client sends, other than DISCONNECT
    ///
    /// Returned bytes are written back to the client verbatim. An error
    /// tears the connection down.
    async fn on_packet(&self, _client_id: &str, packet: &RawPacket) -> HookResult<Option<Bytes>> {
        // Default: answer PINGREQ, ignore everything else
        if packet.packet_type == PacketType::PingReq {
            return Ok(Some(Bytes::from_static(&PINGRESP)));
        }
        Ok(None)
    }
}

/// Default hooks implementation that allows everything
pub struct DefaultHooks;

#[async_trait]
impl Hooks for DefaultHooks {
    // All methods use default implementations (allow all, no-op)
}

impl Default for DefaultHooks {
    fn default() -> Self {
        Self
    }
}

/// Implement Hooks for Arc<T> where T: Hooks
/// This allows Arc-wrapped hook providers to be used directly
#[async_trait]
impl<T: Hooks + ?Sized> Hooks for std::sync::Arc<T> {
    async fn on_authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> HookResult<AuthDecision> {
        (**self)
            .on_authenticate(client_id, username, password)
            .await
    }

    async fn on_client_connected(&self, client_id: &str, username: Option<&str>) {
        (**self).on_client_connected(client_id, username).await;
    }

    async fn on_client_disconnected(&self, client_id: &str, graceful: bool) {
        (**self).on_client_disconnected(client_id, graceful).await;
    }

    async fn on_will(&self, client_id: &str, will: &Will) {
        (**self).on_will(client_id, will).await;
    }

    async fn on_packet(&self, client_id: &str, packet: &RawPacket) -> HookResult<Option<Bytes>> {
        (**self).on_packet(client_id, packet).await
    }
}

/// Composite hooks that chains multiple hook implementations
///
/// For authentication: the first decision other than `Accept` wins
/// For packets: the first reply wins
/// For events: all hooks are called in order
pub struct CompositeHooks {
    hooks: Vec<Box<dyn Hooks>>,
}

impl CompositeHooks {
    /// Create a new composite hooks instance
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    /// Add a hooks implementation
    pub fn add<H: Hooks + 'static>(&mut self, hooks: H) {
        self.hooks.push(Box::new(hooks));
    }

    /// Add a hooks implementation and return self for chaining
    pub fn with<H: Hooks + 'static>(mut self, hooks: H) -> Self {
        self.add(hooks);
        self
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl Default for CompositeHooks {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Hooks for CompositeHooks {
    async fn on_authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> HookResult<AuthDecision> {
        for hooks in &self.hooks {
            let decision = hooks.on_authenticate(client_id, username, password).await?;
            if decision != AuthDecision::Accept {
                return Ok(decision);
            }
        }
        Ok(AuthDecision::Accept)
    }

    async fn on_client_connected(&self, client_id: &str, username: Option<&str>) {
        for hooks in &self.hooks {
            hooks.on_client_connected(client_id, username).await;
        }
    }

    async fn on_client_disconnected(&self, client_id: &str, graceful: bool) {
        for hooks in &self.hooks {
            hooks.on_client_disconnected(client_id, graceful).await;
        }
    }

    async fn on_will(&self, client_id: &str, will: &Will) {
        for hooks in &self.hooks {
            hooks.on_will(client_id, will).await;
        }
    }

    async fn on_packet(&self, client_id: &str, packet: &RawPacket) -> HookResult<Option<Bytes>> {
        for hooks in &self.hooks {
            if let Some(reply) = hooks.on_packet(client_id, packet).await? {
                return Ok(Some(reply));
            }
        }
        Ok(None)
    }
}
