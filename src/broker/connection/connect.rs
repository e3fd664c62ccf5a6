//! CONNECT packet handling

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::{Connection, ConnectionError, State};
use crate::codec::encode_connack;
use crate::hooks::AuthDecision;
use crate::protocol::{Connect, DecodeError, Packet, ProtocolError, ReturnCode};
use crate::session::{RegisterOutcome, Session, SessionRegistry, TakeoverPolicy};

/// How long a takeover waits for the evicted connection to close
pub(crate) const EVICTION_GRACE: Duration = Duration::from_secs(5);

/// Attempts at finding an unused server-assigned identifier
const ASSIGN_ATTEMPTS: usize = 8;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Read and process the CONNECT packet
    pub(crate) async fn read_connect(&mut self) -> Result<Arc<Session>, ConnectionError> {
        loop {
            match self.decoder.decode(&self.read_buf) {
                Ok(Some((packet, consumed))) => {
                    bytes::Buf::advance(&mut self.read_buf, consumed);
                    self.record_packet(packet.packet_type(), consumed);

                    return match packet {
                        Packet::Connect(connect) => self.handle_connect(*connect).await,
                        other => {
                            debug!(
                                "First packet from {:?} was {}, not CONNECT",
                                self.peer,
                                other.packet_type().as_str()
                            );
                            Err(ProtocolError::ProtocolViolation("first packet must be CONNECT")
                                .into())
                        }
                    };
                }
                Ok(None) => {
                    // Need more data
                }
                Err(DecodeError::UnsupportedVersion(level)) => {
                    debug!(
                        "Unsupported protocol level {} from {:?}",
                        level, self.peer
                    );
                    return Err(self.refuse(ReturnCode::UnacceptableProtocolVersion).await);
                }
                Err(e) => {
                    debug!("Malformed CONNECT from {:?}: {}", self.peer, e);
                    return Err(e.into());
                }
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(ConnectionError::Transport(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed before CONNECT",
                )));
            }
        }
    }

    /// Validate a CONNECT, register its session and acknowledge it
    pub(crate) async fn handle_connect(
        &mut self,
        connect: Connect,
    ) -> Result<Arc<Session>, ConnectionError> {
        // [MQTT-3.1.3-8] zero-byte id needs clean session
        let client_id: Arc<str> = if connect.client_id.is_empty() {
            if !connect.clean_session {
                debug!(
                    "Rejecting empty client ID with clean_session=false from {:?}",
                    self.peer
                );
                return Err(self.refuse(ReturnCode::IdentifierRejected).await);
            }
            self.assign_client_id()
        } else {
            let max_len = self.ctx.config.max_client_id_len;
            if max_len > 0 && connect.client_id.len() > max_len {
                debug!(
                    "Rejecting client ID of {} bytes (limit {}) from {:?}",
                    connect.client_id.len(),
                    max_len,
                    self.peer
                );
                return Err(self.refuse(ReturnCode::IdentifierRejected).await);
            }
            connect.client_id.as_str().into()
        };

        debug!("CONNECT from {:?} (client_id: {})", self.peer, client_id);

        let decision = self
            .ctx
            .hooks
            .on_authenticate(
                &client_id,
                connect.username.as_deref(),
                connect.password.as_deref(),
            )
            .await;

        match decision {
            Ok(AuthDecision::Accept) => {
                debug!("Authentication successful for {}", client_id);
            }
            Ok(decision) => {
                debug!("Authentication failed for {}: {:?}", client_id, decision);
                return Err(self.refuse(decision.return_code()).await);
            }
            Err(e) => {
                warn!("Authentication error for {}: {}", client_id, e);
                return Err(self.refuse(ReturnCode::ServerUnavailable).await);
            }
        }

        // A takeover does not grow the session count
        let max_connections = self.ctx.config.max_connections;
        if max_connections > 0
            && !self.ctx.registry.contains(&client_id)
            && self.ctx.registry.len() >= max_connections
        {
            debug!(
                "Max connections ({}) reached, rejecting {}",
                max_connections, client_id
            );
            return Err(self.refuse(ReturnCode::ServerUnavailable).await);
        }

        let keep_alive = self.negotiate_keep_alive(connect.keep_alive);
        let clean_session = connect.clean_session;
        let session = Arc::new(
            Session::new(client_id.clone(), keep_alive, clean_session)
                .with_will(connect.will)
                .with_username(connect.username)
                .with_peer(self.peer),
        );

        let previous = match self.ctx.config.takeover {
            TakeoverPolicy::Replace => match self.ctx.registry.register(session.clone()) {
                RegisterOutcome::Inserted => None,
                RegisterOutcome::Replaced(old) => Some(old),
            },
            TakeoverPolicy::Reject => match self.ctx.registry.register_exclusive(session.clone()) {
                Ok(()) => None,
                Err(existing) => {
                    debug!(
                        "Client ID {} already in use by {:?}, rejecting",
                        client_id, existing.peer
                    );
                    return Err(self.refuse(ReturnCode::IdentifierRejected).await);
                }
            },
        };

        // Rolled back if this future ends or is dropped before Established
        let registration = PendingRegistration::new(self.ctx.registry.clone(), session.clone());

        let session_present = match previous {
            Some(old) => {
                let present = !clean_session && !old.clean_session && old.is_live();
                self.take_over(&old).await;
                present
            }
            None => false,
        };

        // Never acknowledged on failure, so no will and no disconnect event
        self.write_connack(session_present, ReturnCode::Accepted).await?;

        registration.commit();
        if let Some(ref metrics) = self.ctx.metrics {
            metrics.session_opened();
        }
        self.state = State::Established(session.clone());

        info!(
            "Client {} connected from {:?} (keep_alive={}s, clean_session={}, session_present={})",
            client_id, self.peer, keep_alive, clean_session, session_present
        );

        Ok(session)
    }

    /// Send a refusing CONNACK and return the error that closes the connection
    pub(crate) async fn refuse(&mut self, code: ReturnCode) -> ConnectionError {
        debug!("Refusing {:?} with {}", self.peer, code);
        match self.write_connack(false, code).await {
            Ok(()) => ConnectionError::Refused(code),
            Err(e) => ConnectionError::Transport(e),
        }
    }

    /// Write one CONNACK and flush it
    pub(crate) async fn write_connack(
        &mut self,
        session_present: bool,
        code: ReturnCode,
    ) -> std::io::Result<()> {
        let connack = encode_connack(session_present, code);
        self.stream.write_all(&connack).await?;
        self.stream.flush().await?;

        if let Some(ref metrics) = self.ctx.metrics {
            metrics.connack_sent(code, self.accepted_at.elapsed());
        }
        Ok(())
    }

    /// Evict the session previously registered under the same identifier
    async fn take_over(&self, old: &Arc<Session>) {
        if !old.evict() {
            // Its owner is already tearing down
            return;
        }
        info!("Session {} taken over by {:?}", old.client_id, self.peer);
        if let Some(ref metrics) = self.ctx.metrics {
            metrics.session_taken_over();
        }
        if !old.wait_closed(EVICTION_GRACE).await {
            warn!(
                "Evicted session {} did not close within {:?}",
                old.client_id, EVICTION_GRACE
            );
        }
    }

    /// Keep alive actually enforced for a requested interval
    ///
    /// A `max_keep_alive` of 0 leaves the requested interval uncapped.
    pub(crate) fn negotiate_keep_alive(&self, requested: u16) -> u16 {
        let max = self.ctx.config.max_keep_alive;
        match requested {
            0 => self.ctx.config.default_keep_alive,
            requested if max > 0 => requested.min(max),
            requested => requested,
        }
    }

    /// Generate a client identifier no live session uses
    pub(crate) fn assign_client_id(&self) -> Arc<str> {
        let prefix = &self.ctx.config.client_id_prefix;
        let mut client_id: Arc<str> = format!("{}{:016x}", prefix, rand_id()).into();
        for _ in 1..ASSIGN_ATTEMPTS {
            if !self.ctx.registry.contains(&client_id) {
                break;
            }
            client_id = format!("{}{:016x}", prefix, rand_id()).into();
        }
        debug!("Assigned client ID {}", client_id);
        client_id
    }
}

/// A registered session that has not been acknowledged yet
///
/// Dropping it unregisters the session and marks it closed.
struct PendingRegistration {
    registry: Arc<SessionRegistry>,
    session: Option<Arc<Session>>,
}

impl PendingRegistration {
    fn new(registry: Arc<SessionRegistry>, session: Arc<Session>) -> Self {
        Self {
            registry,
            session: Some(session),
        }
    }

    /// Keep the registration, the connection now owns the session
    fn commit(mut self) {
        self.session = None;
    }
}

impl Drop for PendingRegistration {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            debug!("Rolling back registration of {}", session.client_id);
            self.registry.unregister(&session);
            session.mark_closed();
        }
    }
}

/// Generate a random ID
fn rand_id() -> u64 {
    RandomState::new().build_hasher().finish()
}
