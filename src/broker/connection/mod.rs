//! MQTT Connection Handler
//!
//! Drives one transport from accept to close:
//! `AwaitingConnect -> Established -> Closed`. A refused CONNECT goes
//! straight to `Closed` after its CONNACK.
//!
//! The handler is generic over the stream so tests can run it over
//! `tokio::io::duplex` without sockets.

mod connect;
mod disconnect;

#[cfg(test)]
mod tests;

pub(crate) use connect::EVICTION_GRACE;
pub use disconnect::Teardown;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::broker::BrokerConfig;
use crate::codec::Decoder;
use crate::hooks::{HookError, Hooks};
use crate::metrics::Metrics;
use crate::protocol::{DecodeError, Packet, PacketType, ProtocolError, ReturnCode};
use crate::session::{Session, SessionRegistry, SessionStatus};

/// Initial read buffer capacity
const READ_BUFFER_CAPACITY: usize = 4096;

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    /// Read or write failure, or end of stream before CONNECT
    Transport(std::io::Error),
    /// Bytes that do not frame or parse, closed without reply
    Decode(DecodeError),
    /// Well-formed packet in the wrong place
    Protocol(ProtocolError),
    /// CONNECT refused, the CONNACK carrying this code was sent
    Refused(ReturnCode),
    /// Collaborator failure while established
    Hook(HookError),
    /// No complete CONNECT within the connect timeout
    Timeout,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Transport(e) => write!(f, "Transport error: {}", e),
            ConnectionError::Decode(e) => write!(f, "Decode error: {}", e),
            ConnectionError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ConnectionError::Refused(code) => write!(f, "Connection refused: {}", code),
            ConnectionError::Hook(e) => write!(f, "Hook error: {}", e),
            ConnectionError::Timeout => write!(f, "Connect timeout"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Transport(e)
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        ConnectionError::Decode(e)
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        ConnectionError::Protocol(e)
    }
}

impl From<HookError> for ConnectionError {
    fn from(e: HookError) -> Self {
        ConnectionError::Hook(e)
    }
}

/// Connection state
#[derive(Debug)]
pub enum State {
    /// Waiting for CONNECT, the only state where it is legal
    AwaitingConnect,
    /// CONNACK 0 sent, session registered
    Established(Arc<Session>),
    /// Terminal, the transport has been shut down
    Closed,
}

impl State {
    pub fn is_closed(&self) -> bool {
        matches!(self, State::Closed)
    }
}

/// Everything a connection shares with the rest of the broker
#[derive(Clone)]
pub struct ConnectionContext {
    pub registry: Arc<SessionRegistry>,
    pub config: BrokerConfig,
    pub hooks: Arc<dyn Hooks>,
    pub metrics: Option<Arc<Metrics>>,
}

/// Connection handler - generic over the stream type
pub struct Connection<S> {
    pub(crate) stream: S,
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) state: State,
    pub(crate) decoder: Decoder,
    pub(crate) read_buf: BytesMut,
    pub(crate) ctx: ConnectionContext,
    pub(crate) shutdown: Option<broadcast::Receiver<()>>,
    pub(crate) accepted_at: Instant,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, peer: Option<SocketAddr>, ctx: ConnectionContext) -> Self {
        Self {
            stream,
            peer,
            state: State::AwaitingConnect,
            decoder: Decoder::new().with_max_packet_size(ctx.config.max_packet_size),
            read_buf: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            ctx,
            shutdown: None,
            accepted_at: Instant::now(),
        }
    }

    /// Tear down an established session when the broker shuts down
    ///
    /// A connection still awaiting CONNECT is bounded by the connect
    /// timeout instead.
    pub fn with_shutdown(mut self, shutdown: broadcast::Receiver<()>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// Run the connection to completion
    ///
    /// Returns `Ok` when an established session ended through DISCONNECT,
    /// end of stream, keep alive expiry, takeover or shutdown. Every other
    /// ending is reported as an error; the transport is closed either way.
    pub async fn run(&mut self) -> Result<(), ConnectionError> {
        let connect_timeout = self.ctx.config.connect_timeout;

        let result = match timeout(connect_timeout, self.read_connect()).await {
            Ok(result) => result,
            Err(_) => {
                debug!("Connect timeout from {:?}", self.peer);
                Err(ConnectionError::Timeout)
            }
        };

        let session = match result {
            Ok(session) => session,
            Err(e) => {
                self.close().await;
                return Err(e);
            }
        };

        // Acknowledged, no longer bounded by the connect timeout
        self.ctx
            .hooks
            .on_client_connected(&session.client_id, session.username.as_deref())
            .await;

        let mut shutdown = self.shutdown.take();
        self.run_established(session, &mut shutdown).await
    }

    /// Run the established session until something ends it, then tear down
    async fn run_established(
        &mut self,
        session: Arc<Session>,
        shutdown: &mut Option<broadcast::Receiver<()>>,
    ) -> Result<(), ConnectionError> {
        let outcome = self.drive(&session, shutdown).await;
        let reason = match &outcome {
            Ok(reason) => *reason,
            Err(e) => {
                debug!("Session {} failed: {}", session.client_id, e);
                Teardown::Failed
            }
        };
        self.teardown(&session, reason).await;
        outcome.map(|_| ())
    }

    /// Main loop of an established session
    async fn drive(
        &mut self,
        session: &Arc<Session>,
        shutdown: &mut Option<broadcast::Receiver<()>>,
    ) -> Result<Teardown, ConnectionError> {
        let keep_alive = session.keep_alive_timeout();
        debug!(
            "Keep alive for {}: {}s -> timeout {:?}",
            session.client_id, session.keep_alive, keep_alive
        );

        let mut status = session.subscribe();
        let mut deadline = keep_alive.map(|d| tokio::time::Instant::now() + d);

        loop {
            // Packets pipelined behind CONNECT may already be buffered
            while let Some((packet, consumed)) = self.decoder.decode(&self.read_buf)? {
                self.read_buf.advance(consumed);
                self.record_packet(packet.packet_type(), consumed);
                if let Some(keep_alive) = keep_alive {
                    deadline = Some(tokio::time::Instant::now() + keep_alive);
                }

                match packet {
                    Packet::Disconnect => return Ok(Teardown::Disconnect),
                    Packet::Connect(_) => {
                        warn!("Second CONNECT from {}", session.client_id);
                        return Err(ProtocolError::ProtocolViolation("duplicate CONNECT").into());
                    }
                    Packet::ConnAck(_) => {
                        return Err(ProtocolError::ProtocolViolation("CONNACK from client").into());
                    }
                    Packet::Other(raw) => {
                        trace!(
                            "{} from {} ({} bytes)",
                            raw.packet_type.as_str(),
                            session.client_id,
                            raw.body.len()
                        );
                        let reply = self.ctx.hooks.on_packet(&session.client_id, &raw).await?;
                        if let Some(reply) = reply {
                            self.stream.write_all(&reply).await?;
                            self.stream.flush().await?;
                            if let Some(ref metrics) = self.ctx.metrics {
                                metrics.bytes_sent(reply.len());
                            }
                        }
                    }
                }
            }

            tokio::select! {
                result = self.stream.read_buf(&mut self.read_buf) => {
                    if result? == 0 {
                        return Ok(Teardown::PeerClosed);
                    }
                }
                _ = sleep_until(deadline) => {
                    return Ok(Teardown::KeepAliveTimeout);
                }
                _ = wait_evicted(&mut status) => {
                    return Ok(Teardown::TakenOver);
                }
                _ = recv_shutdown(shutdown) => {
                    return Ok(Teardown::Shutdown);
                }
            }
        }
    }

    /// Shut the transport down and enter `Closed`
    pub(crate) async fn close(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            trace!("Transport shutdown for {:?} failed: {}", self.peer, e);
        }
        self.state = State::Closed;
    }

    fn record_packet(&self, packet_type: PacketType, bytes: usize) {
        if let Some(ref metrics) = self.ctx.metrics {
            metrics.packet_received(packet_type, bytes);
        }
    }
}

/// Sleep until the deadline, or forever when keep alive is disabled
async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Resolve once the session is no longer live
async fn wait_evicted(status: &mut watch::Receiver<SessionStatus>) {
    let changed = status
        .wait_for(|status| *status != SessionStatus::Live)
        .await
        .map(|_| ());
    if changed.is_err() {
        // Sender lives in the session, which the caller holds
        std::future::pending::<()>().await;
    }
}

/// Resolve on broker shutdown, or never without a shutdown channel
async fn recv_shutdown(shutdown: &mut Option<broadcast::Receiver<()>>) {
    match shutdown {
        Some(rx) => loop {
            match rx.recv().await {
                Ok(()) | Err(broadcast::error::RecvError::Closed) => return,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
            }
        },
        None => std::future::pending().await,
    }
}
