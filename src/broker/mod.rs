//! MQTT Broker Core
//!
//! Accepts TCP connections and runs each one through the connection
//! handshake state machine on its own task.

mod connection;

pub use connection::{Connection, ConnectionContext, ConnectionError, State, Teardown};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::hooks::{DefaultHooks, Hooks};
use crate::metrics::Metrics;
use crate::session::{SessionRegistry, TakeoverPolicy};
use crate::transport::{configure_stream, TransportConfig};

/// Poll interval while waiting for sessions to drain
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// TCP bind address
    pub bind_addr: SocketAddr,
    /// Maximum live sessions (0 = unbounded)
    pub max_connections: usize,
    /// Maximum packet size
    pub max_packet_size: usize,
    /// Time allowed for a complete CONNECT after accept
    pub connect_timeout: Duration,
    /// Keep alive applied when a client asks for 0 (0 = disabled)
    pub default_keep_alive: u16,
    /// Maximum keep alive
    pub max_keep_alive: u16,
    /// Longest accepted client identifier (0 = unbounded)
    pub max_client_id_len: usize,
    /// Prefix of server-assigned client identifiers
    pub client_id_prefix: String,
    /// Behaviour on a colliding client identifier
    pub takeover: TakeoverPolicy,
    /// Socket options for accepted connections
    pub transport: TransportConfig,
}

impl BrokerConfig {
    /// Build from a loaded configuration file
    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_addr: config.server.bind,
            max_connections: config.limits.max_connections,
            max_packet_size: config.limits.max_packet_size,
            connect_timeout: config.limits.connect_timeout,
            default_keep_alive: config.session.default_keep_alive,
            max_keep_alive: config.session.max_keep_alive,
            max_client_id_len: config.session.max_client_id_len,
            client_id_prefix: config.session.client_id_prefix.clone(),
            takeover: config.session.takeover,
            transport: TransportConfig {
                tcp_nodelay: config.server.tcp_nodelay,
                tcp_keepalive: config.server.tcp_keepalive,
            },
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// The MQTT Broker
pub struct Broker {
    /// Configuration
    config: BrokerConfig,
    /// Live sessions
    registry: Arc<SessionRegistry>,
    /// Shutdown signal
    shutdown: broadcast::Sender<()>,
    /// Hooks for auth and events
    hooks: Arc<dyn Hooks>,
    /// Metrics (optional)
    metrics: Option<Arc<Metrics>>,
}

impl Broker {
    /// Create a new broker with default hooks (allows everything)
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_hooks(config, Arc::new(DefaultHooks))
    }

    /// Create a new broker with custom hooks
    pub fn with_hooks(config: BrokerConfig, hooks: Arc<dyn Hooks>) -> Self {
        let (shutdown, _) = broadcast::channel(1);

        Self {
            config,
            registry: Arc::new(SessionRegistry::new()),
            shutdown,
            hooks,
            metrics: None,
        }
    }

    /// Set metrics collector
    pub fn set_metrics(&mut self, metrics: Arc<Metrics>) {
        self.metrics = Some(metrics);
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Shared session registry
    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Get session count
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Run the broker until Ctrl+C
    pub async fn run(&self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("MQTT/TCP listening on {}", listener.local_addr()?);

        tokio::select! {
            result = self.serve(listener) => result,
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received Ctrl+C, shutting down");
                self.shutdown();
                if !self.wait_drained(connection::EVICTION_GRACE).await {
                    info!("{} sessions still open at exit", self.session_count());
                }
                Ok(())
            }
        }
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        let mut shutdown_rx = self.shutdown.subscribe();

        debug!("Starting TCP accept loop");
        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    debug!("Accept loop stopped");
                    return Ok(());
                }
                result = listener.accept() => match result {
                    Ok((stream, addr)) => {
                        debug!("New TCP connection from {}", addr);
                        self.handle_connection(stream, addr);
                    }
                    Err(e) => {
                        error!("Failed to accept TCP connection: {}", e);
                    }
                }
            }
        }
    }

    /// Handle a new connection
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = configure_stream(&stream, &self.config.transport) {
            debug!("Failed to set socket options for {}: {}", addr, e);
        }

        let ctx = self.context();
        let shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let metrics = ctx.metrics.clone();
            if let Some(ref metrics) = metrics {
                metrics.connection_opened();
            }

            let mut conn = Connection::new(stream, Some(addr), ctx).with_shutdown(shutdown_rx);
            if let Err(e) = conn.run().await {
                debug!("Connection error from {}: {}", addr, e);
            }

            if let Some(ref metrics) = metrics {
                metrics.connection_closed();
            }
        });
    }

    /// Context handed to every connection
    pub fn context(&self) -> ConnectionContext {
        ConnectionContext {
            registry: self.registry.clone(),
            config: self.config.clone(),
            hooks: self.hooks.clone(),
            metrics: self.metrics.clone(),
        }
    }

    /// Shutdown the broker
    ///
    /// Stops accepting and tears down every established session.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Wait until no session is registered
    ///
    /// Returns false if the timeout elapsed first.
    pub async fn wait_drained(&self, timeout: Duration) -> bool {
        let drained = async {
            while !self.registry.is_empty() {
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}
