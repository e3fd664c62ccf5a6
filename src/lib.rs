//! mqgate - MQTT 3.1.1 connection gateway
//!
//! The broker-side connection handshake and session teardown of an MQTT
//! 3.1.1 broker: decode CONNECT, validate it, register the session,
//! answer with CONNACK, and release everything on DISCONNECT, transport
//! closure, keep alive expiry or takeover.

pub mod auth;
pub mod broker;
pub mod codec;
pub mod config;
pub mod hooks;
pub mod metrics;
pub mod protocol;
pub mod session;
pub mod transport;

pub use auth::AuthProvider;
pub use broker::{Broker, BrokerConfig};
pub use config::Config;
pub use hooks::{AuthDecision, CompositeHooks, DefaultHooks, Hooks};
pub use metrics::{Metrics, MetricsServer};
pub use protocol::{Packet, ReturnCode};
pub use session::{Session, SessionRegistry, TakeoverPolicy};
