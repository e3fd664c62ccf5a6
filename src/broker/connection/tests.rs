//! Connection state machine tests over in-memory duplex streams

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::*;
use crate::codec::encode_connect;
use crate::hooks::{AuthDecision, DefaultHooks, HookResult};
use crate::protocol::{Connect, QoS, RawPacket, Will};
use crate::session::TakeoverPolicy;

const CONNACK_ACCEPTED: [u8; 4] = [0x20, 0x02, 0x00, 0x00];
const PINGREQ: [u8; 2] = [0xC0, 0x00];
const DISCONNECT: [u8; 2] = [0xE0, 0x00];

// ============================================================================
// Helpers
// ============================================================================

#[derive(Default)]
struct RecordingHooks {
    decision: Option<AuthDecision>,
    wills: Mutex<Vec<(String, String)>>,
    connected: Mutex<Vec<String>>,
    disconnected: Mutex<Vec<(String, bool)>>,
}

impl RecordingHooks {
    fn deciding(decision: AuthDecision) -> Self {
        Self {
            decision: Some(decision),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Hooks for RecordingHooks {
    async fn on_authenticate(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _password: Option<&[u8]>,
    ) -> HookResult<AuthDecision> {
        Ok(self.decision.unwrap_or(AuthDecision::Accept))
    }

    async fn on_client_connected(&self, client_id: &str, _username: Option<&str>) {
        self.connected.lock().push(client_id.to_string());
    }

    async fn on_client_disconnected(&self, client_id: &str, graceful: bool) {
        self.disconnected.lock().push((client_id.to_string(), graceful));
    }

    async fn on_will(&self, client_id: &str, will: &Will) {
        self.wills
            .lock()
            .push((client_id.to_string(), will.topic.clone()));
    }
}

struct BrokenBackend;

#[async_trait]
impl Hooks for BrokenBackend {
    async fn on_authenticate(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _password: Option<&[u8]>,
    ) -> HookResult<AuthDecision> {
        Err(HookError::Unavailable("backend down".into()))
    }
}

/// Echoes every forwarded packet body back
struct EchoHooks;

#[async_trait]
impl Hooks for EchoHooks {
    async fn on_packet(&self, _client_id: &str, packet: &RawPacket) -> HookResult<Option<Bytes>> {
        Ok(Some(packet.body.clone()))
    }
}

fn context(config: BrokerConfig, hooks: Arc<dyn Hooks>) -> ConnectionContext {
    ConnectionContext {
        registry: Arc::new(SessionRegistry::new()),
        config,
        hooks,
        metrics: None,
    }
}

fn default_context() -> ConnectionContext {
    context(BrokerConfig::default(), Arc::new(DefaultHooks))
}

type Running = JoinHandle<(Result<(), ConnectionError>, bool)>;

fn spawn(ctx: ConnectionContext) -> (DuplexStream, Running) {
    spawn_with_shutdown(ctx, None)
}

fn spawn_with_shutdown(
    ctx: ConnectionContext,
    shutdown: Option<broadcast::Receiver<()>>,
) -> (DuplexStream, Running) {
    let (client, server) = duplex(4096);
    let handle = tokio::spawn(async move {
        let mut conn = Connection::new(server, None, ctx);
        if let Some(shutdown) = shutdown {
            conn = conn.with_shutdown(shutdown);
        }
        let result = conn.run().await;
        (result, conn.state().is_closed())
    });
    (client, handle)
}

fn connect_bytes(connect: &Connect) -> Vec<u8> {
    let mut buf = BytesMut::new();
    encode_connect(connect, &mut buf).unwrap();
    buf.to_vec()
}

fn connect_packet(client_id: &str) -> Connect {
    Connect {
        client_id: client_id.to_string(),
        ..Default::default()
    }
}

fn with_will(client_id: &str) -> Connect {
    Connect {
        will: Some(Will {
            topic: "status/offline".to_string(),
            payload: Bytes::from_static(b"gone"),
            qos: QoS::AtLeastOnce,
            retain: false,
        }),
        ..connect_packet(client_id)
    }
}

async fn read_connack(client: &mut DuplexStream) -> [u8; 4] {
    let mut connack = [0u8; 4];
    client.read_exact(&mut connack).await.unwrap();
    connack
}

async fn read_rest(client: &mut DuplexStream) -> Vec<u8> {
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    rest
}

async fn establish(ctx: &ConnectionContext, connect: &Connect) -> (DuplexStream, Running) {
    let (mut client, handle) = spawn(ctx.clone());
    client.write_all(&connect_bytes(connect)).await.unwrap();
    assert_eq!(read_connack(&mut client).await[3], 0);
    (client, handle)
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_connect_then_disconnect() {
    let ctx = default_context();
    let (mut client, handle) = spawn(ctx.clone());

    client
        .write_all(&connect_bytes(&connect_packet("test-user")))
        .await
        .unwrap();
    assert_eq!(read_connack(&mut client).await, CONNACK_ACCEPTED);
    assert!(ctx.registry.contains("test-user"));

    client.write_all(&DISCONNECT).await.unwrap();
    assert_eq!(read_rest(&mut client).await, Vec::<u8>::new());

    let (result, closed) = handle.await.unwrap();
    assert!(result.is_ok());
    assert!(closed);
    assert!(ctx.registry.is_empty());
}

#[tokio::test]
async fn test_connect_and_disconnect_in_one_write() {
    let ctx = default_context();
    let (mut client, handle) = spawn(ctx.clone());

    let mut bytes = connect_bytes(&connect_packet("pipelined"));
    bytes.extend_from_slice(&DISCONNECT);
    client.write_all(&bytes).await.unwrap();

    assert_eq!(read_connack(&mut client).await, CONNACK_ACCEPTED);
    assert_eq!(read_rest(&mut client).await, Vec::<u8>::new());
    assert!(handle.await.unwrap().0.is_ok());
    assert!(ctx.registry.is_empty());
}

#[tokio::test]
async fn test_connect_split_across_writes() {
    let ctx = default_context();
    let (mut client, handle) = spawn(ctx.clone());

    let bytes = connect_bytes(&connect_packet("slow-writer"));
    for byte in bytes {
        client.write_all(&[byte]).await.unwrap();
    }
    assert_eq!(read_connack(&mut client).await, CONNACK_ACCEPTED);

    drop(client);
    assert!(handle.await.unwrap().0.is_ok());
}

#[tokio::test]
async fn test_reserved_flag_closes_without_connack() {
    let ctx = default_context();
    let (mut client, handle) = spawn(ctx.clone());

    // Connect flags 0x03: clean session plus the reserved bit
    let bytes = [
        0x10, 0x0D, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x03, 0x00, 0x3C, 0x00, 0x01, b'a',
    ];
    client.write_all(&bytes).await.unwrap();

    assert_eq!(read_rest(&mut client).await, Vec::<u8>::new());
    let (result, closed) = handle.await.unwrap();
    assert!(matches!(
        result,
        Err(ConnectionError::Decode(DecodeError::ProtocolViolation(_)))
    ));
    assert!(closed);
    assert!(ctx.registry.is_empty());
}

#[tokio::test]
async fn test_unsupported_level_gets_return_code_1() {
    let (mut client, handle) = spawn(default_context());

    let bytes = [
        0x10, 0x0D, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x03, 0x02, 0x00, 0x3C, 0x00, 0x01, b'a',
    ];
    client.write_all(&bytes).await.unwrap();

    assert_eq!(read_connack(&mut client).await, [0x20, 0x02, 0x00, 0x01]);
    assert_eq!(read_rest(&mut client).await, Vec::<u8>::new());
    let (result, _) = handle.await.unwrap();
    assert!(matches!(
        result,
        Err(ConnectionError::Refused(ReturnCode::UnacceptableProtocolVersion))
    ));
}

#[tokio::test]
async fn test_wrong_protocol_name_closes_without_connack() {
    let (mut client, handle) = spawn(default_context());

    let bytes = [
        0x10, 0x0F, 0x00, 0x06, b'M', b'Q', b'I', b's', b'd', b'p', 0x03, 0x02, 0x00, 0x3C, 0x00,
        0x01, b'a',
    ];
    client.write_all(&bytes).await.unwrap();

    assert_eq!(read_rest(&mut client).await, Vec::<u8>::new());
    let (result, _) = handle.await.unwrap();
    assert!(matches!(result, Err(ConnectionError::Decode(_))));
}

#[tokio::test]
async fn test_first_packet_must_be_connect() {
    let (mut client, handle) = spawn(default_context());

    client.write_all(&PINGREQ).await.unwrap();

    assert_eq!(read_rest(&mut client).await, Vec::<u8>::new());
    let (result, closed) = handle.await.unwrap();
    assert!(matches!(result, Err(ConnectionError::Protocol(_))));
    assert!(closed);
}

#[tokio::test]
async fn test_eof_before_connect() {
    let (client, handle) = spawn(default_context());
    drop(client);

    let (result, closed) = handle.await.unwrap();
    assert!(matches!(result, Err(ConnectionError::Transport(_))));
    assert!(closed);
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout() {
    let config = BrokerConfig {
        connect_timeout: Duration::from_secs(1),
        ..Default::default()
    };
    let (mut client, handle) = spawn(context(config, Arc::new(DefaultHooks)));

    assert_eq!(read_rest(&mut client).await, Vec::<u8>::new());
    let (result, _) = handle.await.unwrap();
    assert!(matches!(result, Err(ConnectionError::Timeout)));
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_during_takeover_rolls_back() {
    let config = BrokerConfig {
        connect_timeout: Duration::from_secs(1),
        ..Default::default()
    };
    let ctx = context(config, Arc::new(DefaultHooks));

    // Registered without an owning connection, so eviction never completes
    let stuck = Arc::new(Session::new("dup", 60, true));
    ctx.registry.register(stuck.clone());

    let (mut client, handle) = spawn(ctx.clone());
    client
        .write_all(&connect_bytes(&connect_packet("dup")))
        .await
        .unwrap();

    assert_eq!(read_rest(&mut client).await, Vec::<u8>::new());
    let (result, closed) = handle.await.unwrap();
    assert!(matches!(result, Err(ConnectionError::Timeout)));
    assert!(closed);
    assert_eq!(stuck.status(), SessionStatus::Evicted);
    assert!(ctx.registry.is_empty());

    // The identifier is free again
    let (_client, _handle) = establish(&ctx, &connect_packet("dup")).await;
    assert_eq!(ctx.registry.len(), 1);
}

// ============================================================================
// Client identifiers
// ============================================================================

#[tokio::test]
async fn test_empty_client_id_is_assigned() {
    let ctx = default_context();
    let (_client, _handle) = establish(&ctx, &connect_packet("")).await;

    let ids = ctx.registry.client_ids();
    assert_eq!(ids.len(), 1);
    assert!(ids[0].starts_with("mqgate-"));
    assert_eq!(ids[0].len(), "mqgate-".len() + 16);
}

#[tokio::test]
async fn test_assigned_ids_are_distinct() {
    let ctx = default_context();
    let (_a, _ha) = establish(&ctx, &connect_packet("")).await;
    let (_b, _hb) = establish(&ctx, &connect_packet("")).await;

    assert_eq!(ctx.registry.len(), 2);
}

#[tokio::test]
async fn test_empty_client_id_without_clean_session() {
    let ctx = default_context();
    let (mut client, handle) = spawn(ctx.clone());

    let connect = Connect {
        clean_session: false,
        ..connect_packet("")
    };
    client.write_all(&connect_bytes(&connect)).await.unwrap();

    assert_eq!(read_connack(&mut client).await, [0x20, 0x02, 0x00, 0x02]);
    assert_eq!(read_rest(&mut client).await, Vec::<u8>::new());
    let (result, _) = handle.await.unwrap();
    assert!(matches!(
        result,
        Err(ConnectionError::Refused(ReturnCode::IdentifierRejected))
    ));
    assert!(ctx.registry.is_empty());
}

#[tokio::test]
async fn test_client_id_over_limit() {
    let (mut client, _handle) = spawn(default_context());

    let long_id = "x".repeat(24);
    client
        .write_all(&connect_bytes(&connect_packet(&long_id)))
        .await
        .unwrap();

    assert_eq!(read_connack(&mut client).await, [0x20, 0x02, 0x00, 0x02]);
}

#[tokio::test]
async fn test_client_id_limit_disabled() {
    let config = BrokerConfig {
        max_client_id_len: 0,
        ..Default::default()
    };
    let ctx = context(config, Arc::new(DefaultHooks));
    let long_id = "x".repeat(100);
    let (_client, _handle) = establish(&ctx, &connect_packet(&long_id)).await;

    assert!(ctx.registry.contains(&long_id));
}

// ============================================================================
// Authentication and capacity
// ============================================================================

#[tokio::test]
async fn test_bad_credentials_return_code_4() {
    let hooks = Arc::new(RecordingHooks::deciding(AuthDecision::BadCredentials));
    let ctx = context(BrokerConfig::default(), hooks.clone());
    let (mut client, handle) = spawn(ctx.clone());

    let connect = Connect {
        username: Some("alice".into()),
        password: Some(Bytes::from_static(b"wrong")),
        ..connect_packet("c1")
    };
    client.write_all(&connect_bytes(&connect)).await.unwrap();

    assert_eq!(read_connack(&mut client).await, [0x20, 0x02, 0x00, 0x04]);
    assert_eq!(read_rest(&mut client).await, Vec::<u8>::new());
    handle.await.unwrap();
    assert!(ctx.registry.is_empty());
    assert!(hooks.connected.lock().is_empty());
}

#[tokio::test]
async fn test_not_authorized_return_code_5() {
    let hooks = Arc::new(RecordingHooks::deciding(AuthDecision::NotAuthorized));
    let (mut client, _handle) = spawn(context(BrokerConfig::default(), hooks));

    client
        .write_all(&connect_bytes(&connect_packet("c1")))
        .await
        .unwrap();

    assert_eq!(read_connack(&mut client).await, [0x20, 0x02, 0x00, 0x05]);
}

#[tokio::test]
async fn test_auth_backend_failure_return_code_3() {
    let (mut client, _handle) = spawn(context(BrokerConfig::default(), Arc::new(BrokenBackend)));

    client
        .write_all(&connect_bytes(&connect_packet("c1")))
        .await
        .unwrap();

    assert_eq!(read_connack(&mut client).await, [0x20, 0x02, 0x00, 0x03]);
}

#[tokio::test]
async fn test_capacity_reached() {
    let config = BrokerConfig {
        max_connections: 1,
        ..Default::default()
    };
    let ctx = context(config, Arc::new(DefaultHooks));
    let (_first, _h1) = establish(&ctx, &connect_packet("first")).await;

    let (mut client, _h2) = spawn(ctx.clone());
    client
        .write_all(&connect_bytes(&connect_packet("second")))
        .await
        .unwrap();

    assert_eq!(read_connack(&mut client).await, [0x20, 0x02, 0x00, 0x03]);
    assert_eq!(ctx.registry.len(), 1);
}

#[tokio::test]
async fn test_takeover_allowed_at_capacity() {
    let config = BrokerConfig {
        max_connections: 1,
        ..Default::default()
    };
    let ctx = context(config, Arc::new(DefaultHooks));
    let (mut first, h1) = establish(&ctx, &connect_packet("same")).await;
    let (_second, _h2) = establish(&ctx, &connect_packet("same")).await;

    assert_eq!(read_rest(&mut first).await, Vec::<u8>::new());
    assert!(h1.await.unwrap().0.is_ok());
    assert_eq!(ctx.registry.len(), 1);
}

// ============================================================================
// Takeover
// ============================================================================

#[tokio::test]
async fn test_takeover_closes_first_connection() {
    let hooks = Arc::new(RecordingHooks::default());
    let ctx = context(BrokerConfig::default(), hooks.clone());

    let (mut first, h1) = establish(&ctx, &with_will("test-user")).await;
    let first_session = ctx.registry.lookup("test-user").unwrap();

    let (mut second, _h2) = spawn(ctx.clone());
    second
        .write_all(&connect_bytes(&connect_packet("test-user")))
        .await
        .unwrap();
    assert_eq!(read_connack(&mut second).await, CONNACK_ACCEPTED);

    assert_eq!(read_rest(&mut first).await, Vec::<u8>::new());
    let (result, closed) = h1.await.unwrap();
    assert!(result.is_ok());
    assert!(closed);

    // The newcomer owns the identifier; the evicted will is discarded
    let current = ctx.registry.lookup("test-user").unwrap();
    assert!(!Arc::ptr_eq(&current, &first_session));
    assert!(current.is_live());
    assert_eq!(first_session.status(), SessionStatus::Closed);
    assert!(hooks.wills.lock().is_empty());
}

#[tokio::test]
async fn test_takeover_session_present() {
    let ctx = default_context();
    let persistent = Connect {
        clean_session: false,
        ..connect_packet("durable")
    };

    let (_first, _h1) = establish(&ctx, &persistent).await;

    let (mut second, _h2) = spawn(ctx.clone());
    second.write_all(&connect_bytes(&persistent)).await.unwrap();
    assert_eq!(read_connack(&mut second).await, [0x20, 0x02, 0x01, 0x00]);
}

#[tokio::test]
async fn test_takeover_with_clean_session_not_present() {
    let ctx = default_context();
    let persistent = Connect {
        clean_session: false,
        ..connect_packet("durable")
    };

    let (_first, _h1) = establish(&ctx, &persistent).await;

    let (mut second, _h2) = spawn(ctx.clone());
    second
        .write_all(&connect_bytes(&connect_packet("durable")))
        .await
        .unwrap();
    assert_eq!(read_connack(&mut second).await, CONNACK_ACCEPTED);
}

#[tokio::test]
async fn test_reject_policy_keeps_first_connection() {
    let config = BrokerConfig {
        takeover: TakeoverPolicy::Reject,
        ..Default::default()
    };
    let ctx = context(config, Arc::new(DefaultHooks));
    let (mut first, _h1) = establish(&ctx, &connect_packet("owner")).await;
    let owner = ctx.registry.lookup("owner").unwrap();

    let (mut second, h2) = spawn(ctx.clone());
    second
        .write_all(&connect_bytes(&connect_packet("owner")))
        .await
        .unwrap();
    assert_eq!(read_connack(&mut second).await, [0x20, 0x02, 0x00, 0x02]);
    assert!(matches!(
        h2.await.unwrap().0,
        Err(ConnectionError::Refused(ReturnCode::IdentifierRejected))
    ));

    // First connection is untouched
    assert!(Arc::ptr_eq(&ctx.registry.lookup("owner").unwrap(), &owner));
    first.write_all(&PINGREQ).await.unwrap();
    let mut pingresp = [0u8; 2];
    first.read_exact(&mut pingresp).await.unwrap();
    assert_eq!(pingresp, [0xD0, 0x00]);
}

// ============================================================================
// Established
// ============================================================================

#[tokio::test]
async fn test_pingreq_answered_by_default_hooks() {
    let ctx = default_context();
    let (mut client, _handle) = establish(&ctx, &connect_packet("pinger")).await;

    for _ in 0..3 {
        client.write_all(&PINGREQ).await.unwrap();
        let mut pingresp = [0u8; 2];
        client.read_exact(&mut pingresp).await.unwrap();
        assert_eq!(pingresp, [0xD0, 0x00]);
    }
}

#[tokio::test]
async fn test_other_packets_forwarded() {
    let ctx = context(BrokerConfig::default(), Arc::new(EchoHooks));
    let (mut client, _handle) = establish(&ctx, &connect_packet("echo")).await;

    // SUBSCRIBE: packet id 1, topic "a", QoS 0
    client
        .write_all(&[0x82, 0x06, 0x00, 0x01, 0x00, 0x01, b'a', 0x00])
        .await
        .unwrap();
    let mut body = [0u8; 6];
    client.read_exact(&mut body).await.unwrap();
    assert_eq!(body, [0x00, 0x01, 0x00, 0x01, b'a', 0x00]);
}

#[tokio::test]
async fn test_second_connect_is_protocol_violation() {
    let hooks = Arc::new(RecordingHooks::default());
    let ctx = context(BrokerConfig::default(), hooks.clone());
    let (mut client, handle) = establish(&ctx, &with_will("twice")).await;

    client
        .write_all(&connect_bytes(&connect_packet("twice")))
        .await
        .unwrap();

    assert_eq!(read_rest(&mut client).await, Vec::<u8>::new());
    let (result, closed) = handle.await.unwrap();
    assert!(matches!(result, Err(ConnectionError::Protocol(_))));
    assert!(closed);
    assert!(ctx.registry.is_empty());
    assert_eq!(hooks.wills.lock().len(), 1);
}

#[tokio::test]
async fn test_malformed_packet_tears_down() {
    let ctx = default_context();
    let (mut client, handle) = establish(&ctx, &connect_packet("garbled")).await;

    // DISCONNECT with a payload
    client.write_all(&[0xE0, 0x01, 0x00]).await.unwrap();

    assert_eq!(read_rest(&mut client).await, Vec::<u8>::new());
    assert!(matches!(
        handle.await.unwrap().0,
        Err(ConnectionError::Decode(_))
    ));
    assert!(ctx.registry.is_empty());
}

// ============================================================================
// Teardown and will
// ============================================================================

#[tokio::test]
async fn test_disconnect_discards_will() {
    let hooks = Arc::new(RecordingHooks::default());
    let ctx = context(BrokerConfig::default(), hooks.clone());
    let (mut client, handle) = establish(&ctx, &with_will("polite")).await;

    client.write_all(&DISCONNECT).await.unwrap();
    handle.await.unwrap();

    assert!(hooks.wills.lock().is_empty());
    assert_eq!(
        *hooks.disconnected.lock(),
        vec![("polite".to_string(), true)]
    );
    assert_eq!(*hooks.connected.lock(), vec!["polite".to_string()]);
}

#[tokio::test]
async fn test_peer_close_publishes_will() {
    let hooks = Arc::new(RecordingHooks::default());
    let ctx = context(BrokerConfig::default(), hooks.clone());
    let (client, handle) = establish(&ctx, &with_will("abrupt")).await;

    drop(client);
    let (result, closed) = handle.await.unwrap();
    assert!(result.is_ok());
    assert!(closed);

    assert!(ctx.registry.is_empty());
    assert_eq!(
        *hooks.wills.lock(),
        vec![("abrupt".to_string(), "status/offline".to_string())]
    );
    assert_eq!(
        *hooks.disconnected.lock(),
        vec![("abrupt".to_string(), false)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_timeout_tears_down() {
    let hooks = Arc::new(RecordingHooks::default());
    let ctx = context(BrokerConfig::default(), hooks.clone());
    let connect = Connect {
        keep_alive: 2,
        ..with_will("idle")
    };
    let (mut client, handle) = establish(&ctx, &connect).await;

    let started = tokio::time::Instant::now();
    assert_eq!(read_rest(&mut client).await, Vec::<u8>::new());
    assert!(started.elapsed() >= Duration::from_secs(3));

    assert!(handle.await.unwrap().0.is_ok());
    assert!(ctx.registry.is_empty());
    assert_eq!(hooks.wills.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_reset_by_traffic() {
    let ctx = default_context();
    let connect = Connect {
        keep_alive: 2,
        ..connect_packet("chatty")
    };
    let (mut client, _handle) = establish(&ctx, &connect).await;

    // Ping every 2s: each packet pushes the 3s deadline out
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_secs(2)).await;
        client.write_all(&PINGREQ).await.unwrap();
        let mut pingresp = [0u8; 2];
        client.read_exact(&mut pingresp).await.unwrap();
    }
    assert!(ctx.registry.contains("chatty"));
}

#[tokio::test]
async fn test_negotiate_keep_alive() {
    let config = BrokerConfig {
        default_keep_alive: 30,
        max_keep_alive: 120,
        ..Default::default()
    };
    let ctx = context(config, Arc::new(DefaultHooks));

    let (_a, _ha) = establish(
        &ctx,
        &Connect {
            keep_alive: 0,
            ..connect_packet("zero")
        },
    )
    .await;
    let (_b, _hb) = establish(
        &ctx,
        &Connect {
            keep_alive: 600,
            ..connect_packet("long")
        },
    )
    .await;
    let (_c, _hc) = establish(
        &ctx,
        &Connect {
            keep_alive: 45,
            ..connect_packet("normal")
        },
    )
    .await;

    assert_eq!(ctx.registry.lookup("zero").unwrap().keep_alive, 30);
    assert_eq!(ctx.registry.lookup("long").unwrap().keep_alive, 120);
    assert_eq!(ctx.registry.lookup("normal").unwrap().keep_alive, 45);
}

#[tokio::test]
async fn test_negotiate_keep_alive_uncapped() {
    let config = BrokerConfig {
        max_keep_alive: 0,
        ..Default::default()
    };
    let ctx = context(config, Arc::new(DefaultHooks));

    let (_client, _handle) = establish(
        &ctx,
        &Connect {
            keep_alive: 10,
            ..connect_packet("uncapped")
        },
    )
    .await;

    assert_eq!(ctx.registry.lookup("uncapped").unwrap().keep_alive, 10);
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_enforced_without_cap() {
    let config = BrokerConfig {
        max_keep_alive: 0,
        ..Default::default()
    };
    let ctx = context(config, Arc::new(DefaultHooks));
    let connect = Connect {
        keep_alive: 10,
        ..connect_packet("idle-uncapped")
    };
    let (mut client, handle) = establish(&ctx, &connect).await;

    let started = tokio::time::Instant::now();
    assert_eq!(read_rest(&mut client).await, Vec::<u8>::new());
    assert!(started.elapsed() >= Duration::from_secs(15));

    assert!(handle.await.unwrap().0.is_ok());
    assert!(ctx.registry.is_empty());
}

#[tokio::test]
async fn test_shutdown_tears_down_without_will() {
    let hooks = Arc::new(RecordingHooks::default());
    let ctx = context(BrokerConfig::default(), hooks.clone());
    let (shutdown, _) = broadcast::channel(1);

    let (mut client, handle) = spawn_with_shutdown(ctx.clone(), Some(shutdown.subscribe()));
    client
        .write_all(&connect_bytes(&with_will("stopping")))
        .await
        .unwrap();
    assert_eq!(read_connack(&mut client).await, CONNACK_ACCEPTED);

    shutdown.send(()).unwrap();
    assert_eq!(read_rest(&mut client).await, Vec::<u8>::new());
    assert!(handle.await.unwrap().0.is_ok());
    assert!(ctx.registry.is_empty());
    assert!(hooks.wills.lock().is_empty());
}
