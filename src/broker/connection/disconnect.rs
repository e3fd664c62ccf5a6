//! Session teardown and will publication

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use super::Connection;
use crate::session::Session;

/// Why an established session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// Client sent DISCONNECT
    Disconnect,
    /// End of stream without DISCONNECT
    PeerClosed,
    /// Nothing received within 1.5x the keep alive
    KeepAliveTimeout,
    /// A newer connection took the client identifier
    TakenOver,
    /// Broker shutdown
    Shutdown,
    /// Transport, decode, protocol or collaborator failure
    Failed,
}

impl Teardown {
    /// Whether the will message is published [MQTT-3.1.2-8]
    pub fn publishes_will(self) -> bool {
        matches!(
            self,
            Teardown::PeerClosed | Teardown::KeepAliveTimeout | Teardown::Failed
        )
    }

    pub fn is_graceful(self) -> bool {
        self == Teardown::Disconnect
    }

    /// Metric label
    pub fn as_str(self) -> &'static str {
        match self {
            Teardown::Disconnect => "disconnect",
            Teardown::PeerClosed => "peer_closed",
            Teardown::KeepAliveTimeout => "keep_alive_timeout",
            Teardown::TakenOver => "taken_over",
            Teardown::Shutdown => "shutdown",
            Teardown::Failed => "failed",
        }
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Release everything an established session holds and close the transport
    ///
    /// No packet is ever written back.
    pub(crate) async fn teardown(&mut self, session: &Arc<Session>, reason: Teardown) {
        let client_id = &session.client_id;

        // A taken-over session is no longer in the registry; this is a no-op then
        if !self.ctx.registry.unregister(session) {
            debug!("Session {} already replaced in registry", client_id);
        }

        // [MQTT-3.1.2-10] the will is discarded on DISCONNECT
        match session.take_will() {
            Some(will) if reason.publishes_will() => {
                debug!("Publishing will for {} to {}", client_id, will.topic);
                self.ctx.hooks.on_will(client_id, &will).await;
            }
            Some(_) => debug!("Discarding will for {} ({})", client_id, reason.as_str()),
            None => {}
        }

        self.close().await;
        session.mark_closed();

        info!("Client {} disconnected ({})", client_id, reason.as_str());

        self.ctx
            .hooks
            .on_client_disconnected(client_id, reason.is_graceful())
            .await;

        if let Some(ref metrics) = self.ctx.metrics {
            metrics.session_closed(reason.as_str());
        }
    }
}
