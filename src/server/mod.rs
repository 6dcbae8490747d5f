//! Chatbus server implementation
//!
//! Accepts WebSocket connections, gives each one its own broker queue, and
//! relays frames between the client and the tenant topic exchanges.

mod connections;
pub mod frames;
pub mod lifecycle;
pub mod router;
pub mod websocket;

pub use connections::SessionRegistry;
pub use frames::{validate_frame, FrameRejection, InboundFrame};
pub use lifecycle::{ClientSession, LifecycleError, SessionState};
pub use router::{NameTemplate, TopicRouter};
pub use websocket::{create_router, GatewayState};

use crate::auth::MembershipResolver;
use crate::broker::BrokerSession;
use crate::config::{ConfigError, GatewayConfig};
use axum::Router;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// The main Chatbus server
#[derive(Clone)]
pub struct ChatbusServer {
    config: GatewayConfig,
    state: GatewayState,
}

impl ChatbusServer {
    pub fn new(
        config: GatewayConfig,
        broker: Arc<BrokerSession>,
        resolver: Arc<dyn MembershipResolver>,
    ) -> Result<Self, ConfigError> {
        let state = GatewayState {
            sessions: SessionRegistry::new(),
            broker,
            resolver,
            max_frame_bytes: config.max_frame_bytes,
            identity_header: config.identity_header_name()?,
        };
        Ok(Self { config, state })
    }

    /// Live sessions, keyed by session id
    pub fn sessions(&self) -> &SessionRegistry {
        &self.state.sessions
    }

    pub fn broker(&self) -> Arc<BrokerSession> {
        self.state.broker.clone()
    }

    /// Get session count
    pub fn session_count(&self) -> usize {
        self.state.sessions.count()
    }

    /// HTTP routes for the gateway
    pub fn app(&self) -> Router {
        create_router(self.state.clone())
    }

    /// Bind the configured address and serve until `shutdown` resolves
    pub async fn run<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!(addr = %listener.local_addr()?, "Chatbus gateway listening");
        axum::serve(listener, self.app())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }

    /// Tear down every live session, then close the broker connection
    pub async fn shutdown(&self) {
        self.state.sessions.close_all().await;
        if let Err(e) = self.state.broker.close().await {
            warn!(error = %e, "Broker close failed");
        }
        info!("Chatbus server stopped");
    }
}
