//! WebSocket connection gateway
//!
//! One task per connection runs the read loop; a writer task owns the socket
//! sink; the session's consume loop feeds the writer through a `WsRelay`.

use crate::auth::{AuthError, Identity, MembershipResolver};
use crate::broker::{BrokerSession, DeliveryHandler, RelayError};
use crate::channels::{Membership, SessionId};
use crate::server::connections::SessionRegistry;
use crate::server::frames::{validate_frame, FrameRejection, InboundFrame};
use crate::server::lifecycle::ClientSession;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{HeaderMap, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outbound frames buffered per connection before the consume loop waits
const OUTBOUND_BUFFER: usize = 256;

/// Shared state for WebSocket handlers
#[derive(Clone)]
pub struct GatewayState {
    pub sessions: SessionRegistry,
    pub broker: Arc<BrokerSession>,
    pub resolver: Arc<dyn MembershipResolver>,
    pub max_frame_bytes: usize,
    pub identity_header: HeaderName,
}

/// Create the gateway router
pub fn create_router(state: GatewayState) -> Router {
    Router::new()
        .route("/chat/", get(chat_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn chat_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<GatewayState>,
) -> Response {
    let identity = match headers
        .get(&state.identity_header)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        Some(value) => Identity::new(value),
        None => return (StatusCode::UNAUTHORIZED, "missing identity").into_response(),
    };

    let memberships = match state.resolver.initial_memberships(&identity).await {
        Ok(memberships) => memberships,
        Err(e @ AuthError::Forbidden(_)) => {
            info!(identity = %identity, error = %e, "Connection refused");
            return (StatusCode::FORBIDDEN, e.to_string()).into_response();
        }
        Err(e @ AuthError::Lookup(_)) => {
            warn!(identity = %identity, error = %e, "Membership lookup failed");
            return (StatusCode::SERVICE_UNAVAILABLE, "membership lookup failed").into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, identity, memberships))
}

/// Relays queue deliveries to one connection's writer
struct WsRelay {
    session: SessionId,
    tx: mpsc::Sender<Message>,
}

#[async_trait]
impl DeliveryHandler for WsRelay {
    async fn deliver(&self, payload: &[u8]) -> Result<(), RelayError> {
        let message = match std::str::from_utf8(payload) {
            Ok(text) => Message::Text(text.into()),
            Err(_) => Message::Binary(payload.to_vec().into()),
        };
        self.tx.send(message).await.map_err(|_| RelayError {
            session: self.session.clone(),
            reason: "connection writer closed".into(),
        })
    }
}

/// Runs session teardown if the connection task is dropped before it
/// reaches its own cleanup
struct TeardownGuard {
    session: Arc<ClientSession>,
    sessions: SessionRegistry,
    armed: bool,
}

impl TeardownGuard {
    async fn run(mut self) {
        self.armed = false;
        self.session.close().await;
        self.sessions.remove(self.session.id());
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let session = self.session.clone();
        let sessions = self.sessions.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                session.close().await;
                sessions.remove(session.id());
            });
        }
    }
}

async fn handle_socket(
    socket: WebSocket,
    state: GatewayState,
    identity: Identity,
    memberships: Vec<Membership>,
) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);

    let session = ClientSession::new(state.broker.clone());
    let session_id = session.id().clone();
    state.sessions.add(session.clone());
    let guard = TeardownGuard {
        session: session.clone(),
        sessions: state.sessions.clone(),
        armed: true,
    };

    info!(session_id = %session_id, identity = %identity, "WebSocket client connected");

    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sender.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    let started = match session.activate(&memberships).await {
        Ok(()) => session
            .start_consumer(Arc::new(WsRelay {
                session: session_id.clone(),
                tx: tx.clone(),
            }))
            .map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };

    match started {
        Ok(()) => read_loop(&mut receiver, &state, &session, &tx).await,
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "Session setup failed");
            let _ = tx
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::ERROR,
                    reason: Utf8Bytes::from_static("session setup failed"),
                })))
                .await;
        }
    }

    guard.run().await;
    drop(tx);
    if let Err(e) = send_task.await {
        debug!(session_id = %session_id, error = %e, "Writer task ended abnormally");
    }
    info!(session_id = %session_id, "WebSocket client disconnected");
}

async fn read_loop(
    receiver: &mut futures::stream::SplitStream<WebSocket>,
    state: &GatewayState,
    session: &ClientSession,
    tx: &mpsc::Sender<Message>,
) {
    loop {
        let message = tokio::select! {
            () = session.closed() => {
                // torn down elsewhere: broker dropped the queue, or shutdown
                info!(session_id = %session.id(), "Session ended, closing connection");
                let _ = tx
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::ERROR,
                        reason: Utf8Bytes::from_static("session ended"),
                    })))
                    .await;
                break;
            }
            message = receiver.next() => message,
        };
        let Some(message) = message else {
            break;
        };

        let checked = match message {
            Ok(Message::Text(text)) => validate_frame(text.as_str().as_bytes(), state.max_frame_bytes),
            Ok(Message::Binary(data)) => validate_frame(&data, state.max_frame_bytes),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => break,
            Err(e) => {
                debug!(session_id = %session.id(), error = %e, "WebSocket error");
                break;
            }
        };

        match checked {
            Ok(frame) => forward(state, session, frame).await,
            Err(rejection) => {
                reject(session.id(), &rejection, tx).await;
                break;
            }
        }
    }
}

async fn reject(session: &SessionId, rejection: &FrameRejection, tx: &mpsc::Sender<Message>) {
    info!(
        session_id = %session,
        code = rejection.close_code(),
        detail = ?rejection,
        "Closing connection on invalid frame"
    );
    let _ = tx.send(Message::Close(Some(rejection.close_frame()))).await;
}

async fn forward(state: &GatewayState, session: &ClientSession, frame: InboundFrame) {
    let memberships = session.memberships();
    let Some(target) = frame.target(&memberships) else {
        warn!(
            session_id = %session.id(),
            channel_id = ?frame.channel_id,
            "Dropping frame for a channel the session is not bound to"
        );
        return;
    };

    if let Err(e) = state
        .broker
        .publish(&target.tenant, &target.channel, frame.kind, &frame.payload)
        .await
    {
        warn!(session_id = %session.id(), error = %e, "Publish failed");
    }
}
