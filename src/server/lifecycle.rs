//! Per-connection queue lifecycle
//!
//! `UNBOUND -> ACTIVE -> CLOSING -> CLOSED`. Teardown runs at most once no
//! matter how many paths ask for it; later callers wait for the first one to
//! finish.

use crate::broker::{BrokerError, BrokerSession, DeliveryHandler};
use crate::channels::{BindingAction, Membership, MessageKind, SessionId};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unbound,
    Active,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Unbound => "UNBOUND",
            SessionState::Active => "ACTIVE",
            SessionState::Closing => "CLOSING",
            SessionState::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("session {session} is {state}, expected {expected}")]
    InvalidState {
        session: SessionId,
        state: SessionState,
        expected: SessionState,
    },

    #[error("session {0} already has a consume loop")]
    ConsumerRunning(SessionId),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

struct Consumer {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// One client connection's queue, bindings and consume loop
pub struct ClientSession {
    id: SessionId,
    broker: Arc<BrokerSession>,
    state: Mutex<SessionState>,
    bindings: Mutex<Vec<Membership>>,
    consumer: Mutex<Option<Consumer>>,
    /// Held across binding changes and the queue delete in teardown
    ops: AsyncMutex<()>,
    /// Cancelled when teardown starts
    ended: CancellationToken,
    teardown: OnceCell<()>,
}

impl ClientSession {
    /// New session with a freshly generated id
    pub fn new(broker: Arc<BrokerSession>) -> Arc<Self> {
        Self::with_id(SessionId::generate(), broker)
    }

    pub fn with_id(id: SessionId, broker: Arc<BrokerSession>) -> Arc<Self> {
        Arc::new(Self {
            id,
            broker,
            state: Mutex::new(SessionState::Unbound),
            bindings: Mutex::new(Vec::new()),
            consumer: Mutex::new(None),
            ops: AsyncMutex::new(()),
            ended: CancellationToken::new(),
            teardown: OnceCell::new(),
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Channels the queue is currently bound to, in bind order
    pub fn memberships(&self) -> Vec<Membership> {
        self.bindings.lock().clone()
    }

    pub fn is_member(&self, membership: &Membership) -> bool {
        self.bindings.lock().contains(membership)
    }

    /// Resolves once teardown has started, from any path
    pub async fn closed(&self) {
        self.ended.cancelled().await
    }

    fn expect_state(&self, expected: SessionState) -> Result<(), LifecycleError> {
        let state = self.state();
        if state != expected {
            return Err(LifecycleError::InvalidState {
                session: self.id.clone(),
                state,
                expected,
            });
        }
        Ok(())
    }

    /// Declare the queue and bind the initial channels
    pub async fn activate(&self, initial: &[Membership]) -> Result<(), LifecycleError> {
        let _ops = self.ops.lock().await;
        self.expect_state(SessionState::Unbound)?;

        self.broker.declare_queue(&self.id).await?;
        for membership in initial {
            self.bind(membership).await?;
        }

        let mut state = self.state.lock();
        if *state != SessionState::Unbound {
            // closed while activating; teardown deletes the queue once we
            // release `ops`
            return Err(LifecycleError::InvalidState {
                session: self.id.clone(),
                state: *state,
                expected: SessionState::Unbound,
            });
        }
        *state = SessionState::Active;
        drop(state);

        info!(session_id = %self.id, channels = initial.len(), "Session active");
        Ok(())
    }

    async fn update(
        &self,
        membership: &Membership,
        kind: MessageKind,
        action: BindingAction,
    ) -> Result<(), BrokerError> {
        self.broker
            .update_binding(&membership.tenant, &membership.channel, &self.id, kind, action)
            .await
    }

    /// Apply `action` for every kind, or for none: kinds already applied are
    /// undone if a later one fails.
    async fn update_all(
        &self,
        membership: &Membership,
        action: BindingAction,
    ) -> Result<(), BrokerError> {
        let undo = match action {
            BindingAction::Add => BindingAction::Remove,
            BindingAction::Remove => BindingAction::Add,
        };

        for (done, kind) in MessageKind::ALL.into_iter().enumerate() {
            if let Err(e) = self.update(membership, kind, action).await {
                for applied in &MessageKind::ALL[..done] {
                    if let Err(undo_err) = self.update(membership, *applied, undo).await {
                        warn!(
                            session_id = %self.id,
                            membership = %membership,
                            kind = %applied,
                            error = %undo_err,
                            "Could not undo binding change"
                        );
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    async fn bind(&self, membership: &Membership) -> Result<bool, LifecycleError> {
        if self.is_member(membership) {
            return Ok(false);
        }
        self.update_all(membership, BindingAction::Add).await?;
        self.bindings.lock().push(membership.clone());
        Ok(true)
    }

    /// Start listening to another channel. Returns false if already bound.
    pub async fn join(&self, membership: &Membership) -> Result<bool, LifecycleError> {
        let _ops = self.ops.lock().await;
        self.expect_state(SessionState::Active)?;
        let added = self.bind(membership).await?;
        if added {
            debug!(session_id = %self.id, membership = %membership, "Joined channel");
        }
        Ok(added)
    }

    /// Stop listening to a channel. Returns false if it was not bound.
    pub async fn leave(&self, membership: &Membership) -> Result<bool, LifecycleError> {
        let _ops = self.ops.lock().await;
        self.expect_state(SessionState::Active)?;
        if !self.is_member(membership) {
            return Ok(false);
        }
        self.update_all(membership, BindingAction::Remove).await?;
        self.bindings.lock().retain(|m| m != membership);
        debug!(session_id = %self.id, membership = %membership, "Left channel");
        Ok(true)
    }

    /// Spawn the consume loop relaying to `handler`. At most one per session.
    ///
    /// If the loop ends without being cancelled (the broker dropped the
    /// queue or the consumer, or the handler went away) the session is torn
    /// down.
    pub fn start_consumer(
        self: &Arc<Self>,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), LifecycleError> {
        let mut consumer = self.consumer.lock();
        self.expect_state(SessionState::Active)?;
        if consumer.as_ref().is_some_and(|c| !c.task.is_finished()) {
            return Err(LifecycleError::ConsumerRunning(self.id.clone()));
        }

        let cancel = CancellationToken::new();
        let broker = self.broker.clone();
        let id = self.id.clone();
        let token = cancel.clone();
        let session = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            if let Err(e) = broker.consume(&id, handler, token.clone()).await {
                warn!(session_id = %id, error = %e, "Consume loop failed");
            }
            if token.is_cancelled() {
                return;
            }
            if let Some(session) = session.upgrade() {
                info!(session_id = %id, "Consume loop ended on its own, closing session");
                // close() waits for this task, so it runs on its own
                tokio::spawn(async move { session.close().await });
            }
        });

        *consumer = Some(Consumer { cancel, task });
        Ok(())
    }

    pub fn has_live_consumer(&self) -> bool {
        self.consumer
            .lock()
            .as_ref()
            .is_some_and(|c| !c.task.is_finished())
    }

    /// Stop the consume loop, then purge and delete the queue
    ///
    /// Only the first call does the work. Cleanup failures are logged: the
    /// queue being gone already is the goal.
    pub async fn close(&self) {
        self.teardown
            .get_or_init(|| async {
                let previous = {
                    let mut state = self.state.lock();
                    std::mem::replace(&mut *state, SessionState::Closing)
                };
                self.ended.cancel();
                debug!(session_id = %self.id, from = %previous, "Closing session");

                let consumer = self.consumer.lock().take();
                if let Some(consumer) = consumer {
                    consumer.cancel.cancel();
                    if let Err(e) = consumer.task.await {
                        warn!(session_id = %self.id, error = %e, "Consume task ended abnormally");
                    }
                }

                // a join or activate already past its state check finishes first
                let _ops = self.ops.lock().await;
                if let Err(e) = self.broker.delete_queue(&self.id).await {
                    warn!(session_id = %self.id, error = %e, "Queue cleanup failed, treating as gone");
                }

                self.bindings.lock().clear();
                *self.state.lock() = SessionState::Closed;
                info!(session_id = %self.id, "Session closed");
            })
            .await;
    }
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
