//! Process-wide broker session
//!
//! Owns the transport and the tenant exchange cache. The cache is the only
//! state shared between client sessions.

use crate::broker::amqp::{AmqpConfig, AmqpTransport};
use crate::broker::{BrokerError, ExchangeHandle, QueueHandle, Transport};
use crate::channels::{BindingAction, ChannelId, MessageKind, SessionId, TenantId};
use crate::server::router::TopicRouter;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// The receiving side of a consume loop went away
#[derive(Debug, Clone, Error)]
#[error("relay to session {session} failed: {reason}")]
pub struct RelayError {
    pub session: SessionId,
    pub reason: String,
}

/// Receives payloads delivered to one session's queue
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn deliver(&self, payload: &[u8]) -> Result<(), RelayError>;
}

pub struct BrokerSession {
    transport: Arc<dyn Transport>,
    router: TopicRouter,
    exchanges: RwLock<HashMap<String, ExchangeHandle>>,
}

impl BrokerSession {
    pub fn new(transport: Arc<dyn Transport>, router: TopicRouter) -> Self {
        Self {
            transport,
            router,
            exchanges: RwLock::new(HashMap::new()),
        }
    }

    /// Connect to an AMQP broker. An unreachable broker is returned as
    /// `BrokerError::Unreachable` once the retry policy is exhausted.
    pub async fn connect(config: AmqpConfig, router: TopicRouter) -> Result<Self, BrokerError> {
        let transport = AmqpTransport::connect(config).await?;
        Ok(Self::new(Arc::new(transport), router))
    }

    pub fn router(&self) -> &TopicRouter {
        &self.router
    }

    /// Cached exchange for the tenant, declaring it on first use
    pub async fn declare_topic(&self, tenant: &TenantId) -> Result<ExchangeHandle, BrokerError> {
        let name = self.router.topic_name(tenant);
        let cached = self.exchanges.read().get(&name).cloned();
        if let Some(handle) = cached {
            return Ok(handle);
        }

        debug!(exchange = %name, "Declaring exchange");
        let handle = self.transport.declare_exchange(&name).await?;
        let cached = self
            .exchanges
            .write()
            .entry(name)
            .or_insert(handle)
            .clone();
        Ok(cached)
    }

    fn evict_topic(&self, handle: &ExchangeHandle) {
        let mut exchanges = self.exchanges.write();
        if exchanges.get(handle.name()) == Some(handle) {
            exchanges.remove(handle.name());
        }
    }

    pub fn cached_topics(&self) -> usize {
        self.exchanges.read().len()
    }

    /// Run `op` against the tenant exchange. A stale handle is evicted,
    /// re-declared and the operation retried once.
    async fn with_topic<T, F, Fut>(&self, tenant: &TenantId, op: F) -> Result<T, BrokerError>
    where
        F: Fn(ExchangeHandle) -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        let exchange = self.declare_topic(tenant).await?;
        match op(exchange.clone()).await {
            Err(err) if err.is_stale() => {
                warn!(exchange = %exchange, error = %err, "Exchange was removed by the broker, re-declaring");
                self.evict_topic(&exchange);
                let exchange = self.declare_topic(tenant).await?;
                op(exchange.clone()).await.map_err(|source| BrokerError::Delivery {
                    exchange: exchange.name().to_string(),
                    source: Box::new(source),
                })
            }
            other => other,
        }
    }

    /// Publish a payload on a tenant channel
    pub async fn publish(
        &self,
        tenant: &TenantId,
        channel: &ChannelId,
        kind: MessageKind,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        let routing_key = self.router.routing_key(kind, channel);
        let transport = &self.transport;
        let key = routing_key.as_str();

        self.with_topic(tenant, |exchange| async move {
            debug!(exchange = %exchange, routing_key = key, bytes = payload.len(), "Publishing");
            transport.publish(&exchange, key, payload).await
        })
        .await
    }

    /// Declare the session's exclusive queue. Repeated calls return the
    /// same queue.
    pub async fn declare_queue(&self, session: &SessionId) -> Result<QueueHandle, BrokerError> {
        let name = self.router.queue_name(session);
        self.transport.declare_queue(&name).await
    }

    /// Add or remove the binding of a session's queue to a channel
    pub async fn update_binding(
        &self,
        tenant: &TenantId,
        channel: &ChannelId,
        session: &SessionId,
        kind: MessageKind,
        action: BindingAction,
    ) -> Result<(), BrokerError> {
        let queue = self.declare_queue(session).await?;
        let routing_key = self.router.routing_key(kind, channel);
        let transport = &self.transport;
        let queue = &queue;
        let key = routing_key.as_str();

        debug!(
            session_id = %session,
            tenant_id = %tenant,
            channel_id = %channel,
            routing_key = key,
            action = %action,
            "Updating binding"
        );

        self.with_topic(tenant, |exchange| async move {
            match action {
                BindingAction::Add => transport.bind(queue, &exchange, key).await,
                BindingAction::Remove => transport.unbind(queue, &exchange, key).await,
            }
        })
        .await
    }

    /// Purge then delete the session's queue. Safe on a queue that was never
    /// bound or was already deleted.
    pub async fn delete_queue(&self, session: &SessionId) -> Result<(), BrokerError> {
        let queue = self.declare_queue(session).await?;
        let dropped = self.transport.purge(&queue).await?;
        debug!(session_id = %session, queue = %queue, dropped, "Purged queue");
        self.transport.delete_queue(&queue).await?;
        debug!(session_id = %session, queue = %queue, "Deleted queue");
        Ok(())
    }

    /// Relay deliveries from the session's queue to `handler` until
    /// cancelled. A delivery already taken off the queue is handed to the
    /// handler and acknowledged before cancellation is observed.
    ///
    /// The queue must already exist; a missing queue is `NotFound` rather
    /// than a fresh queue with no bindings. Returns `Ok` when cancelled, when
    /// the handler goes away, or when the broker ends the consumer.
    pub async fn consume(
        &self,
        session: &SessionId,
        handler: Arc<dyn DeliveryHandler>,
        cancel: CancellationToken,
    ) -> Result<(), BrokerError> {
        let queue = QueueHandle::new(&self.router.queue_name(session));
        let mut deliveries = self.transport.consume(&queue).await?;
        debug!(session_id = %session, queue = %queue, "Consume loop started");

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                next = deliveries.next() => next,
            };

            let Some(delivery) = next else {
                warn!(session_id = %session, queue = %queue, "Broker ended the queue consumer");
                break;
            };
            let delivery = delivery?;

            let relayed = handler.deliver(delivery.payload()).await;
            delivery.ack().await?;
            if let Err(e) = relayed {
                debug!(session_id = %session, error = %e, "Stopping consume loop");
                break;
            }
        }

        debug!(session_id = %session, "Consume loop stopped");
        Ok(())
    }

    /// Close the broker connection. Safe to call repeatedly.
    pub async fn close(&self) -> Result<(), BrokerError> {
        self.exchanges.write().clear();
        self.transport.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct ChannelHandler(mpsc::UnboundedSender<Vec<u8>>);

    #[async_trait]
    impl DeliveryHandler for ChannelHandler {
        async fn deliver(&self, payload: &[u8]) -> Result<(), RelayError> {
            self.0.send(payload.to_vec()).map_err(|_| RelayError {
                session: SessionId::parse("test").unwrap(),
                reason: "receiver dropped".into(),
            })
        }
    }

    fn setup() -> (Arc<MemoryBroker>, BrokerSession) {
        let broker = Arc::new(MemoryBroker::new());
        let session = BrokerSession::new(broker.clone(), TopicRouter::default());
        (broker, session)
    }

    fn ids() -> (TenantId, ChannelId, SessionId) {
        (
            TenantId::parse("acme").unwrap(),
            ChannelId::parse("general").unwrap(),
            SessionId::parse("s1").unwrap(),
        )
    }

    #[tokio::test]
    async fn test_declare_topic_is_cached() {
        let (broker, session) = setup();
        let (tenant, _, _) = ids();

        let a = session.declare_topic(&tenant).await.unwrap();
        let b = session.declare_topic(&tenant).await.unwrap();

        assert_eq!(a, b);
        assert_eq!(a.name(), "chat.acme");
        assert_eq!(broker.stats().exchanges_declared, 1);
        assert_eq!(session.cached_topics(), 1);
    }

    #[tokio::test]
    async fn test_declare_queue_is_idempotent() {
        let (broker, session) = setup();
        let (_, _, sid) = ids();

        let a = session.declare_queue(&sid).await.unwrap();
        let b = session.declare_queue(&sid).await.unwrap();

        assert_eq!(a, b);
        assert!(broker.has_queue("chat.session.s1"));
    }

    #[tokio::test]
    async fn test_publish_recovers_from_stale_topic() {
        let (broker, session) = setup();
        let (tenant, channel, _) = ids();

        session.declare_topic(&tenant).await.unwrap();
        assert!(broker.evict_exchange("chat.acme"));

        session
            .publish(&tenant, &channel, MessageKind::Message, b"{}")
            .await
            .unwrap();

        assert!(broker.has_exchange("chat.acme"));
        assert_eq!(broker.stats().exchanges_declared, 2);
        assert_eq!(broker.stats().publishes, 1);
    }

    #[tokio::test]
    async fn test_publish_second_failure_is_delivery_error() {
        let (broker, session) = setup();
        let (tenant, channel, _) = ids();

        broker.fail_next_publishes(2);
        let err = session
            .publish(&tenant, &channel, MessageKind::Message, b"{}")
            .await
            .unwrap_err();

        assert!(matches!(err, BrokerError::Delivery { .. }));
        assert_eq!(broker.stats().publishes, 0);
    }

    #[tokio::test]
    async fn test_non_stale_failure_is_not_retried() {
        let (broker, session) = setup();
        let (tenant, channel, _) = ids();

        broker.close().await.unwrap();
        let err = session
            .publish(&tenant, &channel, MessageKind::Message, b"{}")
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Closed));
    }

    #[tokio::test]
    async fn test_binding_round_trip() {
        let (broker, session) = setup();
        let (tenant, channel, sid) = ids();

        session
            .update_binding(&tenant, &channel, &sid, MessageKind::Message, BindingAction::Add)
            .await
            .unwrap();
        assert_eq!(broker.binding_count("chat.acme", "chat.session.s1"), 1);

        session
            .update_binding(&tenant, &channel, &sid, MessageKind::Message, BindingAction::Remove)
            .await
            .unwrap();
        assert_eq!(broker.binding_count("chat.acme", "chat.session.s1"), 0);

        session
            .publish(&tenant, &channel, MessageKind::Message, b"{}")
            .await
            .unwrap();
        assert_eq!(broker.queue_len("chat.session.s1"), Some(0));
    }

    #[tokio::test]
    async fn test_bind_after_auto_delete_redeclares() {
        let (broker, session) = setup();
        let (tenant, channel, sid) = ids();

        session
            .update_binding(&tenant, &channel, &sid, MessageKind::Typing, BindingAction::Add)
            .await
            .unwrap();
        session
            .update_binding(&tenant, &channel, &sid, MessageKind::Typing, BindingAction::Remove)
            .await
            .unwrap();
        // last binding gone, the broker dropped the exchange but the cache still has it
        assert!(!broker.has_exchange("chat.acme"));
        assert_eq!(session.cached_topics(), 1);

        session
            .update_binding(&tenant, &channel, &sid, MessageKind::Typing, BindingAction::Add)
            .await
            .unwrap();
        assert_eq!(broker.binding_count("chat.acme", "chat.session.s1"), 1);
    }

    #[tokio::test]
    async fn test_delete_queue_is_idempotent() {
        let (broker, session) = setup();
        let (_, _, sid) = ids();

        session.delete_queue(&sid).await.unwrap();
        session.delete_queue(&sid).await.unwrap();

        assert!(!broker.has_queue("chat.session.s1"));
        assert_eq!(broker.stats().purges, 2);
        assert_eq!(broker.stats().queue_deletes, 2);
    }

    #[tokio::test]
    async fn test_consume_relays_until_cancelled() {
        let (_broker, session) = setup();
        let session = Arc::new(session);
        let (tenant, channel, sid) = ids();

        session
            .update_binding(&tenant, &channel, &sid, MessageKind::Message, BindingAction::Add)
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = {
            let session = session.clone();
            let cancel = cancel.clone();
            let sid = sid.clone();
            tokio::spawn(async move {
                session
                    .consume(&sid, Arc::new(ChannelHandler(tx)), cancel)
                    .await
            })
        };

        session
            .publish(&tenant, &channel, MessageKind::Message, br#"{"text":"hi"}"#)
            .await
            .unwrap();
        let got = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(got, br#"{"text":"hi"}"#);

        cancel.cancel();
        let result = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_consume_missing_queue_is_not_found() {
        let (broker, session) = setup();
        let (_, _, sid) = ids();

        let (tx, _rx) = mpsc::unbounded_channel();
        let err = session
            .consume(&sid, Arc::new(ChannelHandler(tx)), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotFound(_)));
        assert!(!broker.has_queue("chat.session.s1"));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (_broker, session) = setup();
        session.close().await.unwrap();
        session.close().await.unwrap();
    }
}
