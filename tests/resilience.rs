//! Resilience tests for Chatbus
//!
//! Broker-side failures, handlers that go away, and connection churn.

use async_trait::async_trait;
use chatbus::broker::{
    BrokerError, BrokerSession, DeliveryHandler, MemoryBroker, RelayError, Transport,
};
use chatbus::channels::{ChannelId, Membership, MessageKind, SessionId, TenantId};
use chatbus::server::{ClientSession, SessionRegistry, SessionState, TopicRouter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const TIMEOUT: Duration = Duration::from_secs(2);

fn setup() -> (Arc<MemoryBroker>, Arc<BrokerSession>) {
    let broker = Arc::new(MemoryBroker::new());
    let session = Arc::new(BrokerSession::new(broker.clone(), TopicRouter::default()));
    (broker, session)
}

fn tenant() -> TenantId {
    TenantId::parse("acme").unwrap()
}

fn general() -> ChannelId {
    ChannelId::parse("general").unwrap()
}

fn membership() -> Membership {
    Membership::new(tenant(), general())
}

/// Accepts `limit` deliveries, then reports the connection gone
struct FlakyHandler {
    session: SessionId,
    seen: AtomicUsize,
    limit: usize,
}

#[async_trait]
impl DeliveryHandler for FlakyHandler {
    async fn deliver(&self, _payload: &[u8]) -> Result<(), RelayError> {
        let seen = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
        if seen > self.limit {
            return Err(RelayError {
                session: self.session.clone(),
                reason: "socket closed".into(),
            });
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_stale_publish_retries_once() {
    let (broker, bs) = setup();
    bs.declare_topic(&tenant()).await.unwrap();

    broker.fail_next_publishes(1);
    bs.publish(&tenant(), &general(), MessageKind::Message, b"{}")
        .await
        .unwrap();

    let stats = broker.stats();
    assert_eq!(stats.publishes, 1);
    assert_eq!(stats.exchanges_declared, 2);
}

#[tokio::test]
async fn test_second_stale_failure_is_delivery_error() {
    let (broker, bs) = setup();

    broker.fail_next_publishes(2);
    let err = bs
        .publish(&tenant(), &general(), MessageKind::Message, b"{}")
        .await
        .unwrap_err();

    match err {
        BrokerError::Delivery { exchange, source } => {
            assert_eq!(exchange, "chat.acme");
            assert!(source.is_stale());
        }
        other => panic!("expected delivery error, got {other:?}"),
    }

    // not retried further; the next publish is fine
    bs.publish(&tenant(), &general(), MessageKind::Message, b"{}")
        .await
        .unwrap();
    assert_eq!(broker.stats().publishes, 1);
}

#[tokio::test]
async fn test_handler_failure_ends_consume_loop() {
    let (broker, bs) = setup();
    let session = ClientSession::new(bs.clone());
    session.activate(&[membership()]).await.unwrap();
    session
        .start_consumer(Arc::new(FlakyHandler {
            session: session.id().clone(),
            seen: AtomicUsize::new(0),
            limit: 1,
        }))
        .unwrap();

    for n in 0..3 {
        bs.publish(&tenant(), &general(), MessageKind::Message, format!("{{\"n\":{n}}}").as_bytes())
            .await
            .unwrap();
    }

    timeout(TIMEOUT, async {
        while session.has_live_consumer() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("consume loop kept running");

    // teardown still runs once and discards what was left
    session.close().await;
    assert_eq!(broker.stats().purges, 1);
    assert_eq!(broker.stats().queue_deletes, 1);
}

#[tokio::test]
async fn test_cleanup_after_broker_closed() {
    let (broker, bs) = setup();
    let session = ClientSession::new(bs);
    session.activate(&[membership()]).await.unwrap();

    broker.close().await.unwrap();
    session.close().await;
    session.close().await;

    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(broker.stats().queue_deletes, 0);
}

#[tokio::test]
async fn test_activate_fails_when_broker_closed() {
    let (broker, bs) = setup();
    broker.close().await.unwrap();

    let session = ClientSession::new(bs);
    assert!(session.activate(&[membership()]).await.is_err());
    assert_eq!(session.state(), SessionState::Unbound);
    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_rapid_connect_disconnect_cycles() {
    let (broker, bs) = setup();
    let registry = SessionRegistry::new();

    for _ in 0..20 {
        let mut sessions = vec![];
        for _ in 0..5 {
            let session = ClientSession::new(bs.clone());
            session.activate(&[membership()]).await.unwrap();
            registry.add(session.clone());
            sessions.push(session);
        }
        for session in sessions {
            session.close().await;
            registry.remove(session.id());
        }
    }

    assert_eq!(registry.count(), 0);
    assert_eq!(broker.stats().queue_deletes, 100);
    // the last unbind each round took the exchange with it
    assert!(!broker.has_exchange("chat.acme"));

    // and the cache re-declares it for the next publisher
    bs.publish(&tenant(), &general(), MessageKind::Message, b"{}")
        .await
        .unwrap();
    assert!(broker.has_exchange("chat.acme"));
}

#[tokio::test]
async fn test_recovery_after_mass_disconnect() {
    let (broker, bs) = setup();
    let registry = SessionRegistry::new();

    for _ in 0..25 {
        let session = ClientSession::new(bs.clone());
        session.activate(&[membership()]).await.unwrap();
        registry.add(session);
    }
    registry.close_all().await;
    assert_eq!(registry.count(), 0);

    // a fresh session works after everything was torn down
    let session = ClientSession::new(bs.clone());
    session.activate(&[membership()]).await.unwrap();
    bs.publish(&tenant(), &general(), MessageKind::Message, b"{}")
        .await
        .unwrap();
    assert_eq!(
        broker.queue_len(&format!("chat.session.{}", session.id())),
        Some(1)
    );
    session.close().await;
}

#[tokio::test]
async fn test_concurrent_publishers_share_one_declare() {
    let (broker, bs) = setup();
    bs.declare_topic(&tenant()).await.unwrap();

    let mut handles = vec![];
    for _ in 0..20 {
        let bs = bs.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..10 {
                bs.publish(&tenant(), &general(), MessageKind::Typing, b"{}")
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(broker.stats().publishes, 200);
    assert_eq!(broker.stats().exchanges_declared, 1);
    assert_eq!(bs.cached_topics(), 1);
}
