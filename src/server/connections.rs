//! Live session registry

use crate::server::lifecycle::{ClientSession, LifecycleError};
use crate::channels::{Membership, SessionId};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// All sessions currently attached to a gateway connection
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<SessionId, Arc<ClientSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session
    pub fn add(&self, session: Arc<ClientSession>) {
        self.sessions.insert(session.id().clone(), session);
    }

    /// Remove a session. Teardown is the caller's job.
    pub fn remove(&self, id: &SessionId) -> Option<Arc<ClientSession>> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<ClientSession>> {
        self.sessions.get(id).map(|r| r.clone())
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Bind a live session to another channel. `Ok(None)` if no such session.
    pub async fn join(
        &self,
        id: &SessionId,
        membership: &Membership,
    ) -> Result<Option<bool>, LifecycleError> {
        let Some(session) = self.get(id) else {
            return Ok(None);
        };
        session.join(membership).await.map(Some)
    }

    /// Unbind a live session from a channel. `Ok(None)` if no such session.
    pub async fn leave(
        &self,
        id: &SessionId,
        membership: &Membership,
    ) -> Result<Option<bool>, LifecycleError> {
        let Some(session) = self.get(id) else {
            return Ok(None);
        };
        session.leave(membership).await.map(Some)
    }

    /// Close every registered session, e.g. on shutdown
    pub async fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.iter().map(|e| e.value().clone()).collect();
        debug!(sessions = sessions.len(), "Closing all sessions");
        futures::future::join_all(sessions.iter().map(|s| s.close())).await;
        for session in sessions {
            self.sessions.remove(session.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerSession, MemoryBroker};
    use crate::channels::{ChannelId, TenantId};
    use crate::server::router::TopicRouter;

    fn broker_session() -> (Arc<MemoryBroker>, Arc<BrokerSession>) {
        let broker = Arc::new(MemoryBroker::new());
        let session = Arc::new(BrokerSession::new(broker.clone(), TopicRouter::default()));
        (broker, session)
    }

    fn membership(channel: &str) -> Membership {
        Membership::new(TenantId::parse("acme").unwrap(), ChannelId::parse(channel).unwrap())
    }

    #[test]
    fn test_add_get_remove() {
        let (_broker, bs) = broker_session();
        let registry = SessionRegistry::new();
        let session = ClientSession::new(bs);
        let id = session.id().clone();

        registry.add(session);
        assert_eq!(registry.count(), 1);
        assert!(registry.get(&id).is_some());
        assert_eq!(registry.ids(), vec![id.clone()]);

        assert!(registry.remove(&id).is_some());
        assert!(registry.remove(&id).is_none());
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_join_leave_through_registry() {
        let (broker, bs) = broker_session();
        let registry = SessionRegistry::new();
        let session = ClientSession::new(bs);
        session.activate(&[membership("general")]).await.unwrap();
        let id = session.id().clone();
        registry.add(session);

        let random = membership("random");
        assert_eq!(registry.join(&id, &random).await.unwrap(), Some(true));
        let queue = format!("chat.session.{id}");
        assert_eq!(broker.binding_count("chat.acme", &queue), 6);

        assert_eq!(registry.leave(&id, &random).await.unwrap(), Some(true));
        assert_eq!(broker.binding_count("chat.acme", &queue), 3);

        let unknown = SessionId::parse("nobody").unwrap();
        assert_eq!(registry.join(&unknown, &random).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_close_all() {
        let (broker, bs) = broker_session();
        let registry = SessionRegistry::new();
        for _ in 0..3 {
            let session = ClientSession::new(bs.clone());
            session.activate(&[membership("general")]).await.unwrap();
            registry.add(session);
        }

        registry.close_all().await;
        assert_eq!(registry.count(), 0);
        assert_eq!(broker.stats().queue_deletes, 3);
        assert!(!broker.has_exchange("chat.acme"));
    }
}
