//! In-process topic exchange
//!
//! Follows AMQP topic-exchange rules closely enough to exercise the broker
//! session: `*` matches one word, `#` matches zero or more, auto-delete
//! exchanges vanish with their last binding, and deleting a queue ends its
//! consumer.

use crate::broker::{
    Acknowledge, BrokerError, Delivery, DeliveryStream, ExchangeHandle, QueueHandle, Transport,
};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

/// Matches a routing key against a binding pattern
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.first(), key.first()) {
        (None, None) => true,
        // # swallows zero or more words
        (Some(&"#"), _) => {
            match_words(&pattern[1..], key) || (!key.is_empty() && match_words(pattern, &key[1..]))
        }
        (None, Some(_)) | (Some(_), None) => false,
        (Some(&word), Some(&part)) => {
            (word == "*" || word == part) && match_words(&pattern[1..], &key[1..])
        }
    }
}

/// Operation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub exchanges_declared: u64,
    pub publishes: u64,
    pub purges: u64,
    pub queue_deletes: u64,
    pub acks: u64,
}

#[derive(Default)]
struct QueueInner {
    messages: VecDeque<Vec<u8>>,
    deleted: bool,
}

struct MemoryQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl MemoryQueue {
    fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
        }
    }

    fn push(&self, payload: Vec<u8>) {
        self.inner.lock().messages.push_back(payload);
        self.notify.notify_waiters();
    }
}

#[derive(Default)]
struct Exchange {
    /// (queue name, pattern)
    bindings: HashSet<(String, String)>,
    ever_bound: bool,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Arc<MemoryQueue>>,
}

impl State {
    /// Drop auto-delete exchanges whose last binding just went away
    fn reap_exchanges(&mut self) {
        self.exchanges.retain(|name, exchange| {
            let keep = !exchange.ever_bound || !exchange.bindings.is_empty();
            if !keep {
                debug!(exchange = %name, "Auto-deleting unbound exchange");
            }
            keep
        });
    }
}

struct MemoryAck(Arc<AtomicU64>);

#[async_trait]
impl Acknowledge for MemoryAck {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Single-process broker
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
    exchanges_declared: AtomicU64,
    publishes: AtomicU64,
    purges: AtomicU64,
    queue_deletes: AtomicU64,
    acks: Arc<AtomicU64>,
    failing_publishes: AtomicU32,
    /// Bind/unbind calls left to succeed before one fails
    failing_binding: Mutex<Option<u32>>,
    closed: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            exchanges_declared: self.exchanges_declared.load(Ordering::SeqCst),
            publishes: self.publishes.load(Ordering::SeqCst),
            purges: self.purges.load(Ordering::SeqCst),
            queue_deletes: self.queue_deletes.load(Ordering::SeqCst),
            acks: self.acks.load(Ordering::SeqCst),
        }
    }

    /// Remove an exchange as the broker would after an idle period
    pub fn evict_exchange(&self, name: &str) -> bool {
        self.state.lock().exchanges.remove(name).is_some()
    }

    /// Make the next `count` publishes fail as if the channel were closed
    pub fn fail_next_publishes(&self, count: u32) {
        self.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Let `successes` bind or unbind calls through, then fail the next one
    pub fn fail_binding_after(&self, successes: u32) {
        *self.failing_binding.lock() = Some(successes);
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.state.lock().exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state.lock().queues.contains_key(name)
    }

    pub fn queue_len(&self, name: &str) -> Option<usize> {
        let state = self.state.lock();
        let queue = state.queues.get(name)?;
        let len = queue.inner.lock().messages.len();
        Some(len)
    }

    /// Number of bindings from `queue` to `exchange`
    pub fn binding_count(&self, exchange: &str, queue: &str) -> usize {
        self.state
            .lock()
            .exchanges
            .get(exchange)
            .map(|e| e.bindings.iter().filter(|(q, _)| q == queue).count())
            .unwrap_or(0)
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check_binding_failure(&self, queue: &QueueHandle) -> Result<(), BrokerError> {
        let mut failing = self.failing_binding.lock();
        match *failing {
            Some(0) => {
                *failing = None;
                Err(BrokerError::Protocol(format!(
                    "binding of '{}' refused",
                    queue
                )))
            }
            Some(n) => {
                *failing = Some(n - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn declare_exchange(&self, name: &str) -> Result<ExchangeHandle, BrokerError> {
        self.ensure_open()?;
        self.state
            .lock()
            .exchanges
            .entry(name.to_string())
            .or_default();
        self.exchanges_declared.fetch_add(1, Ordering::SeqCst);
        Ok(ExchangeHandle::new(name))
    }

    async fn publish(
        &self,
        exchange: &ExchangeHandle,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if self.take_injected_failure() {
            return Err(BrokerError::ChannelClosed(exchange.name().to_string()));
        }

        let state = self.state.lock();
        let target = state
            .exchanges
            .get(exchange.name())
            .ok_or_else(|| BrokerError::NotFound(exchange.name().to_string()))?;

        let mut matched: HashSet<&str> = HashSet::new();
        for (queue, pattern) in &target.bindings {
            if topic_matches(pattern, routing_key) {
                matched.insert(queue.as_str());
            }
        }
        for queue in matched {
            if let Some(q) = state.queues.get(queue) {
                q.push(payload.to_vec());
            }
        }
        drop(state);

        self.publishes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> Result<QueueHandle, BrokerError> {
        self.ensure_open()?;
        self.state
            .lock()
            .queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryQueue::new()));
        Ok(QueueHandle::new(name))
    }

    async fn bind(
        &self,
        queue: &QueueHandle,
        exchange: &ExchangeHandle,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.check_binding_failure(queue)?;
        let mut state = self.state.lock();
        if !state.queues.contains_key(queue.name()) {
            return Err(BrokerError::NotFound(queue.name().to_string()));
        }
        let target = state
            .exchanges
            .get_mut(exchange.name())
            .ok_or_else(|| BrokerError::NotFound(exchange.name().to_string()))?;
        target
            .bindings
            .insert((queue.name().to_string(), routing_key.to_string()));
        target.ever_bound = true;
        Ok(())
    }

    async fn unbind(
        &self,
        queue: &QueueHandle,
        exchange: &ExchangeHandle,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.check_binding_failure(queue)?;
        let mut state = self.state.lock();
        let target = state
            .exchanges
            .get_mut(exchange.name())
            .ok_or_else(|| BrokerError::NotFound(exchange.name().to_string()))?;
        target
            .bindings
            .remove(&(queue.name().to_string(), routing_key.to_string()));
        state.reap_exchanges();
        Ok(())
    }

    async fn purge(&self, queue: &QueueHandle) -> Result<u32, BrokerError> {
        self.ensure_open()?;
        let q = self
            .state
            .lock()
            .queues
            .get(queue.name())
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(queue.name().to_string()))?;
        let dropped = {
            let mut inner = q.inner.lock();
            let n = inner.messages.len();
            inner.messages.clear();
            n
        };
        self.purges.fetch_add(1, Ordering::SeqCst);
        Ok(u32::try_from(dropped).unwrap_or(u32::MAX))
    }

    async fn delete_queue(&self, queue: &QueueHandle) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let removed = {
            let mut state = self.state.lock();
            let removed = state.queues.remove(queue.name());
            for exchange in state.exchanges.values_mut() {
                exchange.bindings.retain(|(q, _)| q != queue.name());
            }
            state.reap_exchanges();
            removed
        };
        if let Some(q) = removed {
            q.inner.lock().deleted = true;
            q.notify.notify_waiters();
        }
        self.queue_deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn consume(&self, queue: &QueueHandle) -> Result<DeliveryStream, BrokerError> {
        self.ensure_open()?;
        let q = self
            .state
            .lock()
            .queues
            .get(queue.name())
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(queue.name().to_string()))?;

        let stream = futures::stream::unfold((q, self.acks.clone()), |(q, acks)| async move {
            loop {
                let shared = Arc::clone(&q);
                let notified = shared.notify.notified();
                {
                    let mut inner = q.inner.lock();
                    if let Some(payload) = inner.messages.pop_front() {
                        drop(inner);
                        let delivery = Delivery::new(payload, Box::new(MemoryAck(acks.clone())));
                        return Some((Ok(delivery), (q, acks)));
                    }
                    if inner.deleted {
                        return None;
                    }
                }
                notified.await;
            }
        });

        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
