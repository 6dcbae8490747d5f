//! Message broker access
//!
//! - `amqp`: AMQP 0-9-1 transport (RabbitMQ and compatible brokers)
//! - `memory`: in-process topic exchange, used by tests and local development
//! - `session`: the process-wide broker session built on top of a transport

pub mod amqp;
pub mod memory;
pub mod session;

pub use amqp::{AmqpConfig, AmqpTransport};
pub use memory::{MemoryBroker, MemoryStats};
pub use session::{BrokerSession, DeliveryHandler, RelayError};

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Broker errors
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("broker unreachable at {addr} after {attempts} attempt(s): {reason}")]
    Unreachable {
        addr: String,
        attempts: u32,
        reason: String,
    },

    #[error("not found on broker: {0}")]
    NotFound(String),

    #[error("channel closed during operation on {0}")]
    ChannelClosed(String),

    #[error("broker session is closed")]
    Closed,

    #[error("delivery to exchange '{exchange}' failed after re-declare: {source}")]
    Delivery {
        exchange: String,
        #[source]
        source: Box<BrokerError>,
    },

    #[error("invalid broker url: {0}")]
    InvalidUrl(String),

    #[error("broker protocol error: {0}")]
    Protocol(String),
}

impl BrokerError {
    /// True when the failure means a cached exchange handle no longer exists
    /// broker-side and a re-declare may succeed.
    pub fn is_stale(&self) -> bool {
        matches!(self, BrokerError::NotFound(_) | BrokerError::ChannelClosed(_))
    }
}

/// A declared exchange
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExchangeHandle {
    name: Arc<str>,
}

impl ExchangeHandle {
    pub fn new(name: &str) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ExchangeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A declared queue
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueHandle {
    name: Arc<str>,
}

impl QueueHandle {
    pub fn new(name: &str) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for QueueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Settles a delivered message with the broker
#[async_trait]
pub trait Acknowledge: Send {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;
}

/// A message taken off a queue
pub struct Delivery {
    payload: Vec<u8>,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(payload: Vec<u8>, acker: Box<dyn Acknowledge>) -> Self {
        Self { payload, acker }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("len", &self.payload.len())
            .finish()
    }
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// Wire-level broker operations
///
/// Exchanges are topic exchanges, non-durable and auto-deleted once their
/// last binding is removed. Queues are exclusive and non-durable; declaring
/// an existing queue returns the same queue.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn declare_exchange(&self, name: &str) -> Result<ExchangeHandle, BrokerError>;

    async fn publish(
        &self,
        exchange: &ExchangeHandle,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError>;

    async fn declare_queue(&self, name: &str) -> Result<QueueHandle, BrokerError>;

    async fn bind(
        &self,
        queue: &QueueHandle,
        exchange: &ExchangeHandle,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    async fn unbind(
        &self,
        queue: &QueueHandle,
        exchange: &ExchangeHandle,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Discard undelivered messages, returns how many were dropped
    async fn purge(&self, queue: &QueueHandle) -> Result<u32, BrokerError>;

    async fn delete_queue(&self, queue: &QueueHandle) -> Result<(), BrokerError>;

    /// Start consuming; the stream ends when the queue is deleted
    async fn consume(&self, queue: &QueueHandle) -> Result<DeliveryStream, BrokerError>;

    /// Close the underlying connection. Safe to call more than once.
    async fn close(&self) -> Result<(), BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_classification() {
        assert!(BrokerError::NotFound("chat.acme".into()).is_stale());
        assert!(BrokerError::ChannelClosed("chat.acme".into()).is_stale());
        assert!(!BrokerError::Closed.is_stale());
        assert!(!BrokerError::Protocol("boom".into()).is_stale());
    }

    #[test]
    fn test_delivery_error_display() {
        let err = BrokerError::Delivery {
            exchange: "chat.acme".into(),
            source: Box::new(BrokerError::NotFound("chat.acme".into())),
        };
        assert_eq!(
            err.to_string(),
            "delivery to exchange 'chat.acme' failed after re-declare: not found on broker: chat.acme"
        );
    }
}
