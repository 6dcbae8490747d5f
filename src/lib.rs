//! Chatbus - real-time chat fan-out over an AMQP topic broker
//!
//! Each WebSocket connection gets an exclusive broker queue bound to the
//! channels it belongs to. Inbound frames are published to the tenant's topic
//! exchange; deliveries on the queue are relayed back to the socket.

pub mod auth;
pub mod broker;
pub mod channels;
pub mod config;
pub mod server;

pub use auth::{Identity, MembershipResolver, StaticMemberships};
pub use broker::{BrokerError, BrokerSession, MemoryBroker};
pub use channels::{BindingAction, ChannelId, Membership, MessageKind, SessionId, TenantId};
pub use server::{ChatbusServer, TopicRouter};
