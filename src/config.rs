//! Server configuration

use crate::channels::IdError;
use crate::server::frames::DEFAULT_MAX_FRAME_BYTES;
use crate::server::router::{
    TopicRouter, DEFAULT_QUEUE_TEMPLATE, DEFAULT_ROUTING_KEY_TEMPLATE, DEFAULT_TOPIC_TEMPLATE,
};
use axum::http::HeaderName;
use std::net::SocketAddr;
use thiserror::Error;

pub const DEFAULT_BIND: &str = "0.0.0.0:8000";
pub const DEFAULT_IDENTITY_HEADER: &str = "x-authenticated-user";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Template(#[from] IdError),

    #[error("invalid identity header name '{0}'")]
    IdentityHeader(String),
}

/// Naming templates for exchanges, routing keys and queues
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingConfig {
    pub topic: String,
    pub routing_key: String,
    pub queue: String,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            topic: DEFAULT_TOPIC_TEMPLATE.to_string(),
            routing_key: DEFAULT_ROUTING_KEY_TEMPLATE.to_string(),
            queue: DEFAULT_QUEUE_TEMPLATE.to_string(),
        }
    }
}

impl NamingConfig {
    /// Validate the templates and build a router from them
    pub fn router(&self) -> Result<TopicRouter, ConfigError> {
        Ok(TopicRouter::new(&self.topic, &self.routing_key, &self.queue)?)
    }
}

/// WebSocket gateway settings
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Largest inbound frame accepted, in bytes
    pub max_frame_bytes: usize,
    /// Header carrying the identity asserted by the upstream auth layer
    pub identity_header: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            identity_header: DEFAULT_IDENTITY_HEADER.to_string(),
        }
    }
}

impl GatewayConfig {
    pub fn identity_header_name(&self) -> Result<HeaderName, ConfigError> {
        HeaderName::try_from(self.identity_header.to_ascii_lowercase())
            .map_err(|_| ConfigError::IdentityHeader(self.identity_header.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let gateway = GatewayConfig::default();
        assert_eq!(gateway.bind_addr, DEFAULT_BIND.parse().unwrap());
        assert_eq!(gateway.max_frame_bytes, 65536);
        assert_eq!(gateway.identity_header_name().unwrap().as_str(), DEFAULT_IDENTITY_HEADER);

        let router = NamingConfig::default().router().unwrap();
        assert_eq!(router.templates().0.as_str(), "chat.{tenant_id}");
    }

    #[test]
    fn test_header_name_is_normalized() {
        let gateway = GatewayConfig {
            identity_header: "X-Forwarded-User".into(),
            ..GatewayConfig::default()
        };
        assert_eq!(gateway.identity_header_name().unwrap().as_str(), "x-forwarded-user");
    }

    #[test]
    fn test_invalid_values() {
        let gateway = GatewayConfig {
            identity_header: "not a header".into(),
            ..GatewayConfig::default()
        };
        assert!(matches!(
            gateway.identity_header_name(),
            Err(ConfigError::IdentityHeader(_))
        ));

        let naming = NamingConfig {
            topic: "chat.{tenant}".into(),
            ..NamingConfig::default()
        };
        assert!(matches!(naming.router(), Err(ConfigError::Template(_))));
    }
}
