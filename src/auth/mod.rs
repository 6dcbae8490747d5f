//! Authorization collaborator
//!
//! Authentication happens upstream; the gateway receives an already
//! authenticated identity and asks a `MembershipResolver` which channels the
//! connection starts in.

mod memberships;

pub use memberships::StaticMemberships;

use crate::channels::Membership;
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("identity '{0}' may not open a chat connection")]
    Forbidden(String),

    #[error("membership lookup failed: {0}")]
    Lookup(String),
}

/// An authenticated user, as asserted by the upstream auth layer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Yields the initial (tenant, channel) memberships of a connection
#[async_trait]
pub trait MembershipResolver: Send + Sync {
    async fn initial_memberships(&self, identity: &Identity) -> Result<Vec<Membership>, AuthError>;
}
