//! Identifiers for tenants, channels and client sessions
//!
//! Every identifier ends up inside a broker resource name or a routing key,
//! so each one is a single routing-key word: `[a-zA-Z0-9_-]+`. Dots and the
//! `*`/`#` wildcards are rejected because the topic exchange would read them
//! as word separators or patterns.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Valid characters for an identifier
fn is_valid_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("{0} cannot be empty")]
    Empty(&'static str),

    #[error("invalid {kind} '{value}': must match [a-zA-Z0-9_-]+")]
    InvalidChars { kind: &'static str, value: String },

    #[error("unknown message kind '{0}'")]
    UnknownMessageKind(String),

    #[error("unknown binding action '{0}': expected ADD or REMOVE")]
    UnknownAction(String),

    #[error("invalid membership '{0}': expected tenant/channel")]
    InvalidMembership(String),

    #[error("invalid template '{template}': {reason}")]
    InvalidTemplate { template: String, reason: String },
}

fn validate(kind: &'static str, value: &str) -> Result<(), IdError> {
    if value.is_empty() {
        return Err(IdError::Empty(kind));
    }
    if !value.chars().all(is_valid_word_char) {
        return Err(IdError::InvalidChars {
            kind,
            value: value.to_string(),
        });
    }
    Ok(())
}

macro_rules! word_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Parse and validate
            pub fn parse(value: &str) -> Result<Self, IdError> {
                validate($kind, value)?;
                Ok(Self(value.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                validate($kind, &value)?;
                Ok(Self(value))
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

word_id!(
    /// Organization namespace; every topic name is scoped by it
    TenantId,
    "tenant id"
);

word_id!(
    /// One conversation stream inside a tenant
    ChannelId,
    "channel id"
);

word_id!(
    /// One connected-client lifetime. Never reused across reconnects.
    SessionId,
    "session id"
);

impl SessionId {
    /// Generate a fresh session id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Selects the routing-key shape for a published message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "MESSAGES")]
    Message,
    #[serde(rename = "TYPING")]
    Typing,
    #[serde(rename = "MESSAGES_BODY")]
    MessageBody,
}

impl MessageKind {
    pub const ALL: [MessageKind; 3] = [
        MessageKind::Message,
        MessageKind::Typing,
        MessageKind::MessageBody,
    ];

    /// Token substituted for `{message_kind}` in routing keys
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Message => "MESSAGES",
            MessageKind::Typing => "TYPING",
            MessageKind::MessageBody => "MESSAGES_BODY",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| IdError::UnknownMessageKind(s.to_string()))
    }
}

/// Binding update requested for a (queue, topic, routing key) triple
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingAction {
    Add,
    Remove,
}

impl fmt::Display for BindingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingAction::Add => write!(f, "ADD"),
            BindingAction::Remove => write!(f, "REMOVE"),
        }
    }
}

impl FromStr for BindingAction {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ADD" | "add" => Ok(BindingAction::Add),
            "REMOVE" | "remove" => Ok(BindingAction::Remove),
            other => Err(IdError::UnknownAction(other.to_string())),
        }
    }
}

/// A (tenant, channel) pair a session listens to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Membership {
    pub tenant: TenantId,
    pub channel: ChannelId,
}

impl Membership {
    pub fn new(tenant: TenantId, channel: ChannelId) -> Self {
        Self { tenant, channel }
    }

    /// Parse `tenant/channel`
    pub fn parse(s: &str) -> Result<Self, IdError> {
        let (tenant, channel) = s
            .split_once('/')
            .ok_or_else(|| IdError::InvalidMembership(s.to_string()))?;
        Ok(Self {
            tenant: TenantId::parse(tenant.trim())?,
            channel: ChannelId::parse(channel.trim())?,
        })
    }
}

impl fmt::Display for Membership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.channel)
    }
}
