//! Broker resource naming
//!
//! Topic names, routing keys and queue names are rendered from configurable
//! templates with named placeholders: `{tenant_id}`, `{channel_id}`,
//! `{message_kind}` and `{session_id}`.

use crate::channels::{ChannelId, IdError, MessageKind, SessionId, TenantId};
use std::fmt;

pub const DEFAULT_TOPIC_TEMPLATE: &str = "chat.{tenant_id}";
pub const DEFAULT_ROUTING_KEY_TEMPLATE: &str = "{message_kind}.{channel_id}";
pub const DEFAULT_QUEUE_TEMPLATE: &str = "chat.session.{session_id}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    TenantId,
    ChannelId,
    MessageKind,
    SessionId,
}

impl Placeholder {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "tenant_id" => Some(Placeholder::TenantId),
            "channel_id" => Some(Placeholder::ChannelId),
            "message_kind" => Some(Placeholder::MessageKind),
            "session_id" => Some(Placeholder::SessionId),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Placeholder::TenantId => "tenant_id",
            Placeholder::ChannelId => "channel_id",
            Placeholder::MessageKind => "message_kind",
            Placeholder::SessionId => "session_id",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Slot(Placeholder),
}

/// A parsed naming template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameTemplate {
    source: String,
    parts: Vec<Part>,
}

impl NameTemplate {
    /// Parse a template, accepting only the given placeholders and requiring
    /// each of `required` to appear at least once.
    pub fn parse(
        template: &str,
        allowed: &[Placeholder],
        required: &[Placeholder],
    ) -> Result<Self, IdError> {
        let invalid = |reason: String| IdError::InvalidTemplate {
            template: template.to_string(),
            reason,
        };

        let mut parts = Vec::new();
        let mut rest = template;

        while !rest.is_empty() {
            match rest.find(['{', '}']) {
                None => {
                    parts.push(Part::Literal(rest.to_string()));
                    break;
                }
                Some(idx) if rest.as_bytes()[idx] == b'}' => {
                    return Err(invalid("unmatched '}'".to_string()));
                }
                Some(open) => {
                    if open > 0 {
                        parts.push(Part::Literal(rest[..open].to_string()));
                    }
                    let after = &rest[open + 1..];
                    let close = after
                        .find('}')
                        .ok_or_else(|| invalid("unclosed '{'".to_string()))?;
                    let name = &after[..close];
                    let slot = Placeholder::parse(name)
                        .filter(|p| allowed.contains(p))
                        .ok_or_else(|| invalid(format!("unknown placeholder '{{{}}}'", name)))?;
                    parts.push(Part::Slot(slot));
                    rest = &after[close + 1..];
                }
            }
        }

        for needed in required {
            if !parts.contains(&Part::Slot(*needed)) {
                return Err(invalid(format!("missing placeholder '{{{}}}'", needed.name())));
            }
        }

        Ok(Self {
            source: template.to_string(),
            parts,
        })
    }

    fn render(&self, value: impl Fn(Placeholder) -> String) -> String {
        let mut out = String::with_capacity(self.source.len() + 32);
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Slot(slot) => out.push_str(&value(*slot)),
            }
        }
        out
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for NameTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Maps tenants, channels and sessions to broker names
#[derive(Debug, Clone)]
pub struct TopicRouter {
    topic: NameTemplate,
    routing_key: NameTemplate,
    queue: NameTemplate,
}

impl TopicRouter {
    pub fn new(topic: &str, routing_key: &str, queue: &str) -> Result<Self, IdError> {
        Ok(Self {
            topic: NameTemplate::parse(topic, &[Placeholder::TenantId], &[Placeholder::TenantId])?,
            routing_key: NameTemplate::parse(
                routing_key,
                &[Placeholder::ChannelId, Placeholder::MessageKind],
                &[Placeholder::ChannelId, Placeholder::MessageKind],
            )?,
            queue: NameTemplate::parse(queue, &[Placeholder::SessionId], &[Placeholder::SessionId])?,
        })
    }

    /// Exchange name for a tenant
    pub fn topic_name(&self, tenant: &TenantId) -> String {
        self.topic.render(|_| tenant.to_string())
    }

    /// Routing key for a message kind on a channel
    pub fn routing_key(&self, kind: MessageKind, channel: &ChannelId) -> String {
        self.routing_key.render(|slot| match slot {
            Placeholder::MessageKind => kind.as_str().to_string(),
            _ => channel.to_string(),
        })
    }

    /// Queue name for a client session
    pub fn queue_name(&self, session: &SessionId) -> String {
        self.queue.render(|_| session.to_string())
    }

    pub fn templates(&self) -> (&NameTemplate, &NameTemplate, &NameTemplate) {
        (&self.topic, &self.routing_key, &self.queue)
    }
}

impl Default for TopicRouter {
    fn default() -> Self {
        let literal = |s: &str| Part::Literal(s.to_string());
        Self {
            topic: NameTemplate {
                source: DEFAULT_TOPIC_TEMPLATE.to_string(),
                parts: vec![literal("chat."), Part::Slot(Placeholder::TenantId)],
            },
            routing_key: NameTemplate {
                source: DEFAULT_ROUTING_KEY_TEMPLATE.to_string(),
                parts: vec![
                    Part::Slot(Placeholder::MessageKind),
                    literal("."),
                    Part::Slot(Placeholder::ChannelId),
                ],
            },
            queue: NameTemplate {
                source: DEFAULT_QUEUE_TEMPLATE.to_string(),
                parts: vec![literal("chat.session."), Part::Slot(Placeholder::SessionId)],
            },
        }
    }
}
