//! Inbound frame validation
//!
//! Checks run in order: size first, then structure. A rejected frame is never
//! published and closes the connection with the rejection's close code.

use crate::channels::{ChannelId, Membership, MessageKind};
use axum::extract::ws::{close_code, CloseFrame, Utf8Bytes};
use serde::Deserialize;
use thiserror::Error;

/// Default cap on inbound frame size in bytes
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameRejection {
    #[error("message too large")]
    TooLarge { size: usize, max: usize },

    #[error("payload is not valid structured data")]
    Unsupported(String),
}

impl FrameRejection {
    pub fn close_code(&self) -> u16 {
        match self {
            FrameRejection::TooLarge { .. } => close_code::SIZE,
            FrameRejection::Unsupported(_) => close_code::UNSUPPORTED,
        }
    }

    /// Client-facing reason. Never includes parser detail.
    pub fn reason(&self) -> &'static str {
        match self {
            FrameRejection::TooLarge { .. } => "message too large",
            FrameRejection::Unsupported(_) => "payload is not valid structured data",
        }
    }

    pub fn close_frame(&self) -> CloseFrame {
        CloseFrame {
            code: self.close_code(),
            reason: Utf8Bytes::from_static(self.reason()),
        }
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    channel_id: Option<ChannelId>,
    #[serde(default)]
    kind: Option<MessageKind>,
}

/// A frame that passed validation, with its publish target selectors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub channel_id: Option<ChannelId>,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl InboundFrame {
    /// Pick the membership this frame publishes to: the named channel if the
    /// session is bound to it, otherwise the first membership. `None` if the
    /// named channel is not bound or there are no memberships.
    pub fn target<'a>(&self, memberships: &'a [Membership]) -> Option<&'a Membership> {
        match &self.channel_id {
            Some(channel) => memberships.iter().find(|m| &m.channel == channel),
            None => memberships.first(),
        }
    }
}

/// Validate one inbound frame against `max_bytes`
pub fn validate_frame(bytes: &[u8], max_bytes: usize) -> Result<InboundFrame, FrameRejection> {
    if bytes.len() > max_bytes {
        return Err(FrameRejection::TooLarge {
            size: bytes.len(),
            max: max_bytes,
        });
    }

    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| FrameRejection::Unsupported(e.to_string()))?;
    if !value.is_object() {
        return Err(FrameRejection::Unsupported("expected a JSON object".into()));
    }
    let envelope: Envelope =
        serde_json::from_value(value).map_err(|e| FrameRejection::Unsupported(e.to_string()))?;

    Ok(InboundFrame {
        channel_id: envelope.channel_id,
        kind: envelope.kind.unwrap_or(MessageKind::Message),
        payload: bytes.to_vec(),
    })
}
