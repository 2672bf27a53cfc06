use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::GatewayError;

/// Addressable conversation context on a platform.
///
/// A conversation is keyed by `(platform, tenant, room, thread?)` where the
/// tenant is the platform-specific grouping (Slack workspace, Discord
/// server, Teams team) inside which rooms are namespaced. Equality is total
/// and the key defines the per-conversation ordering domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    /// Lowercase platform identifier (e.g. "slack", "telegram").
    pub platform: String,
    /// Workspace / server / team the room belongs to.
    pub tenant: String,
    /// Channel, group, or DM identifier within the tenant.
    pub room: String,
    /// Thread identifier, for platforms that thread inside rooms.
    pub thread: Option<String>,
}

impl ConversationKey {
    pub fn new(
        platform: impl Into<String>,
        tenant: impl Into<String>,
        room: impl Into<String>,
    ) -> Self {
        Self {
            platform: platform.into(),
            tenant: tenant.into(),
            room: room.into(),
            thread: None,
        }
    }

    /// Same key narrowed to a thread inside the room.
    pub fn with_thread(mut self, thread: impl Into<String>) -> Self {
        self.thread = Some(thread.into());
        self
    }

    /// Canonical string form used as an index key.
    ///
    /// Format: `{platform}:{tenant}:{room}` with `:{thread}` appended when
    /// present. Platform, tenant, and room must not contain colons; the
    /// thread segment is the tail and may.
    pub fn format(&self) -> String {
        match &self.thread {
            Some(thread) => format!("{}:{}:{}:{}", self.platform, self.tenant, self.room, thread),
            None => format!("{}:{}:{}", self.platform, self.tenant, self.room),
        }
    }

    /// Parse a canonical key string back into its parts.
    pub fn parse(s: &str) -> Result<Self, GatewayError> {
        let mut parts = s.splitn(4, ':');
        let (platform, tenant, room) = match (parts.next(), parts.next(), parts.next()) {
            (Some(p), Some(t), Some(r)) if !p.is_empty() && !t.is_empty() && !r.is_empty() => {
                (p, t, r)
            }
            _ => {
                return Err(GatewayError::InvalidRequest(format!(
                    "malformed conversation key: {s}"
                )))
            }
        };
        Ok(Self {
            platform: platform.to_string(),
            tenant: tenant.to_string(),
            room: room.to_string(),
            thread: parts.next().map(str::to_string),
        })
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}

/// A user, bot, or system actor on a platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelIdentity {
    /// Platform the identity belongs to.
    pub platform: String,
    /// Platform-native identifier (user ID, bot ID, …).
    pub id: String,
    /// Human-readable display name, if the platform provides one.
    pub display_name: Option<String>,
}

impl ChannelIdentity {
    pub fn new(platform: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            id: id.into(),
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

impl fmt::Display for ChannelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.display_name {
            Some(name) => write!(f, "{} ({}:{})", name, self.platform, self.id),
            None => write!(f, "{}:{}", self.platform, self.id),
        }
    }
}

/// Classification of an incoming platform event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    Command,
    Button,
    File,
    Reaction,
    Mention,
    Join,
    Leave,
    Webhook,
    Unknown,
}

/// Kind-specific payload carried by a [`ChannelEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// Plain text content (message and mention kinds).
    Message { text: String },
    /// Slash-command style invocation, pre-split by the adapter.
    Command { name: String, args: Vec<String> },
    /// Interactive button press.
    Button {
        action_id: String,
        value: Option<String>,
    },
    /// File shared into the conversation.
    File {
        file_id: String,
        file_name: Option<String>,
        size_bytes: Option<u64>,
    },
    /// Emoji reaction added to a message.
    Reaction { emoji: String, message_id: String },
    /// Raw webhook body forwarded by an adapter.
    Webhook { body: serde_json::Value },
    /// Kinds without structured content (join, leave, unknown).
    Empty,
}

/// Normalized event received from a channel adapter.
///
/// `event_id` is the idempotency key: the platform-assigned unique id for
/// this delivery, stable across redeliveries of the same event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelEvent {
    pub event_id: String,
    pub kind: EventKind,
    pub conversation: ConversationKey,
    /// The actor that produced the event.
    pub sender: ChannelIdentity,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
    /// Full raw platform payload for adapters that need extra fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

impl ChannelEvent {
    /// Build a plain message event.
    pub fn message(
        event_id: impl Into<String>,
        conversation: ConversationKey,
        sender: ChannelIdentity,
        text: impl Into<String>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            kind: EventKind::Message,
            conversation,
            sender,
            timestamp: Utc::now(),
            payload: EventPayload::Message { text: text.into() },
            raw: None,
        }
    }

    /// Text content of the event, when the payload carries any.
    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::Message { text } => Some(text),
            _ => None,
        }
    }
}

/// Payload shape of an outbound response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponsePayload {
    /// Plain text message.
    Text { text: String },
    /// Platform rich-layout blocks, passed through opaquely.
    Blocks { blocks: Vec<serde_json::Value> },
    /// File upload referencing content held by the caller.
    File {
        file_name: String,
        caption: Option<String>,
    },
    /// Edit of a previously sent message.
    Update { message_id: String, text: String },
    /// Deletion of a previously sent message.
    Delete { message_id: String },
    /// Message visible only to one user.
    Ephemeral { user_id: String, text: String },
    /// Emoji reaction on an existing message.
    Reaction { message_id: String, emoji: String },
    /// Typing indicator.
    Typing,
}

/// Normalized response dispatched back through a channel adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelResponse {
    /// Target conversation; its `platform` selects the adapter.
    pub conversation: ConversationKey,
    pub payload: ResponsePayload,
    /// Message id this response replies to, for threading platforms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl ChannelResponse {
    pub fn text(conversation: ConversationKey, text: impl Into<String>) -> Self {
        Self {
            conversation,
            payload: ResponsePayload::Text { text: text.into() },
            reply_to: None,
        }
    }

    pub fn in_reply_to(mut self, message_id: impl Into<String>) -> Self {
        self.reply_to = Some(message_id.into());
        self
    }

    /// Text content of the response, when the payload carries any.
    pub fn text_content(&self) -> Option<&str> {
        match &self.payload {
            ResponsePayload::Text { text } | ResponsePayload::Update { text, .. } => Some(text),
            ResponsePayload::Ephemeral { text, .. } => Some(text),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ConversationKey {
        ConversationKey::new("slack", "T123", "C456")
    }

    #[test]
    fn conversation_key_roundtrip() {
        let k = key();
        let s = k.format();
        assert_eq!(s, "slack:T123:C456");
        assert_eq!(ConversationKey::parse(&s).unwrap(), k);
    }

    #[test]
    fn conversation_key_roundtrip_with_thread() {
        let k = key().with_thread("1719853.0042");
        let parsed = ConversationKey::parse(&k.format()).unwrap();
        assert_eq!(parsed.thread.as_deref(), Some("1719853.0042"));
    }

    #[test]
    fn conversation_key_thread_tail_may_contain_colons() {
        let k = key().with_thread("a:b:c");
        let parsed = ConversationKey::parse(&k.format()).unwrap();
        assert_eq!(parsed.thread.as_deref(), Some("a:b:c"));
    }

    #[test]
    fn conversation_key_parse_rejects_short_keys() {
        assert!(ConversationKey::parse("slack:T123").is_err());
        assert!(ConversationKey::parse("slack::C456").is_err());
    }

    #[test]
    fn event_json_roundtrip_preserves_fields() {
        let ev = ChannelEvent::message(
            "evt-1",
            key(),
            ChannelIdentity::new("slack", "U1").with_display_name("Alice"),
            "hello",
        );
        let json = serde_json::to_string(&ev).unwrap();
        let back: ChannelEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ev);
        assert_eq!(back.text(), Some("hello"));
    }

    #[test]
    fn response_json_uses_snake_case_tags() {
        let resp = ChannelResponse::text(key(), "hi").in_reply_to("m-9");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains(r#""type":"text""#));
        assert!(json.contains(r#""reply_to":"m-9""#));
    }
}
