use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crossbar_core::{ConversationKey, Principal, ToolCall, ToolExecutionResult};

/// Lifecycle state of a session.
///
/// `expired` and `closed` are terminal: no store operation transitions a
/// session out of them. A new event on the same conversation creates a
/// fresh session instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Paused,
    Expired,
    Closed,
}

/// Role of a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

/// One entry in a session's conversation history, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Source event for user messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    /// Tool invocations requested by an assistant message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Result carried by a tool message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolExecutionResult>,
}

impl SessionMessage {
    pub fn user(content: impl Into<String>, event_id: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            timestamp: Utc::now(),
            event_id: Some(event_id.into()),
            tool_calls: None,
            tool_result: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
            event_id: None,
            tool_calls: None,
            tool_result: None,
        }
    }

    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: Some(tool_calls),
            ..Self::assistant(content)
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
            timestamp: Utc::now(),
            event_id: None,
            tool_calls: None,
            tool_result: None,
        }
    }

    pub fn tool(result: ToolExecutionResult) -> Self {
        Self {
            role: MessageRole::Tool,
            content: result.text().to_string(),
            timestamp: Utc::now(),
            event_id: None,
            tool_calls: None,
            tool_result: Some(result),
        }
    }
}

/// Durable per-conversation state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// UUIDv7 — time-sortable for easier log correlation.
    pub id: String,
    pub conversation: ConversationKey,
    pub principal: Principal,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Free-form key/value context for processors.
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
    /// Conversation history, oldest first.
    #[serde(default)]
    pub history: Vec<SessionMessage>,
}

impl Session {
    pub fn new(conversation: ConversationKey, principal: Principal, ttl: Option<Duration>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7().to_string(),
            conversation,
            principal,
            state: SessionState::Active,
            created_at: now,
            last_activity_at: now,
            expires_at: ttl.map(|t| now + t),
            context: HashMap::new(),
            history: Vec::new(),
        }
    }

    /// Active and not past its deadline.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.state == SessionState::Active && self.expires_at.map_or(true, |e| now < e)
    }

    /// Past its deadline (or already marked), but never for closed
    /// sessions — those ended deliberately.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            SessionState::Expired => true,
            SessionState::Closed => false,
            SessionState::Active | SessionState::Paused => {
                self.expires_at.map_or(false, |e| now >= e)
            }
        }
    }
}
