use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crossbar_core::{ConversationKey, ErrorPayload, GatewayError};

/// Transport state of an adapter, published on its connection-state
/// stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Gave up: reconnect attempts exhausted or a fatal error occurred.
    Failed,
}

/// Result of dispatching one response through an adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendResult {
    pub success: bool,
    /// Platform-assigned id of the delivered message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Platform-specific delivery detail passed through opaquely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_data: Option<serde_json::Value>,
}

impl SendResult {
    pub fn ok(message_id: impl Into<String>) -> Self {
        Self {
            success: true,
            message_id: Some(message_id.into()),
            error: None,
            timestamp: Some(Utc::now()),
            platform_data: None,
        }
    }

    pub fn failure(error: &GatewayError) -> Self {
        Self {
            success: false,
            message_id: None,
            error: Some(error.to_payload()),
            timestamp: Some(Utc::now()),
            platform_data: None,
        }
    }
}

/// Metadata about a conversation, resolved on demand by adapters that
/// support it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationInfo {
    pub key: ConversationKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_count: Option<u32>,
}

/// Upload request handed to an adapter's `upload_file`.
#[derive(Debug, Clone, PartialEq)]
pub struct FileUpload {
    pub conversation: ConversationKey,
    pub file_name: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
    pub caption: Option<String>,
}

/// Platform file handle returned by `upload_file`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub file_id: String,
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}
