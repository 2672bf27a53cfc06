use serde::{Deserialize, Serialize};

/// What a platform adapter can do, declared up front so the runtime and
/// processors can degrade gracefully instead of hitting `unsupported`
/// errors at send time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelCapabilities {
    pub text: bool,
    pub rich_messages: bool,
    pub attachments: bool,
    pub reactions: bool,
    pub threads: bool,
    pub editing: bool,
    pub deleting: bool,
    pub typing: bool,
    pub files: bool,
    pub buttons: bool,
    pub menus: bool,
    pub modals: bool,
    pub ephemeral: bool,
    pub commands: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_message_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_blocks_per_message: Option<usize>,
    /// Attachment kinds the platform accepts (e.g. "image", "video").
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachment_kinds: Vec<String>,
}

impl ChannelCapabilities {
    /// Minimal text-only adapter (webhooks, SMS bridges, tests).
    pub fn text_only() -> Self {
        Self {
            text: true,
            ..Self::default()
        }
    }

    pub fn slack() -> Self {
        Self {
            text: true,
            rich_messages: true,
            attachments: true,
            reactions: true,
            threads: true,
            editing: true,
            deleting: true,
            typing: false,
            files: true,
            buttons: true,
            menus: true,
            modals: true,
            ephemeral: true,
            commands: true,
            max_message_length: Some(40_000),
            max_file_size: Some(1024 * 1024 * 1024),
            max_blocks_per_message: Some(50),
            attachment_kinds: kinds(&["image", "video", "audio", "document"]),
        }
    }

    pub fn discord() -> Self {
        Self {
            text: true,
            rich_messages: true,
            attachments: true,
            reactions: true,
            threads: true,
            editing: true,
            deleting: true,
            typing: true,
            files: true,
            buttons: true,
            menus: true,
            modals: true,
            ephemeral: true,
            commands: true,
            max_message_length: Some(2_000),
            max_file_size: Some(25 * 1024 * 1024),
            max_blocks_per_message: Some(10),
            attachment_kinds: kinds(&["image", "video", "audio", "document"]),
        }
    }

    pub fn telegram() -> Self {
        Self {
            text: true,
            rich_messages: false,
            attachments: true,
            reactions: true,
            threads: true,
            editing: true,
            deleting: true,
            typing: true,
            files: true,
            buttons: true,
            menus: false,
            modals: false,
            ephemeral: false,
            commands: true,
            max_message_length: Some(4_096),
            max_file_size: Some(50 * 1024 * 1024),
            max_blocks_per_message: None,
            attachment_kinds: kinds(&["image", "video", "audio", "document", "sticker"]),
        }
    }

    pub fn teams() -> Self {
        Self {
            text: true,
            rich_messages: true,
            attachments: true,
            reactions: true,
            threads: true,
            editing: true,
            deleting: true,
            typing: true,
            files: true,
            buttons: true,
            menus: true,
            modals: true,
            ephemeral: false,
            commands: true,
            max_message_length: Some(28_000),
            max_file_size: Some(250 * 1024 * 1024),
            max_blocks_per_message: Some(10),
            attachment_kinds: kinds(&["image", "document"]),
        }
    }
}

fn kinds(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_only_disables_everything_else() {
        let caps = ChannelCapabilities::text_only();
        assert!(caps.text);
        assert!(!caps.rich_messages && !caps.files && !caps.ephemeral);
        assert!(caps.max_message_length.is_none());
    }

    #[test]
    fn platform_presets_set_realistic_limits() {
        assert_eq!(ChannelCapabilities::discord().max_message_length, Some(2_000));
        assert_eq!(ChannelCapabilities::telegram().max_message_length, Some(4_096));
        assert!(ChannelCapabilities::slack().ephemeral);
        assert!(!ChannelCapabilities::teams().ephemeral);
    }
}
