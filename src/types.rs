//! Request types for the proxied conversation API
//!
//! The upstream JSON contract is treated as opaque; only the handful of
//! fields the gateway normalizes before forwarding are modeled here. Every
//! inbound field defaults when absent so partial client payloads decode.

use serde::{Deserialize, Serialize};

/// Author role applied to the first message when the caller leaves it unset
pub const DEFAULT_ROLE: &str = "user";

// =============================================================================
// Conversation Send
// =============================================================================

/// Body of a conversation-send request, forwarded after normalization
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateConversationRequest {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub parent_message_id: String,
    /// Omitted from the forwarded body when blank (starts a new conversation)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub timezone_offset_min: i64,
    #[serde(default)]
    pub variant_purpose: String,
    #[serde(default)]
    pub continue_text: String,
    #[serde(rename = "history_and_training_disabled", default)]
    pub training_disabled: bool,
}

impl CreateConversationRequest {
    /// Normalize the request the way the upstream expects it: blank
    /// conversation ids disappear, the first author role falls back to
    /// [`DEFAULT_ROLE`], variant purpose falls back to `"none"`, and
    /// training stays disabled unconditionally.
    pub fn apply_defaults(&mut self) {
        if self
            .conversation_id
            .as_deref()
            .is_some_and(|id| id.is_empty())
        {
            self.conversation_id = None;
        }
        if let Some(first) = self.messages.first_mut()
            && first.author.role.is_empty()
        {
            first.author.role = DEFAULT_ROLE.to_string();
        }
        if self.variant_purpose.is_empty() {
            self.variant_purpose = "none".to_string();
        }
        self.training_disabled = true;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub author: Author,
    #[serde(default)]
    pub content: Content,
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Author {
    #[serde(default)]
    pub role: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub parts: Vec<String>,
}

// =============================================================================
// Conversation Maintenance
// =============================================================================

/// Body of a conversation update; doubles as the clear-all payload.
///
/// The upstream uses one endpoint for rename and hide: a title renames and
/// keeps the conversation visible, no title hides it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatchConversationRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub is_visible: bool,
}

impl PatchConversationRequest {
    /// Couple visibility to title presence. An empty title counts as absent.
    pub fn normalize(&mut self) {
        if self.title.as_deref().is_some_and(|title| title.is_empty()) {
            self.title = None;
        }
        self.is_visible = self.title.is_some();
    }

    /// Payload that hides every conversation, regardless of caller input.
    pub fn hide_all() -> Self {
        Self {
            title: None,
            is_visible: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateTitleRequest {
    #[serde(default)]
    pub message_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedbackMessageRequest {
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default)]
    pub rating: String,
}

/// Query parameters of the conversation listing
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConversationsQuery {
    #[serde(default)]
    pub offset: Option<String>,
    #[serde(default)]
    pub limit: Option<String>,
}

// =============================================================================
// Login
// =============================================================================

/// Credentials posted to the login route
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}
