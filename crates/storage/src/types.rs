use serde::{Deserialize, Serialize};

use super::ids::{ConversationId, MessageId};

/// Title given to the conversation created on first launch and after clearing everything.
pub const DEFAULT_CONVERSATION_TITLE: &str = "Getting Started";

/// Opening assistant message seeded into every fresh conversation.
pub const GREETING_MESSAGE: &str =
    "Hello! I'm your AI assistant powered by Groq. How can I help you today?";

/// Speaker of a persisted message. System prompts live in settings, never in history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// Throughput and latency figures for one completed reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseStats {
    pub tokens_per_second: f64,
    /// Seconds from request start to the first fragment.
    pub time_to_first_token: f64,
    /// Seconds from request start to stream exhaustion.
    pub total_time: f64,
    pub total_tokens: u64,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: String,
    /// Base64 image payloads (optionally `data:` URLs), in attachment order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<ResponseStats>,
}

impl Message {
    pub fn new(id: MessageId, role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id,
            role,
            content: content.into(),
            timestamp: current_timestamp(),
            images: Vec::new(),
            stats: None,
        }
    }

    pub fn user(id: MessageId, content: impl Into<String>, images: Vec<String>) -> Self {
        Self {
            images,
            ..Self::new(id, MessageRole::User, content)
        }
    }

    pub fn assistant(id: MessageId, content: impl Into<String>) -> Self {
        Self::new(id, MessageRole::Assistant, content)
    }

    /// Empty assistant message that a stream fills in place.
    pub fn assistant_placeholder(id: MessageId) -> Self {
        Self::assistant(id, String::new())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub title: String,
    /// Creation time, RFC 3339 in UTC.
    pub timestamp: String,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn new(id: ConversationId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            timestamp: current_timestamp(),
            messages: Vec::new(),
        }
    }

    /// Fresh conversation seeded with the assistant greeting.
    pub fn with_greeting(id: ConversationId, title: impl Into<String>) -> Self {
        let mut conversation = Self::new(id, title);
        conversation
            .messages
            .push(Message::assistant(MessageId::generate(), GREETING_MESSAGE));
        conversation
    }

    pub fn message(&self, message_id: &MessageId) -> Option<&Message> {
        self.messages
            .iter()
            .find(|message| &message.id == message_id)
    }

    pub fn message_mut(&mut self, message_id: &MessageId) -> Option<&mut Message> {
        self.messages
            .iter_mut()
            .find(|message| &message.id == message_id)
    }

    pub fn contains_message(&self, message_id: &MessageId) -> bool {
        self.message(message_id).is_some()
    }
}

/// Current UTC time as fixed-width RFC 3339, so timestamps order lexicographically.
pub fn current_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
