use parley_storage::{ConversationId, MessageId};

use crate::stream_state::StreamPhase;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLevel {
    Info,
    Error,
}

/// User-facing toast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub description: String,
    pub level: NotificationLevel,
}

impl Notification {
    pub fn info(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            level: NotificationLevel::Info,
        }
    }

    pub fn error(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            level: NotificationLevel::Error,
        }
    }

    pub fn is_error(&self) -> bool {
        self.level == NotificationLevel::Error
    }
}

/// Broadcast by the conversation manager after its state changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// A conversation was added, removed, or the whole set was replaced.
    ConversationsChanged,
    ActiveConversationChanged {
        conversation_id: ConversationId,
    },
    /// Content or stats of one message changed.
    MessageUpdated {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    StreamPhaseChanged {
        conversation_id: ConversationId,
        message_id: MessageId,
        phase: StreamPhase,
    },
    /// The streaming marker for this message was cleared.
    StreamFinished {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    ModelChanged {
        model_id: String,
    },
    Notify(Notification),
}
