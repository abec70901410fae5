use std::future::Future;
use std::pin::Pin;

pub mod error;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{ConversationId, MessageId};
pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;
pub use types::{
    Conversation, DEFAULT_CONVERSATION_TITLE, GREETING_MESSAGE, Message, MessageRole,
    ResponseStats, current_timestamp,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Durable map of conversation id to conversation.
pub trait ConversationStore: Send + Sync {
    /// Prepares the backend; safe to call more than once.
    fn init(&self) -> BoxFuture<'_, StorageResult<()>>;
    /// All conversations, newest first.
    fn list_conversations(&self) -> BoxFuture<'_, StorageResult<Vec<Conversation>>>;
    /// Inserts or fully replaces one conversation, messages included.
    fn save_conversation<'a>(
        &'a self,
        conversation: &'a Conversation,
    ) -> BoxFuture<'a, StorageResult<()>>;
    fn delete_conversation<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, StorageResult<()>>;
    fn clear_conversations(&self) -> BoxFuture<'_, StorageResult<()>>;
}

/// Flat string settings map.
pub trait SettingsStore: Send + Sync {
    fn get_setting<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<Option<String>>>;
    fn save_setting<'a>(&'a self, key: &'a str, value: &'a str)
    -> BoxFuture<'a, StorageResult<()>>;
}

pub trait Storage: ConversationStore + SettingsStore {}

impl<T> Storage for T where T: ConversationStore + SettingsStore {}
