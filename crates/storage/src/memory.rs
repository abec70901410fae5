use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::error::{LockPoisonedSnafu, StorageResult};
use super::ids::ConversationId;
use super::types::Conversation;
use super::{BoxFuture, ConversationStore, SettingsStore};

#[derive(Debug, Default)]
struct MemoryState {
    conversations: HashMap<ConversationId, Conversation>,
    settings: HashMap<String, String>,
}

/// Process-local store with the same ordering contract as [`crate::SqliteStorage`].
///
/// Useful for tests and for sessions started without a database path.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self, stage: &'static str) -> StorageResult<MutexGuard<'_, MemoryState>> {
        self.state.lock().map_err(|_| {
            LockPoisonedSnafu {
                stage,
                entity: "memory-storage",
            }
            .build()
        })
    }
}

impl ConversationStore for MemoryStorage {
    fn init(&self) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move { Ok(()) })
    }

    fn list_conversations(&self) -> BoxFuture<'_, StorageResult<Vec<Conversation>>> {
        Box::pin(async move {
            let state = self.lock("memory-list-conversations")?;
            let mut conversations = state.conversations.values().cloned().collect::<Vec<_>>();
            conversations.sort_by(|left, right| {
                right
                    .timestamp
                    .cmp(&left.timestamp)
                    .then_with(|| right.id.cmp(&left.id))
            });
            Ok(conversations)
        })
    }

    fn save_conversation<'a>(
        &'a self,
        conversation: &'a Conversation,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let mut state = self.lock("memory-save-conversation")?;
            state
                .conversations
                .insert(conversation.id.clone(), conversation.clone());
            Ok(())
        })
    }

    fn delete_conversation<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let mut state = self.lock("memory-delete-conversation")?;
            state.conversations.remove(conversation_id);
            Ok(())
        })
    }

    fn clear_conversations(&self) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let mut state = self.lock("memory-clear-conversations")?;
            state.conversations.clear();
            Ok(())
        })
    }
}

impl SettingsStore for MemoryStorage {
    fn get_setting<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<Option<String>>> {
        Box::pin(async move {
            let state = self.lock("memory-get-setting")?;
            Ok(state.settings.get(key).cloned())
        })
    }

    fn save_setting<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let mut state = self.lock("memory-save-setting")?;
            state.settings.insert(key.to_string(), value.to_string());
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::MessageId;
    use crate::types::{Message, ResponseStats};

    fn conversation(id: &str, timestamp: &str) -> Conversation {
        let mut conversation = Conversation::new(ConversationId::new(id), format!("chat {id}"));
        conversation.timestamp = timestamp.to_string();
        conversation
    }

    #[tokio::test]
    async fn saved_conversation_reloads_with_images_and_stats() {
        let storage = MemoryStorage::new();
        let mut saved = conversation("1", "2024-01-01T00:00:00.000Z");
        saved.messages.push(Message::user(
            MessageId::new("u1"),
            "",
            vec!["aGVsbG8=".to_string(), "d29ybGQ=".to_string()],
        ));
        let mut reply = Message::assistant(MessageId::new("a1"), "Hi there");
        reply.stats = Some(ResponseStats {
            tokens_per_second: 3.33,
            time_to_first_token: 0.1,
            total_time: 0.6,
            total_tokens: 2,
            model: "gemini-2.0-flash".to_string(),
        });
        saved.messages.push(reply);

        storage.save_conversation(&saved).await.unwrap();
        let loaded = storage.list_conversations().await.unwrap();

        assert_eq!(loaded, vec![saved]);
    }

    #[tokio::test]
    async fn conversations_list_newest_first() {
        let storage = MemoryStorage::new();
        let older = conversation("1", "2024-01-01T00:00:00.000Z");
        let newer = conversation("2", "2024-02-01T00:00:00.000Z");
        storage.save_conversation(&older).await.unwrap();
        storage.save_conversation(&newer).await.unwrap();

        let ids = storage
            .list_conversations()
            .await
            .unwrap()
            .into_iter()
            .map(|conversation| conversation.id)
            .collect::<Vec<_>>();

        assert_eq!(ids, vec![newer.id, older.id]);
    }

    #[tokio::test]
    async fn clearing_conversations_keeps_settings() {
        let storage = MemoryStorage::new();
        storage
            .save_conversation(&conversation("1", "2024-01-01T00:00:00.000Z"))
            .await
            .unwrap();
        storage
            .save_setting("selectedModel", "gemini-2.0-flash")
            .await
            .unwrap();

        storage.clear_conversations().await.unwrap();

        assert!(storage.list_conversations().await.unwrap().is_empty());
        assert_eq!(
            storage.get_setting("selectedModel").await.unwrap().as_deref(),
            Some("gemini-2.0-flash")
        );
    }
}
