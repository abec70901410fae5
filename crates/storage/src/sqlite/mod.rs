use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use snafu::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};

use super::error::{
    CreateSqliteDirectorySnafu, DecodeColumnSnafu, EncodeColumnSnafu, InvariantViolationSnafu,
    SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu,
    SqliteQuerySnafu, StorageError, StorageResult,
};
use super::ids::{ConversationId, MessageId};
use super::types::{Conversation, Message, MessageRole, ResponseStats};
use super::{BoxFuture, ConversationStore, SettingsStore};

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteStorage {
    /// Connects to (and creates, if missing) the database at `database_location`.
    ///
    /// Schema setup happens in [`ConversationStore::init`].
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // One long-lived connection keeps `:memory:` databases alive across calls.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        tracing::info!(database_url = %database_url, "opened sqlite conversation store");
        Ok(Self { pool, database_url })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn apply_schema(&self) -> StorageResult<()> {
        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&self.pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-init-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;
        sqlx::query("PRAGMA busy_timeout = 5000;")
            .execute(&self.pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-init-pragma-busy-timeout",
                pragma: "busy_timeout",
            })?;

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-init-migrate",
            })?;

        tracing::debug!(database_url = %self.database_url, "sqlite schema is current");
        Ok(())
    }

    async fn load_conversations(&self) -> StorageResult<Vec<Conversation>> {
        let conversation_rows = sqlx::query_as::<_, ConversationRow>(
            "SELECT id, title, timestamp FROM conversations ORDER BY timestamp DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "conversation-list-query",
        })?;

        let message_rows = sqlx::query_as::<_, MessageRow>(
            "SELECT conversation_id, id, role, content, timestamp, images_json, tokens_per_second, time_to_first_token, total_time, total_tokens, stats_model FROM messages ORDER BY conversation_id, seq",
        )
        .fetch_all(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "conversation-list-messages-query",
        })?;

        let mut messages_by_conversation: HashMap<String, Vec<Message>> = HashMap::new();
        for row in message_rows {
            let conversation_id = row.conversation_id.clone();
            messages_by_conversation
                .entry(conversation_id)
                .or_default()
                .push(message_row_to_record(row)?);
        }

        Ok(conversation_rows
            .into_iter()
            .map(|row| {
                let messages = messages_by_conversation.remove(&row.id).unwrap_or_default();
                Conversation {
                    id: ConversationId::new(row.id),
                    title: row.title,
                    timestamp: row.timestamp,
                    messages,
                }
            })
            .collect())
    }

    async fn write_conversation(&self, conversation: &Conversation) -> StorageResult<()> {
        let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
            stage: "conversation-save-begin",
        })?;

        sqlx::query(
            "INSERT INTO conversations (id, title, timestamp) VALUES (?, ?, ?) ON CONFLICT(id) DO UPDATE SET title = excluded.title, timestamp = excluded.timestamp",
        )
        .bind(conversation.id.as_str())
        .bind(conversation.title.as_str())
        .bind(conversation.timestamp.as_str())
        .execute(&mut *tx)
        .await
        .context(SqliteQuerySnafu {
            stage: "conversation-save-upsert",
        })?;

        // Whole-list replacement keeps seq dense and mirrors in-memory ordering exactly.
        sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
            .bind(conversation.id.as_str())
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-save-clear-messages",
            })?;

        for (seq, message) in conversation.messages.iter().enumerate() {
            let images_json = serde_json::to_string(&message.images).context(EncodeColumnSnafu {
                stage: "conversation-save-encode-images",
                field: "images",
                message_id: message.id.to_string(),
            })?;
            let stats = message.stats.as_ref();
            let total_tokens = stats
                .map(|stats| u64_to_i64(stats.total_tokens, "conversation-save-total-tokens"))
                .transpose()?;

            sqlx::query(
                "INSERT INTO messages (conversation_id, seq, id, role, content, timestamp, images_json, tokens_per_second, time_to_first_token, total_time, total_tokens, stats_model) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(conversation.id.as_str())
            .bind(usize_to_i64(seq, "conversation-save-seq")?)
            .bind(message.id.as_str())
            .bind(message.role.as_str())
            .bind(message.content.as_str())
            .bind(message.timestamp.as_str())
            .bind(images_json)
            .bind(stats.map(|stats| stats.tokens_per_second))
            .bind(stats.map(|stats| stats.time_to_first_token))
            .bind(stats.map(|stats| stats.total_time))
            .bind(total_tokens)
            .bind(stats.map(|stats| stats.model.clone()))
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-save-insert-message",
            })?;
        }

        tx.commit().await.context(SqliteQuerySnafu {
            stage: "conversation-save-commit",
        })
    }
}

impl ConversationStore for SqliteStorage {
    fn init(&self) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(self.apply_schema())
    }

    fn list_conversations(&self) -> BoxFuture<'_, StorageResult<Vec<Conversation>>> {
        Box::pin(self.load_conversations())
    }

    fn save_conversation<'a>(
        &'a self,
        conversation: &'a Conversation,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(self.write_conversation(conversation))
    }

    fn delete_conversation<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            sqlx::query("DELETE FROM conversations WHERE id = ?")
                .bind(conversation_id.as_str())
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "conversation-delete",
                })?;
            Ok(())
        })
    }

    fn clear_conversations(&self) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            sqlx::query("DELETE FROM conversations")
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "conversation-clear",
                })?;
            Ok(())
        })
    }
}

impl SettingsStore for SqliteStorage {
    fn get_setting<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<Option<String>>> {
        Box::pin(async move {
            sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "setting-get",
                })
        })
    }

    fn save_setting<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO settings (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "setting-save",
            })?;
            Ok(())
        })
    }
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: String,
    title: String,
    timestamp: String,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    conversation_id: String,
    id: String,
    role: String,
    content: String,
    timestamp: String,
    images_json: String,
    tokens_per_second: Option<f64>,
    time_to_first_token: Option<f64>,
    total_time: Option<f64>,
    total_tokens: Option<i64>,
    stats_model: Option<String>,
}

fn message_row_to_record(row: MessageRow) -> StorageResult<Message> {
    let images = serde_json::from_str::<Vec<String>>(&row.images_json).context(
        DecodeColumnSnafu {
            stage: "message-row-decode-images",
            field: "images",
            message_id: row.id.clone(),
        },
    )?;

    // Stats columns are written together, so a partial row means the table was edited by hand.
    let stats = match (
        row.tokens_per_second,
        row.time_to_first_token,
        row.total_time,
        row.total_tokens,
        row.stats_model,
    ) {
        (Some(tokens_per_second), Some(time_to_first_token), Some(total_time), Some(total_tokens), Some(model)) => {
            Some(ResponseStats {
                tokens_per_second,
                time_to_first_token,
                total_time,
                total_tokens: i64_to_u64(total_tokens, "message-row-total-tokens")?,
                model,
            })
        }
        (None, None, None, None, None) => None,
        _ => {
            return InvariantViolationSnafu {
                stage: "message-row-decode-stats",
                details: format!("message '{}' has partially populated stats", row.id),
            }
            .fail();
        }
    };

    Ok(Message {
        id: MessageId::new(row.id),
        role: role_from_sql(&row.role)?,
        content: row.content,
        timestamp: row.timestamp,
        images,
        stats,
    })
}

fn role_from_sql(raw: &str) -> StorageResult<MessageRole> {
    match raw {
        "user" => Ok(MessageRole::User),
        "assistant" => Ok(MessageRole::Assistant),
        _ => InvariantViolationSnafu {
            stage: "message-role-from-sql",
            details: format!("unknown message role '{raw}'"),
        }
        .fail(),
    }
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn u64_to_i64(value: u64, stage: &'static str) -> StorageResult<i64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("u64 '{value}' cannot map to sqlite i64"),
        })
}

fn usize_to_i64(value: usize, stage: &'static str) -> StorageResult<i64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("usize '{value}' cannot map to sqlite i64"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}
