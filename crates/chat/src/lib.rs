#![deny(unsafe_code)]

//! Conversation-streaming core of the Parley chat client.

use std::sync::Arc;

use parley_storage::{SettingsStore, SqliteStorage, StorageResult};
use tokio::sync::broadcast;

pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod manager;
pub mod settings;
pub mod stream_state;

pub use config::{ChatConfig, ChatConfigStore, ConfigError};
pub use controller::{
    GenerationError, GenerationOutcome, GenerationRequest, StreamSink, StreamingController,
};
pub use error::{ChatError, ChatResult};
pub use events::{ChatEvent, Notification, NotificationLevel};
pub use manager::{ChatHandle, ChatSnapshot, StreamingMarker, start};
pub use stream_state::{StreamPhase, StreamTransition, StreamTransitionRejection};

/// Opens the configured SQLite database and starts a manager that talks to real providers.
pub async fn launch(
    config: ChatConfigStore,
) -> StorageResult<(ChatHandle, broadcast::Receiver<ChatEvent>)> {
    let database_location = config.current().database_location();
    let storage = SqliteStorage::open(&database_location.to_string_lossy()).await?;
    let settings: Arc<dyn SettingsStore> = Arc::new(storage.clone());
    let controller = StreamingController::new(parley_llm::create_router(), settings, config);

    Ok(start(Arc::new(storage), controller).await)
}
