//! Conversation manager actor.
//!
//! One task owns every conversation and applies commands from [`ChatHandle`]s and stream
//! updates from running generations in arrival order. Storage writes go through a FIFO
//! worker so the in-memory state never waits on disk.

use std::sync::Arc;

use parley_llm::RECOMMENDED_MODEL;
use parley_storage::{ConversationId, MessageId, ResponseStats, Storage, StorageResult};
use snafu::OptionExt;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::controller::{StreamSink, StreamingController};
use crate::error::{ChatError, ChatResult, ManagerUnavailableSnafu};
use crate::events::{ChatEvent, Notification};
use crate::settings::SELECTED_MODEL_KEY;
use crate::stream_state::StreamPhase;

mod persistence;
mod state;

use persistence::{PersistJob, PersistenceQueue};
use state::ChatState;
pub use state::{ChatSnapshot, StreamingMarker};

const EVENT_CAPACITY: usize = 256;

enum StreamUpdate {
    Phase(StreamPhase),
    Content(String),
    Stats(ResponseStats),
    Notify(Notification),
    Finished,
}

enum Command {
    Snapshot(oneshot::Sender<ChatSnapshot>),
    SelectConversation {
        conversation_id: ConversationId,
        reply: oneshot::Sender<ChatResult<()>>,
    },
    NewConversation(oneshot::Sender<ConversationId>),
    DeleteConversation {
        conversation_id: ConversationId,
        reply: oneshot::Sender<ChatResult<()>>,
    },
    ClearAll(oneshot::Sender<()>),
    SendMessage {
        text: String,
        images: Vec<String>,
        reply: oneshot::Sender<ChatResult<MessageId>>,
    },
    StopGeneration(oneshot::Sender<bool>),
    SelectModel {
        model_id: String,
        reply: oneshot::Sender<ChatResult<()>>,
    },
    SaveSetting {
        key: String,
        value: String,
        reply: oneshot::Sender<()>,
    },
    Flush(oneshot::Sender<()>),
    Stream {
        conversation_id: ConversationId,
        message_id: MessageId,
        update: StreamUpdate,
    },
}

/// Loads stored state and spawns the manager.
///
/// The returned receiver is subscribed before loading so it also sees start-up notifications.
pub async fn start(
    store: Arc<dyn Storage>,
    controller: StreamingController,
) -> (ChatHandle, broadcast::Receiver<ChatEvent>) {
    let (events, receiver) = broadcast::channel(EVENT_CAPACITY);
    let persistence = PersistenceQueue::spawn(store.clone(), events.clone());

    let state = match load_state(store.as_ref()).await {
        Ok((state, seeded)) => {
            if seeded {
                for conversation in state.conversations() {
                    persistence.submit(PersistJob::Save(conversation.clone()));
                }
            }
            state
        }
        Err(error) => {
            tracing::error!(error = %error, "failed to load saved conversations");
            let _ = events.send(ChatEvent::Notify(Notification::error(
                "Initialization Error",
                "Failed to load saved data. Starting fresh.",
            )));
            ChatState::fresh(RECOMMENDED_MODEL)
        }
    };

    let (commands, command_rx) = mpsc::unbounded_channel();
    let actor = ChatActor {
        state,
        controller,
        persistence,
        events: events.clone(),
        commands: commands.downgrade(),
    };
    tokio::spawn(actor.run(command_rx));

    (ChatHandle { commands, events }, receiver)
}

/// Returns the loaded state and whether it had to be seeded with a fresh conversation.
async fn load_state(store: &dyn Storage) -> StorageResult<(ChatState, bool)> {
    store.init().await?;
    let conversations = store.list_conversations().await?;
    let selected_model = store
        .get_setting(SELECTED_MODEL_KEY)
        .await?
        .filter(|model_id| !model_id.trim().is_empty())
        .unwrap_or_else(|| RECOMMENDED_MODEL.to_string());

    tracing::info!(
        conversations = conversations.len(),
        selected_model = %selected_model,
        "loaded saved conversations"
    );
    let seeded = conversations.is_empty();
    Ok((ChatState::from_loaded(conversations, selected_model), seeded))
}

/// Cheap handle to the manager task.
#[derive(Clone)]
pub struct ChatHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ChatEvent>,
}

impl ChatHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> ChatResult<ChatSnapshot> {
        self.request("snapshot", Command::Snapshot).await
    }

    pub async fn select_conversation(&self, conversation_id: ConversationId) -> ChatResult<()> {
        self.request("select-conversation", |reply| Command::SelectConversation {
            conversation_id,
            reply,
        })
        .await?
    }

    /// Creates, activates, and returns the id of a new conversation.
    pub async fn new_conversation(&self) -> ChatResult<ConversationId> {
        self.request("new-conversation", Command::NewConversation)
            .await
    }

    pub async fn delete_conversation(&self, conversation_id: ConversationId) -> ChatResult<()> {
        self.request("delete-conversation", |reply| Command::DeleteConversation {
            conversation_id,
            reply,
        })
        .await?
    }

    /// Deletes everything and starts over with one fresh conversation.
    pub async fn clear_all(&self) -> ChatResult<()> {
        self.request("clear-all", Command::ClearAll).await
    }

    /// Appends the user turn to the active conversation and starts streaming the reply.
    /// Returns the id of the assistant message being streamed.
    pub async fn send_message(
        &self,
        text: impl Into<String>,
        images: Vec<String>,
    ) -> ChatResult<MessageId> {
        let text = text.into();
        self.request("send-message", |reply| Command::SendMessage {
            text,
            images,
            reply,
        })
        .await?
    }

    /// Cancels the active conversation's generation. Returns whether one was running.
    pub async fn stop_generation(&self) -> ChatResult<bool> {
        self.request("stop-generation", Command::StopGeneration)
            .await
    }

    pub async fn select_model(&self, model_id: impl Into<String>) -> ChatResult<()> {
        let model_id = model_id.into();
        self.request("select-model", |reply| Command::SelectModel { model_id, reply })
            .await?
    }

    /// Resolves once the value is in the store, so a following `send_message` reads it.
    pub async fn save_setting(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> ChatResult<()> {
        let (key, value) = (key.into(), value.into());
        self.request("save-setting", |reply| Command::SaveSetting { key, value, reply })
            .await
    }

    /// Waits until every storage write queued so far has been applied.
    pub async fn flush(&self) -> ChatResult<()> {
        self.request("flush", Command::Flush).await
    }

    async fn request<T>(
        &self,
        stage: &'static str,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> ChatResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .ok()
            .context(ManagerUnavailableSnafu { stage })?;
        response.await.ok().context(ManagerUnavailableSnafu { stage })
    }
}

/// Forwards one generation's updates into the manager queue.
struct ActorSink {
    commands: mpsc::UnboundedSender<Command>,
    conversation_id: ConversationId,
    message_id: MessageId,
}

impl ActorSink {
    fn send(&self, update: StreamUpdate) {
        let _ = self.commands.send(Command::Stream {
            conversation_id: self.conversation_id.clone(),
            message_id: self.message_id.clone(),
            update,
        });
    }
}

impl StreamSink for ActorSink {
    fn phase_changed(&self, phase: StreamPhase) {
        self.send(StreamUpdate::Phase(phase));
    }

    fn commit_content(&self, content: String) {
        self.send(StreamUpdate::Content(content));
    }

    fn attach_stats(&self, stats: ResponseStats) {
        self.send(StreamUpdate::Stats(stats));
    }

    fn notify(&self, notification: Notification) {
        self.send(StreamUpdate::Notify(notification));
    }

    fn finish(&self) {
        self.send(StreamUpdate::Finished);
    }
}

struct ChatActor {
    state: ChatState,
    controller: StreamingController,
    persistence: PersistenceQueue,
    events: broadcast::Sender<ChatEvent>,
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl ChatActor {
    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = receiver.recv().await {
            self.handle(command);
        }
        tracing::debug!("conversation manager stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Snapshot(reply) => {
                let _ = reply.send(self.state.snapshot());
            }
            Command::SelectConversation {
                conversation_id,
                reply,
            } => {
                let _ = reply.send(self.select_conversation(conversation_id));
            }
            Command::NewConversation(reply) => {
                let _ = reply.send(self.new_conversation());
            }
            Command::DeleteConversation {
                conversation_id,
                reply,
            } => {
                let _ = reply.send(self.delete_conversation(&conversation_id));
            }
            Command::ClearAll(reply) => {
                self.clear_all();
                let _ = reply.send(());
            }
            Command::SendMessage {
                text,
                images,
                reply,
            } => {
                let _ = reply.send(self.send_message(text, images));
            }
            Command::StopGeneration(reply) => {
                let _ = reply.send(self.state.stop_active());
            }
            Command::SelectModel { model_id, reply } => {
                let _ = reply.send(self.select_model(&model_id));
            }
            Command::SaveSetting { key, value, reply } => {
                self.persistence.submit(PersistJob::SaveSetting {
                    key,
                    value,
                    done: Some(reply),
                });
            }
            Command::Flush(reply) => self.persistence.submit(PersistJob::Flush(reply)),
            Command::Stream {
                conversation_id,
                message_id,
                update,
            } => self.apply_stream_update(conversation_id, message_id, update),
        }
    }

    fn emit(&self, event: ChatEvent) {
        let _ = self.events.send(event);
    }

    fn notify(&self, notification: Notification) {
        self.emit(ChatEvent::Notify(notification));
    }

    fn select_conversation(&mut self, conversation_id: ConversationId) -> ChatResult<()> {
        if self.state.select(&conversation_id)? {
            self.emit(ChatEvent::ActiveConversationChanged { conversation_id });
        }
        Ok(())
    }

    fn new_conversation(&mut self) -> ConversationId {
        let conversation = self.state.create_conversation();
        let conversation_id = conversation.id.clone();
        self.persistence.submit(PersistJob::Save(conversation));
        self.emit(ChatEvent::ConversationsChanged);
        self.emit(ChatEvent::ActiveConversationChanged {
            conversation_id: conversation_id.clone(),
        });
        conversation_id
    }

    fn delete_conversation(&mut self, conversation_id: &ConversationId) -> ChatResult<()> {
        let outcome = match self.state.delete(conversation_id) {
            Ok(outcome) => outcome,
            Err(error) => {
                if matches!(error, ChatError::LastConversation { .. }) {
                    self.notify(Notification::error("Cannot delete", error.to_string()));
                }
                return Err(error);
            }
        };

        if outcome.cancelled_generation {
            tracing::info!(conversation_id = %conversation_id, "cancelled generation of deleted conversation");
        }
        self.persistence
            .submit(PersistJob::Delete(conversation_id.clone()));
        self.emit(ChatEvent::ConversationsChanged);
        if let Some(conversation_id) = outcome.new_active {
            self.emit(ChatEvent::ActiveConversationChanged { conversation_id });
        }
        Ok(())
    }

    fn clear_all(&mut self) {
        let fresh = self.state.reset();
        let conversation_id = fresh.id.clone();
        self.persistence.submit(PersistJob::ClearAll {
            cleared: Notification::info(
                "All chats cleared",
                "All conversations have been deleted.",
            ),
        });
        self.persistence.submit(PersistJob::Save(fresh));

        self.emit(ChatEvent::ConversationsChanged);
        self.emit(ChatEvent::ActiveConversationChanged { conversation_id });
    }

    fn select_model(&mut self, model_id: &str) -> ChatResult<()> {
        if !self.state.set_model(model_id)? {
            return Ok(());
        }

        let model_id = self.state.selected_model().to_string();
        self.persistence.submit(PersistJob::SaveSetting {
            key: SELECTED_MODEL_KEY.to_string(),
            value: model_id.clone(),
            done: None,
        });

        if self.controller.router().model(&model_id).is_none() {
            tracing::warn!(model_id = %model_id, "selected model is not in the catalog");
        }
        let description = format!("Switched to {model_id}");
        self.emit(ChatEvent::ModelChanged { model_id });
        self.notify(Notification::info("Model changed", description));
        Ok(())
    }

    fn send_message(&mut self, text: String, images: Vec<String>) -> ChatResult<MessageId> {
        let pending = self.state.begin_generation(text, images)?;
        let conversation_id = pending.request.conversation_id.clone();
        let message_id = pending.request.assistant_message_id.clone();

        self.persistence
            .submit(PersistJob::Save(pending.conversation.clone()));
        self.emit(ChatEvent::MessageUpdated {
            conversation_id: conversation_id.clone(),
            message_id: pending.request.user_message.id.clone(),
        });
        self.emit(ChatEvent::MessageUpdated {
            conversation_id: conversation_id.clone(),
            message_id: message_id.clone(),
        });

        let Some(commands) = self.commands.upgrade() else {
            self.state.finish_generation(&conversation_id, &message_id);
            return ManagerUnavailableSnafu {
                stage: "spawn-generation",
            }
            .fail();
        };

        tracing::info!(
            conversation_id = %conversation_id,
            model_id = %pending.request.model_id,
            images = pending.request.user_message.images.len(),
            "starting generation"
        );
        let sink = ActorSink {
            commands,
            conversation_id,
            message_id: message_id.clone(),
        };
        let controller = self.controller.clone();
        tokio::spawn(async move {
            controller
                .generate(pending.request, &sink, pending.cancel)
                .await;
        });

        Ok(message_id)
    }

    fn apply_stream_update(
        &mut self,
        conversation_id: ConversationId,
        message_id: MessageId,
        update: StreamUpdate,
    ) {
        match update {
            StreamUpdate::Phase(phase) => {
                if self.state.apply_phase(&conversation_id, &message_id, phase) {
                    self.emit(ChatEvent::StreamPhaseChanged {
                        conversation_id,
                        message_id,
                        phase,
                    });
                }
            }
            StreamUpdate::Content(content) => {
                if self
                    .state
                    .commit_content(&conversation_id, &message_id, content)
                {
                    self.emit(ChatEvent::MessageUpdated {
                        conversation_id,
                        message_id,
                    });
                }
            }
            StreamUpdate::Stats(stats) => {
                if self.state.attach_stats(&conversation_id, &message_id, stats) {
                    self.emit(ChatEvent::MessageUpdated {
                        conversation_id,
                        message_id,
                    });
                }
            }
            StreamUpdate::Notify(notification) => self.notify(notification),
            StreamUpdate::Finished => {
                let Some(conversation) = self
                    .state
                    .finish_generation(&conversation_id, &message_id)
                else {
                    tracing::debug!(conversation_id = %conversation_id, "dropped finish for stale generation");
                    return;
                };
                self.persistence.submit(PersistJob::Save(conversation));
                self.emit(ChatEvent::StreamFinished {
                    conversation_id,
                    message_id,
                });
            }
        }
    }
}

impl std::fmt::Debug for ChatHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatHandle")
            .field("closed", &self.commands.is_closed())
            .finish()
    }
}
