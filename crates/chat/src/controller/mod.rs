use std::sync::Arc;

use parley_llm::{
    ModelRouter, Provider, ProviderError, ProviderStreamHandle, StreamEvent, StreamRequest,
};
use parley_storage::{ConversationId, Message, MessageId, ResponseStats, SettingsStore};
use snafu::{OptionExt, ResultExt, Snafu};
use tokio_util::sync::CancellationToken;

use crate::config::ChatConfigStore;
use crate::events::Notification;
use crate::settings::SYSTEM_PROMPT_KEY;
use crate::stream_state::{StreamPhase, StreamTransition};

mod request;
mod stats;

pub use request::{IMAGE_ONLY_PROMPT, build_turns};
pub use stats::approximate_tokens;
use stats::StreamTiming;

/// Shown instead of an empty error message.
pub const GENERIC_FAILURE_MESSAGE: &str =
    "Sorry, I encountered an error while processing your request. Please try again.";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum GenerationError {
    #[snafu(display("Unknown model: {model_id}"))]
    UnknownModel {
        stage: &'static str,
        model_id: String,
    },
    #[snafu(display(
        "{} API key not configured. Set it in settings or export {}.",
        provider.display_name(),
        provider.env_var()
    ))]
    MissingCredential {
        stage: &'static str,
        provider: Provider,
    },
    #[snafu(display("{source}"))]
    Client {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("{message}"))]
    Stream {
        stage: &'static str,
        message: String,
    },
}

/// Everything one generation needs, captured when the user turn was appended.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub conversation_id: ConversationId,
    pub assistant_message_id: MessageId,
    pub model_id: String,
    pub user_text: String,
    /// Messages before the new user turn.
    pub history: Vec<Message>,
    pub user_message: Message,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    Completed(ResponseStats),
    Failed(String),
    Cancelled,
}

/// Mutation channel scoped to one assistant message.
pub trait StreamSink: Send + Sync {
    fn phase_changed(&self, phase: StreamPhase);
    /// Replaces the message content with the full accumulated text.
    fn commit_content(&self, content: String);
    fn attach_stats(&self, stats: ResponseStats);
    fn notify(&self, notification: Notification);
    /// Clears the streaming marker. Called exactly once, after everything else.
    fn finish(&self);
}

struct FinishGuard<'a> {
    sink: &'a dyn StreamSink,
}

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        self.sink.finish();
    }
}

struct PhaseTracker<'a> {
    phase: StreamPhase,
    sink: &'a dyn StreamSink,
}

impl PhaseTracker<'_> {
    fn apply(&mut self, transition: StreamTransition) {
        match self.phase.apply(transition) {
            Ok(next) if next != self.phase => {
                self.phase = next;
                self.sink.phase_changed(next);
            }
            Ok(_) => {}
            Err(rejection) => {
                tracing::debug!(phase = ?self.phase, ?rejection, "ignored stream transition");
            }
        }
    }
}

enum StreamEnd {
    Exhausted,
    Cancelled,
}

/// Turns one user submission into a streamed assistant reply.
#[derive(Clone)]
pub struct StreamingController {
    router: ModelRouter,
    settings: Arc<dyn SettingsStore>,
    config: ChatConfigStore,
}

impl StreamingController {
    pub fn new(
        router: ModelRouter,
        settings: Arc<dyn SettingsStore>,
        config: ChatConfigStore,
    ) -> Self {
        Self {
            router,
            settings,
            config,
        }
    }

    pub fn router(&self) -> &ModelRouter {
        &self.router
    }

    /// Runs one request to a terminal state. `sink.finish()` runs last even if this
    /// future is dropped mid-stream.
    pub async fn generate(
        &self,
        request: GenerationRequest,
        sink: &dyn StreamSink,
        cancel: CancellationToken,
    ) -> GenerationOutcome {
        let _finish = FinishGuard { sink };
        let mut phase = PhaseTracker {
            phase: StreamPhase::Idle,
            sink,
        };
        phase.apply(StreamTransition::Begin);
        let mut timing = StreamTiming::start();

        match self
            .stream_reply(&request, sink, &cancel, &mut phase, &mut timing)
            .await
        {
            Ok(StreamEnd::Exhausted) => {
                let stats = timing.finish(&request.model_id);
                sink.attach_stats(stats.clone());
                phase.apply(StreamTransition::Complete);
                tracing::info!(
                    conversation_id = %request.conversation_id,
                    model_id = %request.model_id,
                    total_tokens = stats.total_tokens,
                    total_time = stats.total_time,
                    "generation completed"
                );
                GenerationOutcome::Completed(stats)
            }
            Ok(StreamEnd::Cancelled) => {
                phase.apply(StreamTransition::Cancel);
                tracing::info!(
                    conversation_id = %request.conversation_id,
                    model_id = %request.model_id,
                    "generation cancelled"
                );
                GenerationOutcome::Cancelled
            }
            Err(error) => {
                let message = error.to_string();
                tracing::error!(
                    conversation_id = %request.conversation_id,
                    model_id = %request.model_id,
                    error = %message,
                    "generation failed"
                );
                sink.commit_content(failure_content(&message));
                sink.notify(Notification::error(
                    "Error",
                    if message.is_empty() {
                        "Failed to generate response"
                    } else {
                        message.as_str()
                    },
                ));
                phase.apply(StreamTransition::Fail);
                GenerationOutcome::Failed(message)
            }
        }
    }

    async fn stream_reply(
        &self,
        request: &GenerationRequest,
        sink: &dyn StreamSink,
        cancel: &CancellationToken,
        phase: &mut PhaseTracker<'_>,
        timing: &mut StreamTiming,
    ) -> Result<StreamEnd, GenerationError> {
        let system_prompt = self.read_setting(SYSTEM_PROMPT_KEY).await;
        let turns = build_turns(
            system_prompt.as_deref(),
            &request.history,
            &request.user_text,
            &request.user_message,
        );

        let provider = self
            .router
            .get_provider(&request.model_id)
            .context(UnknownModelSnafu {
                stage: "resolve-provider",
                model_id: request.model_id.clone(),
            })?;
        let credential = self
            .resolve_credential(provider)
            .await
            .context(MissingCredentialSnafu {
                stage: "resolve-credential",
                provider,
            })?;
        let client = self
            .router
            .build_client(provider, &credential)
            .context(ClientSnafu {
                stage: "build-client",
            })?;

        if cancel.is_cancelled() {
            return Ok(StreamEnd::Cancelled);
        }

        let config = self.config.current();
        let stream_request = StreamRequest::new(request.model_id.clone(), turns)
            .with_temperature(config.temperature)
            .with_max_tokens(config.max_tokens);
        let ProviderStreamHandle { mut stream, worker } = client
            .stream_chat(stream_request)
            .context(ClientSnafu {
                stage: "stream-chat",
            })?;
        tokio::spawn(worker);
        phase.apply(StreamTransition::RequestOpened);

        let mut content = String::new();
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    stream.cancel();
                    return Ok(StreamEnd::Cancelled);
                }
                event = stream.recv() => event,
            };

            match event {
                Some(StreamEvent::Delta(fragment)) => {
                    timing.record_fragment(&fragment);
                    content.push_str(&fragment);
                    phase.apply(StreamTransition::FragmentReceived);
                    sink.commit_content(content.clone());
                }
                Some(StreamEvent::Done) => return Ok(StreamEnd::Exhausted),
                Some(StreamEvent::Error(message)) => {
                    return StreamSnafu {
                        stage: "stream-event",
                        message,
                    }
                    .fail();
                }
                None => {
                    return StreamSnafu {
                        stage: "stream-closed",
                        message: "provider stream closed before completion",
                    }
                    .fail();
                }
            }
        }
    }

    /// Settings override first, then the configured default.
    async fn resolve_credential(&self, provider: Provider) -> Option<String> {
        let override_key = self.read_setting(provider.settings_key()).await;
        provider
            .usable_credential(override_key.as_deref())
            .or_else(|| {
                provider.usable_credential(self.config.current().credential(provider))
            })
    }

    /// Unreadable settings behave like absent ones.
    async fn read_setting(&self, key: &str) -> Option<String> {
        match self.settings.get_setting(key).await {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(key, error = %error, "failed to read setting, using default");
                None
            }
        }
    }
}

fn failure_content(message: &str) -> String {
    if message.trim().is_empty() {
        GENERIC_FAILURE_MESSAGE.to_string()
    } else {
        format!("Error: {message}")
    }
}
