use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

use super::model::Provider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
    Text { text: String },
    /// Base64 payload, optionally wrapped as a `data:` URL.
    Image { image: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TurnContent {
    Text(String),
    Multimodal(Vec<ContentPart>),
}

impl TurnContent {
    /// Concatenated text parts; images are dropped.
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Multimodal(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn image_count(&self) -> usize {
        match self {
            Self::Text(_) => 0,
            Self::Multimodal(parts) => parts
                .iter()
                .filter(|part| matches!(part, ContentPart::Image { .. }))
                .count(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: TurnContent,
}

impl Turn {
    pub fn new(role: Role, content: TurnContent) -> Self {
        Self { role, content }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, TurnContent::Text(text.into()))
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, TurnContent::Text(text.into()))
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, TurnContent::Text(text.into()))
    }

    /// User turn with a leading text part followed by one image part per image.
    pub fn user_with_images(text: impl Into<String>, images: &[String]) -> Self {
        let mut parts = Vec::with_capacity(images.len() + 1);
        parts.push(ContentPart::Text { text: text.into() });
        parts.extend(images.iter().map(|image| ContentPart::Image {
            image: image.clone(),
        }));
        Self::new(Role::User, TurnContent::Multimodal(parts))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub model_id: String,
    pub turns: Vec<Turn>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl StreamRequest {
    pub fn new(model_id: impl Into<String>, turns: Vec<Turn>) -> Self {
        Self {
            model_id: model_id.into(),
            turns,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Delta(String),
    Done,
    Error(String),
}

pub type ProviderWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("missing API key for provider '{provider}'"))]
    MissingApiKey {
        stage: &'static str,
        provider: Provider,
    },
    #[snafu(display("stream request for model '{model_id}' has no messages"))]
    EmptyMessageSet {
        stage: &'static str,
        model_id: String,
    },
    #[snafu(display("turn for model '{model_id}' has no content parts"))]
    EmptyTurnContent {
        stage: &'static str,
        model_id: String,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
    #[snafu(display("provider '{provider}' rejected the client: {reason}"))]
    ClientRejected {
        stage: &'static str,
        provider: Provider,
        reason: String,
    },
}

/// Receiving half of a provider stream. Dropping it cancels the worker.
pub struct ProviderEventStream {
    events: mpsc::UnboundedReceiver<StreamEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct ProviderStreamHandle {
    pub stream: ProviderEventStream,
    pub worker: ProviderWorker,
}

impl ProviderEventStream {
    pub(crate) fn new(
        events: mpsc::UnboundedReceiver<StreamEvent>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for ProviderEventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// A credentialed connection to one provider.
pub trait ModelClient: Send + Sync {
    fn provider(&self) -> Provider;
    /// Returns immediately; the provider I/O runs when the caller polls `worker`.
    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle>;
}

pub(crate) fn make_event_stream() -> (
    mpsc::UnboundedSender<StreamEvent>,
    ProviderEventStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        ProviderEventStream::new(event_rx, cancel_tx),
        cancel_rx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multimodal_turn_serializes_to_tagged_parts() {
        let turn = Turn::user_with_images(
            "What is this?",
            &["aGVsbG8=".to_string(), "d29ybGQ=".to_string()],
        );

        let value = serde_json::to_value(&turn).unwrap();

        assert_eq!(value["role"], "user");
        assert_eq!(value["content"][0]["type"], "text");
        assert_eq!(value["content"][0]["text"], "What is this?");
        assert_eq!(value["content"][1]["type"], "image");
        assert_eq!(value["content"][2]["image"], "d29ybGQ=");
        assert_eq!(turn.content.image_count(), 2);
    }

    #[test]
    fn text_turn_serializes_as_plain_string() {
        let value = serde_json::to_value(Turn::system("Be brief.")).unwrap();

        assert_eq!(value["role"], "system");
        assert_eq!(value["content"], "Be brief.");
    }

    #[tokio::test]
    async fn dropping_event_stream_signals_cancel() {
        let (_event_tx, stream, mut cancel_rx) = make_event_stream();

        drop(stream);

        assert!(cancel_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn cancel_fires_once() {
        let (_event_tx, mut stream, _cancel_rx) = make_event_stream();

        assert!(stream.cancel());
        assert!(!stream.cancel());
    }
}
