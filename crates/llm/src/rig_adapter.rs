use std::sync::Arc;

use futures::StreamExt;
use rig::OneOrMany;
use rig::completion::message::{ImageMediaType, MimeType, UserContent};
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::{gemini, groq};
use rig::streaming::{StreamedAssistantContent, StreamingCompletionResponse};
use snafu::{OptionExt, ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use super::model::Provider;
use super::provider::{
    CompletionsFailedSnafu, ContentPart, EmptyMessageSetSnafu, EmptyTurnContentSnafu,
    HttpClientSnafu, ModelClient, ProviderError, ProviderResult, ProviderStreamHandle,
    ProviderWorker, Role, StreamEvent, StreamRequest, Turn, TurnContent, make_event_stream,
};
use super::router::ClientFactory;

#[derive(Debug, Default, Clone, Copy)]
pub struct RigClientFactory;

impl ClientFactory for RigClientFactory {
    fn build(&self, provider: Provider, api_key: &str) -> ProviderResult<Arc<dyn ModelClient>> {
        Ok(Arc::new(RigModelClient::new(provider, api_key)?))
    }
}

enum RigBackend {
    Groq(groq::Client),
    Google(gemini::Client),
}

pub struct RigModelClient {
    provider: Provider,
    backend: RigBackend,
}

impl RigModelClient {
    pub fn new(provider: Provider, api_key: &str) -> ProviderResult<Self> {
        let backend = match provider {
            Provider::Groq => RigBackend::Groq(
                groq::Client::builder()
                    .api_key(api_key)
                    .build()
                    .context(HttpClientSnafu {
                        stage: "build-groq-client",
                    })?,
            ),
            Provider::Google => RigBackend::Google(
                gemini::Client::builder()
                    .api_key(api_key)
                    .build()
                    .context(HttpClientSnafu {
                        stage: "build-gemini-client",
                    })?,
            ),
        };

        Ok(Self { provider, backend })
    }
}

impl ModelClient for RigModelClient {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            !request.turns.is_empty(),
            EmptyMessageSetSnafu {
                stage: "stream-chat",
                model_id: request.model_id.clone(),
            }
        );

        let (event_tx, stream, cancel_rx) = make_event_stream();
        let provider = self.provider;
        let worker: ProviderWorker = match &self.backend {
            RigBackend::Groq(client) => {
                let model = client.completion_model(request.model_id.clone());
                Box::pin(run_stream_worker(model, provider, request, event_tx, cancel_rx))
            }
            RigBackend::Google(client) => {
                let model = client.completion_model(request.model_id.clone());
                Box::pin(run_stream_worker(model, provider, request, event_tx, cancel_rx))
            }
        };

        Ok(ProviderStreamHandle { stream, worker })
    }
}

fn to_rig_message(turn: &Turn, model_id: &str) -> ProviderResult<Option<RigMessage>> {
    let message = match (turn.role, &turn.content) {
        (Role::System, _) => return Ok(None),
        (Role::Assistant, content) => RigMessage::assistant(content.text()),
        (Role::User, TurnContent::Text(text)) => RigMessage::user(text.clone()),
        (Role::User, TurnContent::Multimodal(parts)) => {
            let content = parts.iter().map(to_user_content).collect::<Vec<_>>();
            RigMessage::User {
                content: OneOrMany::many(content).ok().context(EmptyTurnContentSnafu {
                    stage: "to-rig-message",
                    model_id: model_id.to_string(),
                })?,
            }
        }
    };

    Ok(Some(message))
}

fn to_user_content(part: &ContentPart) -> UserContent {
    match part {
        ContentPart::Text { text } => UserContent::text(text.clone()),
        ContentPart::Image { image } => {
            let (media_type, data) = split_image_payload(image);
            UserContent::image_base64(data, media_type, None)
        }
    }
}

/// Separates a `data:` URL into media type and base64 body; bare payloads are sniffed.
fn split_image_payload(image: &str) -> (Option<ImageMediaType>, String) {
    if let Some(rest) = image.strip_prefix("data:")
        && let Some((header, data)) = rest.split_once(',')
    {
        let mime = header.split(';').next().unwrap_or_default();
        return (ImageMediaType::from_mime_type(mime), data.to_string());
    }

    (sniff_media_type(image), image.to_string())
}

fn sniff_media_type(base64: &str) -> Option<ImageMediaType> {
    // Base64 encodings of each format's magic bytes.
    if base64.starts_with("iVBORw0KGgo") {
        Some(ImageMediaType::PNG)
    } else if base64.starts_with("/9j/") {
        Some(ImageMediaType::JPEG)
    } else if base64.starts_with("R0lGOD") {
        Some(ImageMediaType::GIF)
    } else if base64.starts_with("UklGR") {
        Some(ImageMediaType::WEBP)
    } else {
        None
    }
}

/// Rig takes a single preamble, so system turns are folded into it.
fn merged_preamble(request: &StreamRequest) -> Option<String> {
    let preamble_parts = request
        .turns
        .iter()
        .filter(|turn| turn.role == Role::System)
        .map(|turn| turn.content.text())
        .filter(|text| !text.trim().is_empty())
        .collect::<Vec<_>>();

    if preamble_parts.is_empty() {
        None
    } else {
        Some(preamble_parts.join("\n\n"))
    }
}

async fn open_stream<M>(
    model: &M,
    request: &StreamRequest,
) -> ProviderResult<StreamingCompletionResponse<M::StreamingResponse>>
where
    M: CompletionModel,
{
    let mut messages = request
        .turns
        .iter()
        .filter_map(|turn| to_rig_message(turn, &request.model_id).transpose())
        .collect::<ProviderResult<Vec<_>>>()?;

    let Some(prompt) = messages.pop() else {
        tracing::warn!(
            model_id = %request.model_id,
            turn_count = request.turns.len(),
            "cannot open stream because no user/assistant turns remain after filtering"
        );
        return EmptyMessageSetSnafu {
            stage: "open-stream-pop-prompt",
            model_id: request.model_id.clone(),
        }
        .fail();
    };
    let mut builder = model.completion_request(prompt).messages(messages);

    if let Some(preamble) = merged_preamble(request) {
        builder = builder.preamble(preamble);
    }

    if let Some(temperature) = request.temperature {
        builder = builder.temperature(temperature);
    }

    if let Some(max_tokens) = request.max_tokens {
        builder = builder.max_tokens(max_tokens);
    }

    builder.stream().await.context(CompletionsFailedSnafu {
        stage: "open-stream",
    })
}

fn map_stream_item<R>(item: StreamedAssistantContent<R>) -> Option<StreamEvent>
where
    R: Clone + Unpin,
{
    match item {
        StreamedAssistantContent::Text(text) if !text.text.is_empty() => {
            Some(StreamEvent::Delta(text.text))
        }
        _ => None,
    }
}

fn emit_error_event(event_tx: &mpsc::UnboundedSender<StreamEvent>, error: ProviderError) {
    let _ = event_tx.send(StreamEvent::Error(error.to_string()));
}

async fn run_stream_worker<M>(
    model: M,
    provider: Provider,
    request: StreamRequest,
    event_tx: mpsc::UnboundedSender<StreamEvent>,
    mut cancel_rx: oneshot::Receiver<()>,
) where
    M: CompletionModel + 'static,
{
    let mut stream = match open_stream(&model, &request).await {
        Ok(stream) => stream,
        Err(error) => {
            tracing::error!(
                provider = %provider,
                model_id = %request.model_id,
                error = %error,
                "failed to open provider stream"
            );
            emit_error_event(&event_tx, error);
            return;
        }
    };

    loop {
        tokio::select! {
            _ = &mut cancel_rx => {
                // Stop provider IO promptly; the consumer already has everything it wants.
                tracing::debug!(provider = %provider, model_id = %request.model_id, "provider stream cancelled");
                stream.cancel();
                return;
            }
            next_item = stream.next() => {
                match next_item {
                    Some(Ok(item)) => {
                        if let Some(event) = map_stream_item(item)
                            && event_tx.send(event).is_err()
                        {
                            return;
                        }
                    }
                    Some(Err(source)) => {
                        tracing::warn!(
                            provider = %provider,
                            model_id = %request.model_id,
                            error = %source,
                            "provider stream emitted an error chunk"
                        );
                        let error = ProviderError::CompletionsFailed {
                            stage: "stream-chunk",
                            source,
                        };
                        emit_error_event(&event_tx, error);
                        return;
                    }
                    None => break,
                }
            }
        }
    }

    let _ = event_tx.send(StreamEvent::Done);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_url_images_keep_their_declared_media_type() {
        let (media_type, data) = split_image_payload("data:image/webp;base64,AAAA");

        assert_eq!(media_type, Some(ImageMediaType::WEBP));
        assert_eq!(data, "AAAA");
    }

    #[test]
    fn bare_base64_images_are_sniffed() {
        assert_eq!(
            split_image_payload("iVBORw0KGgoAAAANSUhEUg").0,
            Some(ImageMediaType::PNG)
        );
        assert_eq!(split_image_payload("/9j/4AAQSkZJRg").0, Some(ImageMediaType::JPEG));
        assert_eq!(split_image_payload("bm90IGFuIGltYWdl").0, None);
    }

    #[test]
    fn system_turns_fold_into_preamble_and_are_not_sent_as_messages() {
        let request = StreamRequest::new(
            "llama-3.3-70b-versatile",
            vec![
                Turn::system("Be brief."),
                Turn::system("   "),
                Turn::user("hello"),
            ],
        );

        assert_eq!(merged_preamble(&request).as_deref(), Some("Be brief."));
        assert!(
            to_rig_message(&request.turns[0], &request.model_id)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn multimodal_user_turn_becomes_one_rig_message_with_all_parts() {
        let turn = Turn::user_with_images(
            "Compare",
            &["data:image/png;base64,AAAA".to_string(), "/9j/BBBB".to_string()],
        );

        let message = to_rig_message(&turn, "gemini-2.0-flash").unwrap().unwrap();

        let RigMessage::User { content } = message else {
            panic!("expected a user message");
        };
        let parts = content.iter().collect::<Vec<_>>();
        assert_eq!(parts.len(), 3);
        assert!(matches!(parts[0], UserContent::Text(text) if text.text == "Compare"));
        assert!(matches!(parts[1], UserContent::Image(_)));
        assert!(matches!(parts[2], UserContent::Image(_)));
    }
}
