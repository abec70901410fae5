//! In-process client that replays a fixed script instead of calling a provider.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use super::model::Provider;
use super::provider::{
    ClientRejectedSnafu, ModelClient, ProviderResult, ProviderStreamHandle, ProviderWorker,
    StreamEvent, StreamRequest, make_event_stream,
};
use super::router::ClientFactory;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    Fragment(String),
    Delay(Duration),
    /// Emits a stream error and stops.
    Fail(String),
    /// Waits until the consumer cancels.
    Hang,
    /// Drops the sender without a terminal event.
    Close,
}

#[derive(Debug, Default)]
struct ScriptState {
    steps: Vec<ScriptStep>,
    build_failure: Option<String>,
    requests: Vec<StreamRequest>,
    credentials: Vec<(Provider, String)>,
}

/// Factory whose clients all replay the same script and record what they were asked.
#[derive(Debug, Clone, Default)]
pub struct ScriptedClientFactory {
    state: Arc<Mutex<ScriptState>>,
    cancellations: Arc<AtomicUsize>,
}

impl ScriptedClientFactory {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        let factory = Self::default();
        factory.set_script(steps);
        factory
    }

    pub fn fragments<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            fragments
                .into_iter()
                .map(|fragment| ScriptStep::Fragment(fragment.into()))
                .collect(),
        )
    }

    /// Every `build` call fails with `reason`.
    pub fn rejecting(reason: impl Into<String>) -> Self {
        let factory = Self::default();
        factory.lock().build_failure = Some(reason.into());
        factory
    }

    pub fn set_script(&self, steps: Vec<ScriptStep>) {
        self.lock().steps = steps;
    }

    pub fn requests(&self) -> Vec<StreamRequest> {
        self.lock().requests.clone()
    }

    pub fn credentials(&self) -> Vec<(Provider, String)> {
        self.lock().credentials.clone()
    }

    /// Number of workers stopped by a consumer cancel.
    pub fn cancellations(&self) -> usize {
        self.cancellations.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ClientFactory for ScriptedClientFactory {
    fn build(&self, provider: Provider, api_key: &str) -> ProviderResult<Arc<dyn ModelClient>> {
        let mut state = self.lock();
        state.credentials.push((provider, api_key.to_string()));
        if let Some(reason) = state.build_failure.clone() {
            return ClientRejectedSnafu {
                stage: "scripted-build",
                provider,
                reason,
            }
            .fail();
        }

        Ok(Arc::new(ScriptedClient {
            provider,
            factory: self.clone(),
        }))
    }
}

struct ScriptedClient {
    provider: Provider,
    factory: ScriptedClientFactory,
}

impl ModelClient for ScriptedClient {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        let steps = {
            let mut state = self.factory.lock();
            state.requests.push(request);
            state.steps.clone()
        };

        let (event_tx, stream, cancel_rx) = make_event_stream();
        let worker: ProviderWorker = Box::pin(replay(
            steps,
            event_tx,
            cancel_rx,
            self.factory.cancellations.clone(),
        ));
        Ok(ProviderStreamHandle { stream, worker })
    }
}

async fn replay(
    steps: Vec<ScriptStep>,
    event_tx: mpsc::UnboundedSender<StreamEvent>,
    mut cancel_rx: oneshot::Receiver<()>,
    cancellations: Arc<AtomicUsize>,
) {
    for step in steps {
        let outcome = tokio::select! {
            biased;
            _ = &mut cancel_rx => None,
            outcome = play_step(step, &event_tx) => Some(outcome),
        };

        match outcome {
            None => {
                cancellations.fetch_add(1, Ordering::SeqCst);
                return;
            }
            Some(false) => return,
            Some(true) => {}
        }
    }

    let _ = event_tx.send(StreamEvent::Done);
}

/// Returns whether replay should continue.
async fn play_step(step: ScriptStep, event_tx: &mpsc::UnboundedSender<StreamEvent>) -> bool {
    match step {
        ScriptStep::Fragment(text) => event_tx.send(StreamEvent::Delta(text)).is_ok(),
        ScriptStep::Delay(duration) => {
            tokio::time::sleep(duration).await;
            true
        }
        ScriptStep::Fail(message) => {
            let _ = event_tx.send(StreamEvent::Error(message));
            false
        }
        ScriptStep::Hang => {
            std::future::pending::<()>().await;
            false
        }
        ScriptStep::Close => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Turn;

    async fn collect(handle: ProviderStreamHandle) -> Vec<StreamEvent> {
        let ProviderStreamHandle { mut stream, worker } = handle;
        tokio::spawn(worker);
        let mut events = Vec::new();
        while let Some(event) = stream.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn replays_fragments_then_done() {
        let factory = ScriptedClientFactory::fragments(["Hi", " there"]);
        let client = factory.build(Provider::Groq, "gsk_test").unwrap();

        let events = collect(
            client
                .stream_chat(StreamRequest::new("m", vec![Turn::user("hello")]))
                .unwrap(),
        )
        .await;

        assert_eq!(
            events,
            vec![
                StreamEvent::Delta("Hi".to_string()),
                StreamEvent::Delta(" there".to_string()),
                StreamEvent::Done,
            ]
        );
        assert_eq!(factory.requests().len(), 1);
        assert_eq!(
            factory.credentials(),
            vec![(Provider::Groq, "gsk_test".to_string())]
        );
    }

    #[tokio::test]
    async fn failure_step_ends_stream_without_done() {
        let factory = ScriptedClientFactory::new(vec![
            ScriptStep::Fragment("partial".to_string()),
            ScriptStep::Fail("rate limited".to_string()),
        ]);
        let client = factory.build(Provider::Google, "key").unwrap();

        let events = collect(
            client
                .stream_chat(StreamRequest::new("m", vec![Turn::user("hello")]))
                .unwrap(),
        )
        .await;

        assert_eq!(events.last(), Some(&StreamEvent::Error("rate limited".to_string())));
    }

    #[tokio::test]
    async fn close_step_ends_stream_without_terminal_event() {
        let factory = ScriptedClientFactory::new(vec![
            ScriptStep::Fragment("partial".to_string()),
            ScriptStep::Close,
            ScriptStep::Fragment("unreached".to_string()),
        ]);
        let client = factory.build(Provider::Groq, "key").unwrap();

        let events = collect(
            client
                .stream_chat(StreamRequest::new("m", vec![Turn::user("hello")]))
                .unwrap(),
        )
        .await;

        assert_eq!(events, vec![StreamEvent::Delta("partial".to_string())]);
    }

    #[tokio::test]
    async fn cancelling_a_hung_stream_stops_the_worker() {
        let factory = ScriptedClientFactory::new(vec![ScriptStep::Hang]);
        let client = factory.build(Provider::Groq, "key").unwrap();
        let ProviderStreamHandle { mut stream, worker } = client
            .stream_chat(StreamRequest::new("m", vec![Turn::user("hello")]))
            .unwrap();
        let worker = tokio::spawn(worker);

        assert!(stream.cancel());
        worker.await.unwrap();

        assert_eq!(factory.cancellations(), 1);
    }

    #[test]
    fn rejecting_factory_records_credential_and_fails() {
        let factory = ScriptedClientFactory::rejecting("invalid key");

        assert!(factory.build(Provider::Groq, "bad").is_err());
        assert_eq!(factory.credentials().len(), 1);
    }
}
