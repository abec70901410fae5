use std::sync::Arc;

use parley_storage::{Conversation, ConversationId, Storage};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::events::{ChatEvent, Notification};

pub(crate) enum PersistJob {
    Save(Conversation),
    Delete(ConversationId),
    /// `cleared` is broadcast only once the store has been emptied.
    ClearAll { cleared: Notification },
    SaveSetting {
        key: String,
        value: String,
        /// Resolves after the write, whether or not it succeeded.
        done: Option<oneshot::Sender<()>>,
    },
    /// Resolves once every job queued before it has run.
    Flush(oneshot::Sender<()>),
}

impl PersistJob {
    fn failure_description(&self) -> &'static str {
        match self {
            Self::Save(_) => "Failed to save conversation.",
            Self::Delete(_) => "Failed to delete conversation.",
            Self::ClearAll { .. } => "Failed to clear conversations.",
            Self::SaveSetting { .. } => "Failed to save setting.",
            Self::Flush(_) => "",
        }
    }
}

/// Applies storage writes one at a time, in submission order.
#[derive(Clone)]
pub(crate) struct PersistenceQueue {
    jobs: mpsc::UnboundedSender<PersistJob>,
}

impl PersistenceQueue {
    pub(crate) fn spawn(store: Arc<dyn Storage>, events: broadcast::Sender<ChatEvent>) -> Self {
        let (jobs, mut receiver) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                run_job(store.as_ref(), &events, job).await;
            }
            tracing::debug!("persistence queue closed");
        });

        Self { jobs }
    }

    pub(crate) fn submit(&self, job: PersistJob) {
        if self.jobs.send(job).is_err() {
            tracing::warn!("persistence worker stopped, dropping job");
        }
    }
}

async fn run_job(store: &dyn Storage, events: &broadcast::Sender<ChatEvent>, job: PersistJob) {
    let result = match &job {
        PersistJob::Save(conversation) => store.save_conversation(conversation).await,
        PersistJob::Delete(conversation_id) => store.delete_conversation(conversation_id).await,
        PersistJob::ClearAll { .. } => store.clear_conversations().await,
        PersistJob::SaveSetting { key, value, .. } => store.save_setting(key, value).await,
        PersistJob::Flush(_) => Ok(()),
    };

    if let Err(error) = &result {
        tracing::warn!(error = %error, "{}", job.failure_description());
        let _ = events.send(ChatEvent::Notify(Notification::error(
            "Storage Error",
            job.failure_description(),
        )));
    }

    match job {
        PersistJob::ClearAll { cleared } if result.is_ok() => {
            let _ = events.send(ChatEvent::Notify(cleared));
        }
        PersistJob::SaveSetting {
            done: Some(done), ..
        }
        | PersistJob::Flush(done) => {
            let _ = done.send(());
        }
        _ => {}
    }
}
