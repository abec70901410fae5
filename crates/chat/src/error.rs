use parley_storage::ConversationId;
use snafu::Snafu;

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("You must have at least one conversation."))]
    LastConversation { stage: &'static str },
    #[snafu(display("conversation '{conversation_id}' does not exist"))]
    ConversationNotFound {
        stage: &'static str,
        conversation_id: ConversationId,
    },
    #[snafu(display("no conversation is active"))]
    NoActiveConversation { stage: &'static str },
    #[snafu(display("a reply is still streaming into conversation '{conversation_id}'"))]
    GenerationInFlight {
        stage: &'static str,
        conversation_id: ConversationId,
    },
    #[snafu(display("message has neither text nor images"))]
    EmptySubmission { stage: &'static str },
    #[snafu(display("model id must not be blank"))]
    BlankModelId { stage: &'static str },
    #[snafu(display("conversation manager is no longer running"))]
    ManagerUnavailable { stage: &'static str },
}

pub type ChatResult<T> = Result<T, ChatError>;
