use std::collections::HashMap;

use parley_storage::{
    Conversation, ConversationId, DEFAULT_CONVERSATION_TITLE, Message, MessageId, ResponseStats,
};
use snafu::{OptionExt, ensure};
use tokio_util::sync::CancellationToken;

use crate::controller::GenerationRequest;
use crate::error::{
    BlankModelIdSnafu, ChatResult, ConversationNotFoundSnafu, EmptySubmissionSnafu,
    GenerationInFlightSnafu, LastConversationSnafu, NoActiveConversationSnafu,
};
use crate::stream_state::StreamPhase;

/// A reply currently being streamed into a conversation.
#[derive(Debug, Clone)]
pub(crate) struct GenerationSlot {
    pub(crate) message_id: MessageId,
    pub(crate) cancel: CancellationToken,
    pub(crate) phase: StreamPhase,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingMarker {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub phase: StreamPhase,
}

/// Point-in-time copy of the manager state.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatSnapshot {
    /// Most recently created first.
    pub conversations: Vec<Conversation>,
    pub active_conversation_id: ConversationId,
    pub selected_model: String,
    pub streaming: Vec<StreamingMarker>,
}

impl ChatSnapshot {
    pub fn conversation(&self, conversation_id: &ConversationId) -> Option<&Conversation> {
        self.conversations
            .iter()
            .find(|conversation| &conversation.id == conversation_id)
    }

    pub fn active_conversation(&self) -> Option<&Conversation> {
        self.conversation(&self.active_conversation_id)
    }

    pub fn is_streaming(&self, conversation_id: &ConversationId) -> bool {
        self.streaming
            .iter()
            .any(|marker| &marker.conversation_id == conversation_id)
    }
}

pub(crate) struct PendingGeneration {
    pub(crate) request: GenerationRequest,
    pub(crate) cancel: CancellationToken,
    /// Conversation after the user turn and placeholder were appended.
    pub(crate) conversation: Conversation,
}

pub(crate) struct DeleteOutcome {
    pub(crate) new_active: Option<ConversationId>,
    pub(crate) cancelled_generation: bool,
}

/// Single-writer conversation state. Never holds zero conversations.
#[derive(Debug)]
pub(crate) struct ChatState {
    conversations: Vec<Conversation>,
    active_id: ConversationId,
    selected_model: String,
    generations: HashMap<ConversationId, GenerationSlot>,
}

impl ChatState {
    pub(crate) fn fresh(selected_model: impl Into<String>) -> Self {
        let conversation = fresh_conversation();
        Self {
            active_id: conversation.id.clone(),
            conversations: vec![conversation],
            selected_model: selected_model.into(),
            generations: HashMap::new(),
        }
    }

    /// State over stored conversations, or a fresh one when there are none.
    pub(crate) fn from_loaded(
        conversations: Vec<Conversation>,
        selected_model: impl Into<String>,
    ) -> Self {
        let Some(first) = conversations.first() else {
            return Self::fresh(selected_model);
        };

        Self {
            active_id: first.id.clone(),
            conversations,
            selected_model: selected_model.into(),
            generations: HashMap::new(),
        }
    }

    pub(crate) fn snapshot(&self) -> ChatSnapshot {
        let mut streaming = self
            .generations
            .iter()
            .map(|(conversation_id, slot)| StreamingMarker {
                conversation_id: conversation_id.clone(),
                message_id: slot.message_id.clone(),
                phase: slot.phase,
            })
            .collect::<Vec<_>>();
        streaming.sort_by(|left, right| left.conversation_id.cmp(&right.conversation_id));

        ChatSnapshot {
            conversations: self.conversations.clone(),
            active_conversation_id: self.active_id.clone(),
            selected_model: self.selected_model.clone(),
            streaming,
        }
    }

    pub(crate) fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub(crate) fn active_id(&self) -> &ConversationId {
        &self.active_id
    }

    pub(crate) fn selected_model(&self) -> &str {
        &self.selected_model
    }

    pub(crate) fn conversation(&self, conversation_id: &ConversationId) -> Option<&Conversation> {
        self.conversations
            .iter()
            .find(|conversation| &conversation.id == conversation_id)
    }

    fn conversation_mut(&mut self, conversation_id: &ConversationId) -> Option<&mut Conversation> {
        self.conversations
            .iter_mut()
            .find(|conversation| &conversation.id == conversation_id)
    }

    /// Returns whether the active conversation changed.
    pub(crate) fn select(&mut self, conversation_id: &ConversationId) -> ChatResult<bool> {
        ensure!(
            self.conversation(conversation_id).is_some(),
            ConversationNotFoundSnafu {
                stage: "select-conversation",
                conversation_id: conversation_id.clone(),
            }
        );

        if &self.active_id == conversation_id {
            return Ok(false);
        }
        self.active_id = conversation_id.clone();
        Ok(true)
    }

    /// Prepends a greeted conversation titled after the current count and activates it.
    pub(crate) fn create_conversation(&mut self) -> Conversation {
        let mut id = ConversationId::generate();
        while self.conversation(&id).is_some() {
            id = ConversationId::generate();
        }

        let title = format!("New Chat {}", self.conversations.len() + 1);
        let conversation = Conversation::with_greeting(id, title);
        self.active_id = conversation.id.clone();
        self.conversations.insert(0, conversation.clone());
        conversation
    }

    pub(crate) fn delete(&mut self, conversation_id: &ConversationId) -> ChatResult<DeleteOutcome> {
        let index = self
            .conversations
            .iter()
            .position(|conversation| &conversation.id == conversation_id)
            .context(ConversationNotFoundSnafu {
                stage: "delete-conversation",
                conversation_id: conversation_id.clone(),
            })?;
        ensure!(
            self.conversations.len() > 1,
            LastConversationSnafu {
                stage: "delete-conversation",
            }
        );

        self.conversations.remove(index);
        let cancelled_generation = match self.generations.remove(conversation_id) {
            Some(slot) => {
                slot.cancel.cancel();
                true
            }
            None => false,
        };

        let mut new_active = None;
        if &self.active_id == conversation_id {
            self.active_id = self.conversations[0].id.clone();
            new_active = Some(self.active_id.clone());
        }

        Ok(DeleteOutcome {
            new_active,
            cancelled_generation,
        })
    }

    /// Drops every conversation, cancelling their generations, and starts over with one.
    pub(crate) fn reset(&mut self) -> Conversation {
        for slot in self.generations.drain().map(|(_, slot)| slot) {
            slot.cancel.cancel();
        }

        let conversation = fresh_conversation();
        self.active_id = conversation.id.clone();
        self.conversations = vec![conversation.clone()];
        conversation
    }

    /// Returns whether the model changed.
    pub(crate) fn set_model(&mut self, model_id: &str) -> ChatResult<bool> {
        let model_id = model_id.trim();
        ensure!(
            !model_id.is_empty(),
            BlankModelIdSnafu {
                stage: "select-model",
            }
        );

        if self.selected_model == model_id {
            return Ok(false);
        }
        self.selected_model = model_id.to_string();
        Ok(true)
    }

    /// Appends the user turn and an empty assistant placeholder to the active conversation.
    pub(crate) fn begin_generation(
        &mut self,
        text: String,
        images: Vec<String>,
    ) -> ChatResult<PendingGeneration> {
        ensure!(
            !text.trim().is_empty() || !images.is_empty(),
            EmptySubmissionSnafu {
                stage: "send-message",
            }
        );

        let conversation_id = self.active_id.clone();
        ensure!(
            !self.generations.contains_key(&conversation_id),
            GenerationInFlightSnafu {
                stage: "send-message",
                conversation_id: conversation_id.clone(),
            }
        );

        let model_id = self.selected_model.clone();
        let conversation =
            self.conversation_mut(&conversation_id)
                .context(NoActiveConversationSnafu {
                    stage: "send-message",
                })?;

        let history = conversation.messages.clone();
        let user_message = Message::user(unique_message_id(conversation), text.clone(), images);
        conversation.messages.push(user_message.clone());
        let assistant_message_id = unique_message_id(conversation);
        conversation
            .messages
            .push(Message::assistant_placeholder(assistant_message_id.clone()));
        let conversation = conversation.clone();

        let cancel = CancellationToken::new();
        self.generations.insert(
            conversation_id.clone(),
            GenerationSlot {
                message_id: assistant_message_id.clone(),
                cancel: cancel.clone(),
                phase: StreamPhase::Idle,
            },
        );

        Ok(PendingGeneration {
            request: GenerationRequest {
                conversation_id,
                assistant_message_id,
                model_id,
                user_text: text,
                history,
                user_message,
            },
            cancel,
            conversation,
        })
    }

    /// Cancels the active conversation's generation, if any.
    pub(crate) fn stop_active(&mut self) -> bool {
        match self.generations.get(&self.active_id) {
            Some(slot) => {
                slot.cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn slot_mut(
        &mut self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Option<&mut GenerationSlot> {
        self.generations
            .get_mut(conversation_id)
            .filter(|slot| &slot.message_id == message_id)
    }

    pub(crate) fn apply_phase(
        &mut self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        phase: StreamPhase,
    ) -> bool {
        match self.slot_mut(conversation_id, message_id) {
            Some(slot) => {
                slot.phase = phase;
                true
            }
            None => false,
        }
    }

    /// Overwrites the streaming message content. Returns whether anything changed.
    pub(crate) fn commit_content(
        &mut self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        content: String,
    ) -> bool {
        if self.slot_mut(conversation_id, message_id).is_none() {
            return false;
        }

        match self
            .conversation_mut(conversation_id)
            .and_then(|conversation| conversation.message_mut(message_id))
        {
            Some(message) if message.content != content => {
                message.content = content;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn attach_stats(
        &mut self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        stats: ResponseStats,
    ) -> bool {
        if self.slot_mut(conversation_id, message_id).is_none() {
            return false;
        }

        match self
            .conversation_mut(conversation_id)
            .and_then(|conversation| conversation.message_mut(message_id))
        {
            Some(message) => {
                message.stats = Some(stats);
                true
            }
            None => false,
        }
    }

    /// Clears the streaming marker and returns the conversation to persist.
    pub(crate) fn finish_generation(
        &mut self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Option<Conversation> {
        self.slot_mut(conversation_id, message_id)?;
        self.generations.remove(conversation_id);
        self.conversation(conversation_id).cloned()
    }
}

fn fresh_conversation() -> Conversation {
    Conversation::with_greeting(ConversationId::generate(), DEFAULT_CONVERSATION_TITLE)
}

fn unique_message_id(conversation: &Conversation) -> MessageId {
    loop {
        let id = MessageId::generate();
        if !conversation.contains_message(&id) {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use parley_storage::{GREETING_MESSAGE, MessageRole};

    use super::*;
    use crate::error::ChatError;

    const MODEL: &str = "llama-3.3-70b-versatile";

    #[test]
    fn fresh_state_has_one_greeted_active_conversation() {
        let snapshot = ChatState::fresh(MODEL).snapshot();

        assert_eq!(snapshot.conversations.len(), 1);
        let active = snapshot.active_conversation().unwrap();
        assert_eq!(active.title, "Getting Started");
        assert_eq!(active.messages.len(), 1);
        assert_eq!(active.messages[0].role, MessageRole::Assistant);
        assert_eq!(active.messages[0].content, GREETING_MESSAGE);
    }

    #[test]
    fn loaded_state_activates_first_conversation() {
        let newest = Conversation::new(ConversationId::new("b"), "newest");
        let older = Conversation::new(ConversationId::new("a"), "older");

        let state = ChatState::from_loaded(vec![newest.clone(), older], MODEL);

        assert_eq!(state.active_id(), &newest.id);
    }

    #[test]
    fn deleting_only_conversation_is_rejected_without_mutation() {
        let mut state = ChatState::fresh(MODEL);
        let before = state.snapshot();

        let error = state.delete(&before.active_conversation_id).err().unwrap();

        assert!(matches!(error, ChatError::LastConversation { .. }));
        assert_eq!(state.snapshot(), before);
    }

    #[test]
    fn new_conversations_are_prepended_numbered_and_activated() {
        let mut state = ChatState::fresh(MODEL);

        let second = state.create_conversation();
        let third = state.create_conversation();

        assert_eq!(second.title, "New Chat 2");
        assert_eq!(third.title, "New Chat 3");
        assert_eq!(state.conversations()[0].id, third.id);
        assert_eq!(state.active_id(), &third.id);
    }

    #[test]
    fn deleting_active_conversation_activates_first_remaining() {
        let mut state = ChatState::fresh(MODEL);
        let original = state.active_id().clone();
        let created = state.create_conversation();

        let outcome = state.delete(&created.id).unwrap();

        assert_eq!(outcome.new_active, Some(original.clone()));
        assert_eq!(state.active_id(), &original);
        assert_eq!(state.conversations().len(), 1);
    }

    #[test]
    fn second_send_into_streaming_conversation_is_rejected() {
        let mut state = ChatState::fresh(MODEL);
        state.begin_generation("hello".to_string(), Vec::new()).unwrap();

        let error = state
            .begin_generation("again".to_string(), Vec::new())
            .err()
            .unwrap();

        assert!(matches!(error, ChatError::GenerationInFlight { .. }));
    }

    #[test]
    fn blank_submission_without_images_is_rejected() {
        let mut state = ChatState::fresh(MODEL);

        assert!(matches!(
            state.begin_generation("   ".to_string(), Vec::new()),
            Err(ChatError::EmptySubmission { .. })
        ));
        assert!(
            state
                .begin_generation(String::new(), vec!["aW1n".to_string()])
                .is_ok()
        );
    }

    #[test]
    fn begin_generation_appends_user_turn_then_placeholder_with_distinct_ids() {
        let mut state = ChatState::fresh(MODEL);

        let pending = state
            .begin_generation("hello".to_string(), Vec::new())
            .unwrap();

        let messages = &pending.conversation.messages;
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].content, "hello");
        assert_eq!(messages[2].id, pending.request.assistant_message_id);
        assert_eq!(messages[2].content, "");
        assert_eq!(pending.request.history.len(), 1);
        assert_ne!(messages[1].id, messages[2].id);
        assert!(state.snapshot().is_streaming(&pending.request.conversation_id));
    }

    #[test]
    fn content_commits_are_idempotent_and_stop_after_finish() {
        let mut state = ChatState::fresh(MODEL);
        let pending = state.begin_generation("hi".to_string(), Vec::new()).unwrap();
        let conversation_id = pending.request.conversation_id.clone();
        let message_id = pending.request.assistant_message_id.clone();

        assert!(state.commit_content(&conversation_id, &message_id, "Hi".to_string()));
        assert!(!state.commit_content(&conversation_id, &message_id, "Hi".to_string()));
        let once = state.snapshot();
        state.commit_content(&conversation_id, &message_id, "Hi".to_string());
        assert_eq!(state.snapshot(), once);

        assert!(state.finish_generation(&conversation_id, &message_id).is_some());
        assert!(!state.commit_content(&conversation_id, &message_id, "late".to_string()));
        assert!(state.finish_generation(&conversation_id, &message_id).is_none());
    }

    #[test]
    fn deleting_streaming_conversation_cancels_its_generation() {
        let mut state = ChatState::fresh(MODEL);
        state.create_conversation();
        let pending = state.begin_generation("hi".to_string(), Vec::new()).unwrap();

        let outcome = state.delete(&pending.request.conversation_id).unwrap();

        assert!(outcome.cancelled_generation);
        assert!(pending.cancel.is_cancelled());
    }

    #[test]
    fn reset_leaves_one_fresh_conversation_and_cancels_all() {
        let mut state = ChatState::fresh(MODEL);
        let pending = state.begin_generation("hi".to_string(), Vec::new()).unwrap();
        state.create_conversation();

        let fresh = state.reset();

        assert!(pending.cancel.is_cancelled());
        assert_eq!(state.conversations().len(), 1);
        assert_eq!(state.active_id(), &fresh.id);
        assert!(state.snapshot().streaming.is_empty());
    }
}
