use parley_llm::Turn;
use parley_storage::{Message, MessageRole};

/// Text sent alongside images when the user typed nothing.
pub const IMAGE_ONLY_PROMPT: &str = "Please analyze these images.";

/// Provider turns for one request: optional system prompt, prior history, then the new user turn.
///
/// `history` holds the messages before the new user turn; images for the new turn come from
/// `user_message` as it sits in the live conversation.
pub fn build_turns(
    system_prompt: Option<&str>,
    history: &[Message],
    user_text: &str,
    user_message: &Message,
) -> Vec<Turn> {
    let mut turns = Vec::with_capacity(history.len() + 2);

    if let Some(prompt) = system_prompt.map(str::trim).filter(|prompt| !prompt.is_empty()) {
        turns.push(Turn::system(prompt));
    }

    turns.extend(history.iter().filter_map(history_turn));
    turns.push(user_turn(user_text, &user_message.images));
    turns
}

fn history_turn(message: &Message) -> Option<Turn> {
    match message.role {
        // Placeholders of failed or cancelled-before-first-token replies carry nothing useful.
        MessageRole::Assistant if message.content.trim().is_empty() => None,
        MessageRole::Assistant => Some(Turn::assistant(message.content.clone())),
        MessageRole::User => Some(user_turn(&message.content, &message.images)),
    }
}

fn user_turn(text: &str, images: &[String]) -> Turn {
    if images.is_empty() {
        return Turn::user(text);
    }

    let text = if text.is_empty() { IMAGE_ONLY_PROMPT } else { text };
    Turn::user_with_images(text, images)
}

#[cfg(test)]
mod tests {
    use parley_llm::{ContentPart, Role, TurnContent};
    use parley_storage::MessageId;

    use super::*;

    fn user(content: &str, images: &[&str]) -> Message {
        Message::user(
            MessageId::generate(),
            content,
            images.iter().map(|image| image.to_string()).collect(),
        )
    }

    #[test]
    fn new_user_turn_with_two_images_has_one_text_and_two_image_parts_in_order() {
        let live = user("Compare these", &["img-a", "img-b"]);

        let turns = build_turns(None, &[], "Compare these", &live);

        assert_eq!(
            turns.last().map(|turn| &turn.content),
            Some(&TurnContent::Multimodal(vec![
                ContentPart::Text {
                    text: "Compare these".to_string()
                },
                ContentPart::Image {
                    image: "img-a".to_string()
                },
                ContentPart::Image {
                    image: "img-b".to_string()
                },
            ]))
        );
    }

    #[test]
    fn image_only_turns_get_default_prompt() {
        let earlier = user("", &["img-old"]);
        let live = user("", &["img-new"]);

        let turns = build_turns(None, &[earlier], "", &live);

        for turn in &turns {
            let TurnContent::Multimodal(parts) = &turn.content else {
                panic!("expected multimodal turn");
            };
            assert_eq!(
                parts[0],
                ContentPart::Text {
                    text: IMAGE_ONLY_PROMPT.to_string()
                }
            );
        }
    }

    #[test]
    fn system_prompt_is_trimmed_and_blank_assistant_history_skipped() {
        let history = vec![
            Message::assistant(MessageId::generate(), "Hello!"),
            user("first", &[]),
            Message::assistant_placeholder(MessageId::generate()),
        ];
        let live = user("second", &[]);

        let turns = build_turns(Some("  Answer in French.  "), &history, "second", &live);

        let roles = turns.iter().map(|turn| turn.role).collect::<Vec<_>>();
        assert_eq!(
            roles,
            vec![Role::System, Role::Assistant, Role::User, Role::User]
        );
        assert_eq!(turns[0], Turn::system("Answer in French."));
        assert_eq!(turns[3], Turn::user("second"));
    }

    #[test]
    fn blank_system_prompt_is_omitted() {
        let live = user("hello", &[]);

        let turns = build_turns(Some("   "), &[], "hello", &live);

        assert_eq!(turns, vec![Turn::user("hello")]);
    }
}
