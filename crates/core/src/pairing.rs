//! Pairs mode: split conversations into independent single-turn records.

use crate::message::{Conversation, PairedConversation, Role};

/// One record per user turn that is directly followed by an assistant turn.
///
/// Unanswered user turns (typically a trailing one) are dropped.
pub fn pair_turns(conversation: &Conversation) -> Vec<PairedConversation> {
    conversation
        .messages
        .windows(2)
        .filter(|w| w[0].role == Role::User && w[1].role == Role::Assistant)
        .map(|w| PairedConversation {
            system_prompt: conversation.system_prompt.clone(),
            user_message: w[0].clone(),
            assistant_message: w[1].clone(),
        })
        .collect()
}

/// Pair every conversation, keeping conversation order.
pub fn pair_all(conversations: &[Conversation]) -> Vec<PairedConversation> {
    conversations.iter().flat_map(pair_turns).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ChatMessage;

    fn conversation(messages: Vec<ChatMessage>) -> Conversation {
        Conversation {
            system_prompt: "sys".to_string(),
            messages,
        }
    }

    #[test]
    fn test_dangling_user_turn_is_dropped() {
        let conv = conversation(vec![
            ChatMessage::user("u1"),
            ChatMessage::assistant("a1"),
            ChatMessage::user("u2"),
            ChatMessage::assistant("a2"),
            ChatMessage::user("u3"),
        ]);
        let pairs = pair_turns(&conv);
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].user_message.content, "u1");
        assert_eq!(pairs[0].assistant_message.content, "a1");
        assert_eq!(pairs[1].user_message.content, "u2");
        assert_eq!(pairs[1].assistant_message.content, "a2");
        assert!(pairs.iter().all(|p| p.system_prompt == "sys"));
    }

    #[test]
    fn test_pair_count_matches_assistant_turns() {
        let conv = conversation(vec![
            ChatMessage::user("u1"),
            ChatMessage::assistant("a1"),
            ChatMessage::user("u2"),
            ChatMessage::assistant("a2"),
            ChatMessage::user("u3"),
            ChatMessage::assistant("a3"),
        ]);
        assert_eq!(pair_turns(&conv).len(), conv.assistant_turns());
    }

    #[test]
    fn test_pair_all_keeps_order() {
        let first = conversation(vec![ChatMessage::user("x"), ChatMessage::assistant("y")]);
        let second = conversation(vec![ChatMessage::user("p"), ChatMessage::assistant("q")]);
        let pairs = pair_all(&[first, second]);
        let users: Vec<&str> = pairs.iter().map(|p| p.user_message.content.as_str()).collect();
        assert_eq!(users, vec!["x", "p"]);
    }
}
