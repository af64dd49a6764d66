//! Role assignment for raw chat messages.
//!
//! The assistant is whoever matches the configured display name. Everyone
//! else becomes the same anonymous `user`: individual participants are
//! intentionally not told apart, so no name ever leaks into the output.

use crate::helpers::strip_name_prefix;
use crate::message::{ChatMessage, RawMessage, Role, StampedMessage};

/// Decide the role of a sender. Comparison ignores case and surrounding whitespace.
pub fn assign_role(sender: &str, assistant_name: &str) -> Role {
    let sender = sender.trim();
    let assistant_name = assistant_name.trim();
    if sender.to_lowercase() == assistant_name.to_lowercase() {
        Role::Assistant
    } else {
        Role::User
    }
}

/// Convert one raw message into a role-labeled chat message.
pub fn anonymize_message(raw: &RawMessage, assistant_name: &str) -> StampedMessage {
    let role = assign_role(&raw.sender, assistant_name);
    let content = strip_name_prefix(raw.text.trim(), assistant_name).trim();
    StampedMessage::new(
        raw.timestamp,
        ChatMessage {
            role,
            content: content.to_string(),
        },
    )
}

/// Convert a stream of raw messages, preserving order.
pub fn anonymize(messages: &[RawMessage], assistant_name: &str) -> Vec<StampedMessage> {
    messages
        .iter()
        .map(|raw| anonymize_message(raw, assistant_name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn raw(sender: &str, text: &str) -> RawMessage {
        RawMessage {
            timestamp: NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(12, 0, 0)
                .unwrap(),
            sender: sender.to_string(),
            text: text.to_string(),
        }
    }

    #[test]
    fn test_assistant_match_is_case_insensitive() {
        assert_eq!(assign_role("Bot", "bot"), Role::Assistant);
        assert_eq!(assign_role(" BOT ", "Bot"), Role::Assistant);
        assert_eq!(assign_role("Bottle", "Bot"), Role::User);
    }

    #[test]
    fn test_all_other_senders_collapse_to_user() {
        let out = anonymize(
            &[raw("Alice", "hi"), raw("Carol", "hey"), raw("Bot", "hello")],
            "Bot",
        );
        let roles: Vec<Role> = out.iter().map(|m| m.role()).collect();
        assert_eq!(roles, vec![Role::User, Role::User, Role::Assistant]);
        for msg in &out {
            assert!(!msg.message.content.contains("Alice"));
            assert!(!msg.message.content.contains("Carol"));
        }
    }

    #[test]
    fn test_repeated_assistant_prefix_is_removed() {
        let out = anonymize_message(&raw("Bot", "Bot: hello there"), "Bot");
        assert_eq!(out.message.content, "hello there");
    }

    #[test]
    fn test_timestamp_is_preserved() {
        let input = raw("Alice", "hi");
        let out = anonymize_message(&input, "Bot");
        assert_eq!(out.timestamp, input.timestamp);
    }
}
