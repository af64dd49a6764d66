//! Message and conversation types passed between pipeline stages.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// A message as it appears in the chat export, before any role assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub timestamp: NaiveDateTime,
    pub sender: String,
    pub text: String,
}

/// Speaker role in a fine-tuning conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single role-labeled message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    /// Length of the content in characters (not bytes).
    pub fn char_len(&self) -> usize {
        self.content.chars().count()
    }
}

/// A chat message together with the time its raw message was sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StampedMessage {
    pub timestamp: NaiveDateTime,
    pub message: ChatMessage,
}

impl StampedMessage {
    pub fn new(timestamp: NaiveDateTime, message: ChatMessage) -> Self {
        Self { timestamp, message }
    }

    pub fn role(&self) -> Role {
        self.message.role
    }
}

/// A finished conversation: alternating user/assistant turns under one system prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub system_prompt: String,
    pub messages: Vec<ChatMessage>,
}

impl Conversation {
    /// Total characters of all message contents, system prompt excluded.
    pub fn char_count(&self) -> usize {
        self.messages.iter().map(ChatMessage::char_len).sum()
    }

    /// A conversation is worth emitting only if someone asked and the assistant answered.
    pub fn is_well_formed(&self) -> bool {
        let has_user = self.messages.iter().any(|m| m.role == Role::User);
        let has_assistant = self.messages.iter().any(|m| m.role == Role::Assistant);
        has_user && has_assistant
    }

    pub fn assistant_turns(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .count()
    }
}

/// One user turn and the assistant reply to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedConversation {
    pub system_prompt: String,
    pub user_message: ChatMessage,
    pub assistant_message: ChatMessage,
}
