//! Core logic for turning exported chat transcripts into fine-tuning data.
//!
//! The pipeline runs tokenizer → anonymizer → moderation → assembler, and
//! optionally splits conversations into single-turn pairs. The
//! [`ConversationAssembler`] is the only stage that carries state across
//! messages.

use crate::error::ModerationError;
use crate::moderation::ModerationVerdict;

/// Trait for content moderation.
///
/// Implementors score a piece of text. The moderation stage decides what to
/// drop; implementors only report. Implementations used for batch runs must be
/// `Sync`, since files are processed on several threads at once.
pub trait Moderator {
    /// Score `text`. Transport or service failures are returned as errors.
    fn moderate(&self, text: &str) -> Result<ModerationVerdict, ModerationError>;
}

// Blanket implementation for references to Moderators
impl<T: Moderator + ?Sized> Moderator for &T {
    fn moderate(&self, text: &str) -> Result<ModerationVerdict, ModerationError> {
        (*self).moderate(text)
    }
}

mod anonymize;
pub mod assembler;
pub mod error;
mod helpers;
mod message;
pub mod moderation;
mod pairing;
pub mod pipeline;
mod tokenizer;

pub use anonymize::{anonymize, anonymize_message, assign_role};
pub use assembler::{
    AssemblerConfig, AssemblerState, Assembly, AssemblyStats, ConversationAssembler, Phase,
    TimestampOrder, Transition,
};
pub use error::{ChatSftError, FileFailure};
pub use helpers::{clean_text, strip_bidi_controls};
pub use message::{ChatMessage, Conversation, PairedConversation, RawMessage, Role, StampedMessage};
pub use moderation::openai::{OpenAiModerator, OpenAiModeratorConfig};
pub use moderation::{moderate_messages, FailurePolicy, ModerationOutcome, ModerationPolicy};
pub use pairing::{pair_all, pair_turns};
pub use pipeline::{
    default_output_path, discover_chat_files, process_all_files, process_chat_file,
    process_chat_text, write_batch_output, write_jsonl_output, BatchResult, FileResult,
    FileStats, PipelineConfig, PipelineSummary, SftMessage, SftRecord,
};
pub use tokenizer::{parse_chat_text, MalformedLine, ParsedChat};

/// Default moderation threshold: messages scoring at or above it are dropped.
pub const DEFAULT_THRESHOLD: f64 = 0.7;

/// Default maximum characters of message content per conversation.
pub const DEFAULT_MAX_CHARS: usize = 8000;

/// Default silence, in hours, that separates two conversations.
///
/// Only the CLI applies this; library callers always pass a gap explicitly.
pub const DEFAULT_GAP_HOURS: i64 = 6;
