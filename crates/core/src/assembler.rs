//! Conversation assembler: turns a moderated message stream into bounded,
//! strictly alternating conversations.
//!
//! The assembler is a small state machine. All cross-message state lives in
//! [`AssemblerState`], which is passed into and returned from
//! [`ConversationAssembler::step`], so every transition can be exercised on its
//! own without replaying a whole stream.

use chrono::{Duration, NaiveDateTime};
use tracing::{debug, warn};

use crate::error::{ChatSftError, Result};
use crate::message::{ChatMessage, Conversation, Role, StampedMessage};
use crate::DEFAULT_MAX_CHARS;

/// What to do with a message whose timestamp is earlier than its predecessor's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampOrder {
    /// Treat the message as sent at the previous timestamp (zero gap) and log a warning.
    #[default]
    Clamp,
    /// Fail the whole stream with [`ChatSftError::OutOfOrderTimestamp`].
    Reject,
}

/// Configuration for the ConversationAssembler.
#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    pub system_prompt: String,
    /// Upper bound on the summed characters of all message contents in one conversation.
    pub max_chars: usize,
    /// Silence longer than this closes the current conversation.
    pub gap_threshold: Duration,
    pub timestamp_order: TimestampOrder,
}

impl AssemblerConfig {
    /// The gap threshold has no sensible universal default, so it is always explicit.
    pub fn new(system_prompt: impl Into<String>, gap_threshold: Duration) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            max_chars: DEFAULT_MAX_CHARS,
            gap_threshold,
            timestamp_order: TimestampOrder::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_chars == 0 {
            return Err(ChatSftError::InvalidConfig(
                "max_chars must be greater than zero".to_string(),
            ));
        }
        if self.gap_threshold < Duration::zero() {
            return Err(ChatSftError::InvalidConfig(
                "gap threshold must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Counters describing what the assembler did with a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblyStats {
    pub messages_seen: usize,
    /// Assistant messages that arrived with no conversation open.
    pub discarded_unopened: usize,
    pub merged: usize,
    pub clamped_timestamps: usize,
    pub gap_splits: usize,
    pub size_splits: usize,
    /// Exchanges that alone exceed `max_chars`.
    pub oversized_discarded: usize,
    pub conversations_emitted: usize,
    /// Closed conversations lacking a user or an assistant message.
    pub incomplete_discarded: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingUser,
    InConversation,
}

/// Accumulator carried between transitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssemblerState {
    current: Option<Vec<ChatMessage>>,
    current_chars: usize,
    last_role: Option<Role>,
    last_timestamp: Option<NaiveDateTime>,
    stats: AssemblyStats,
}

impl AssemblerState {
    pub fn phase(&self) -> Phase {
        if self.current.is_some() {
            Phase::InConversation
        } else {
            Phase::AwaitingUser
        }
    }

    /// Turns of the conversation in progress, if any.
    pub fn current_messages(&self) -> Option<&[ChatMessage]> {
        self.current.as_deref()
    }

    pub fn current_chars(&self) -> usize {
        self.current_chars
    }

    /// Role of the last turn in the conversation in progress.
    pub fn last_role(&self) -> Option<Role> {
        self.last_role
    }

    /// Timestamp of the last message seen, after clamping.
    pub fn last_timestamp(&self) -> Option<NaiveDateTime> {
        self.last_timestamp
    }

    pub fn stats(&self) -> &AssemblyStats {
        &self.stats
    }
}

/// Result of feeding one message to the assembler.
#[derive(Debug, Clone)]
pub struct Transition {
    pub state: AssemblerState,
    pub emitted: Vec<Conversation>,
}

/// Conversations produced from a complete stream.
#[derive(Debug, Clone, Default)]
pub struct Assembly {
    pub conversations: Vec<Conversation>,
    pub stats: AssemblyStats,
}

/// Segments a chat message stream into conversations.
#[derive(Debug, Clone)]
pub struct ConversationAssembler {
    config: AssemblerConfig,
}

impl ConversationAssembler {
    pub fn new(config: AssemblerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &AssemblerConfig {
        &self.config
    }

    /// Run a whole stream through the state machine.
    pub fn assemble(&self, messages: &[StampedMessage]) -> Result<Assembly> {
        let mut state = AssemblerState::default();
        let mut conversations = Vec::new();

        for message in messages {
            let transition = self.step(state, message)?;
            conversations.extend(transition.emitted);
            state = transition.state;
        }

        let (last, stats) = self.finish(state);
        conversations.extend(last);
        Ok(Assembly {
            conversations,
            stats,
        })
    }

    /// Apply one message to `state`.
    pub fn step(&self, mut state: AssemblerState, message: &StampedMessage) -> Result<Transition> {
        let mut emitted = Vec::new();
        state.stats.messages_seen += 1;

        let timestamp = self.effective_timestamp(&mut state, message.timestamp)?;

        // Gap check runs before anything else; a gap close restarts size accounting.
        if let Some(last) = state.last_timestamp.filter(|_| state.current.is_some()) {
            if timestamp - last > self.config.gap_threshold {
                debug!("Gap of {} before message at {}, closing conversation", timestamp - last, timestamp);
                state.stats.gap_splits += 1;
                self.close_current(&mut state, &mut emitted);
            }
        }
        state.last_timestamp = Some(timestamp);

        let role = message.role();
        let content = &message.message.content;

        if state.current.is_none() {
            if role != Role::User {
                debug!("Discarding {} message at {}: no conversation open", role, timestamp);
                state.stats.discarded_unopened += 1;
                return Ok(Transition { state, emitted });
            }
            state.current = Some(vec![ChatMessage::user(content.clone())]);
            state.current_chars = message.message.char_len();
        } else if state.last_role == Some(role) {
            // Same speaker again: fold into the previous turn to keep alternation.
            if let Some(last) = state.current.as_mut().and_then(|turns| turns.last_mut()) {
                last.content.push('\n');
                last.content.push_str(content);
            }
            state.current_chars += 1 + message.message.char_len();
            state.stats.merged += 1;
        } else if let Some(turns) = state.current.as_mut() {
            turns.push(ChatMessage {
                role,
                content: content.clone(),
            });
            state.current_chars += message.message.char_len();
        }
        state.last_role = Some(role);

        if state.current_chars > self.config.max_chars {
            self.split_oversized(&mut state, &mut emitted);
        }

        Ok(Transition { state, emitted })
    }

    /// Close the stream, emitting the conversation in progress if it is well-formed.
    pub fn finish(&self, mut state: AssemblerState) -> (Option<Conversation>, AssemblyStats) {
        let mut emitted = Vec::new();
        self.close_current(&mut state, &mut emitted);
        (emitted.pop(), state.stats)
    }

    fn effective_timestamp(
        &self,
        state: &mut AssemblerState,
        found: NaiveDateTime,
    ) -> Result<NaiveDateTime> {
        match state.last_timestamp {
            Some(previous) if found < previous => match self.config.timestamp_order {
                TimestampOrder::Clamp => {
                    warn!(
                        "Message at {} precedes previous message at {}, treating it as sent at {}",
                        found, previous, previous
                    );
                    state.stats.clamped_timestamps += 1;
                    Ok(previous)
                }
                TimestampOrder::Reject => {
                    Err(ChatSftError::OutOfOrderTimestamp { previous, found })
                }
            },
            _ => Ok(found),
        }
    }

    /// Finish the conversation in progress and return to `AwaitingUser`.
    fn close_current(&self, state: &mut AssemblerState, emitted: &mut Vec<Conversation>) {
        state.last_role = None;
        state.current_chars = 0;
        let Some(messages) = state.current.take() else {
            return;
        };
        self.emit(messages, state, emitted);
    }

    fn emit(&self, messages: Vec<ChatMessage>, state: &mut AssemblerState, emitted: &mut Vec<Conversation>) {
        let conversation = Conversation {
            system_prompt: self.config.system_prompt.clone(),
            messages,
        };
        if conversation.is_well_formed() {
            state.stats.conversations_emitted += 1;
            emitted.push(conversation);
        } else {
            debug!(
                "Discarding conversation of {} message(s) without both roles",
                conversation.messages.len()
            );
            state.stats.incomplete_discarded += 1;
        }
    }

    /// The last append pushed the conversation over `max_chars`.
    ///
    /// Everything before the final exchange (last user turn plus any reply to it)
    /// is emitted; the final exchange seeds the next conversation. Turns are
    /// never split.
    fn split_oversized(&self, state: &mut AssemblerState, emitted: &mut Vec<Conversation>) {
        let Some(mut head) = state.current.take() else {
            return;
        };
        state.stats.size_splits += 1;

        let boundary = head
            .iter()
            .rposition(|m| m.role == Role::User)
            .unwrap_or(0);
        let tail = head.split_off(boundary);

        if !head.is_empty() {
            debug!(
                "Conversation exceeded {} chars, emitting {} turn(s) and carrying {}",
                self.config.max_chars,
                head.len(),
                tail.len()
            );
            self.emit(head, state, emitted);
        }

        let tail_chars: usize = tail.iter().map(ChatMessage::char_len).sum();
        if tail_chars > self.config.max_chars {
            debug!("Dropping exchange of {} chars, larger than max_chars on its own", tail_chars);
            state.stats.oversized_discarded += 1;
            state.current_chars = 0;
            state.last_role = None;
            return;
        }

        state.last_role = tail.last().map(|m| m.role);
        state.current_chars = tail_chars;
        state.current = Some(tail);
    }
}
