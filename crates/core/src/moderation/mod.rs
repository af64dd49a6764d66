//! Content moderation stage.
//!
//! Every message is scored by an injected [`Moderator`]; messages scoring at or
//! above the policy threshold are removed from the stream before assembly.

pub mod openai;

use std::collections::BTreeMap;

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::error::{ChatSftError, ModerationError};
use crate::message::StampedMessage;
use crate::Moderator;
use crate::DEFAULT_THRESHOLD;

/// Result of scoring one piece of text.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModerationVerdict {
    /// The service's own yes/no opinion. Informational only; dropping is decided by `score`.
    pub flagged: bool,
    /// Highest category score, in `[0, 1]`.
    pub score: f64,
    pub category_scores: BTreeMap<String, f64>,
}

impl ModerationVerdict {
    /// Build a verdict from per-category scores; `score` becomes the maximum.
    pub fn from_scores(flagged: bool, category_scores: BTreeMap<String, f64>) -> Self {
        let score = category_scores
            .values()
            .copied()
            .fold(0.0_f64, f64::max)
            .clamp(0.0, 1.0);
        Self {
            flagged,
            score,
            category_scores,
        }
    }

    /// Categories scoring at or above `threshold`.
    pub fn categories_at_or_above(&self, threshold: f64) -> Vec<&str> {
        self.category_scores
            .iter()
            .filter(|(_, score)| **score >= threshold)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// What to do when the moderation service itself fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Fail the whole file. Unmoderated content never reaches the output.
    #[default]
    FailClosed,
    /// Keep the message and log a warning.
    FailOpen,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModerationPolicy {
    pub threshold: f64,
    pub on_error: FailurePolicy,
}

impl Default for ModerationPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            on_error: FailurePolicy::FailClosed,
        }
    }
}

impl ModerationPolicy {
    pub fn new(threshold: f64, on_error: FailurePolicy) -> Result<Self, ChatSftError> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ChatSftError::InvalidConfig(format!(
                "moderation threshold must be within [0, 1], got {}",
                threshold
            )));
        }
        Ok(Self {
            threshold,
            on_error,
        })
    }

    /// A message is dropped iff its score reaches the threshold.
    pub fn admits(&self, verdict: &ModerationVerdict) -> bool {
        verdict.score < self.threshold
    }
}

/// Messages that survived moderation plus counters for reporting.
#[derive(Debug, Clone, Default)]
pub struct ModerationOutcome {
    pub kept: Vec<StampedMessage>,
    pub dropped: usize,
    /// Messages kept only because the service failed under [`FailurePolicy::FailOpen`].
    pub unchecked: usize,
}

/// Score every message and keep the ones the policy admits, in their original order.
///
/// Requests for different messages may run concurrently; the decision pass is
/// sequential so the first failure in stream order is the one reported.
pub fn moderate_messages<M>(
    messages: Vec<StampedMessage>,
    moderator: &M,
    policy: &ModerationPolicy,
) -> Result<ModerationOutcome, ModerationError>
where
    M: Moderator + Sync + ?Sized,
{
    let verdicts: Vec<Result<ModerationVerdict, ModerationError>> = messages
        .par_iter()
        .map(|msg| moderator.moderate(&msg.message.content))
        .collect();

    let total = messages.len();
    let mut outcome = ModerationOutcome::default();

    for (msg, verdict) in messages.into_iter().zip(verdicts) {
        match verdict {
            Ok(verdict) if policy.admits(&verdict) => outcome.kept.push(msg),
            Ok(verdict) => {
                debug!(
                    score = verdict.score,
                    categories = ?verdict.categories_at_or_above(policy.threshold),
                    "Dropping {} message at {}",
                    msg.role(),
                    msg.timestamp
                );
                outcome.dropped += 1;
            }
            Err(e) => match policy.on_error {
                FailurePolicy::FailClosed => return Err(e),
                FailurePolicy::FailOpen => {
                    warn!("Moderation failed for message at {}, keeping it unchecked: {}", msg.timestamp, e);
                    outcome.unchecked += 1;
                    outcome.kept.push(msg);
                }
            },
        }
    }

    info!(
        "Moderation complete: {} of {} messages removed",
        outcome.dropped, total
    );
    Ok(outcome)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::message::ChatMessage;
    use chrono::NaiveDate;
    use std::collections::HashMap;

    /// Deterministic moderator: scores are looked up by exact text, default 0.
    pub(crate) struct FakeModerator {
        pub scores: HashMap<String, f64>,
        pub fail_on: Option<String>,
    }

    impl FakeModerator {
        pub(crate) fn with_scores(scores: &[(&str, f64)]) -> Self {
            Self {
                scores: scores.iter().map(|(t, s)| (t.to_string(), *s)).collect(),
                fail_on: None,
            }
        }
    }

    impl Moderator for FakeModerator {
        fn moderate(&self, text: &str) -> Result<ModerationVerdict, ModerationError> {
            if self.fail_on.as_deref() == Some(text) {
                return Err(ModerationError::Transport("connection reset".to_string()));
            }
            let score = self.scores.get(text).copied().unwrap_or(0.0);
            let mut categories = BTreeMap::new();
            categories.insert("harassment".to_string(), score);
            Ok(ModerationVerdict::from_scores(score >= 0.5, categories))
        }
    }

    fn stamped(texts: &[&str]) -> Vec<StampedMessage> {
        let base = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| {
                StampedMessage::new(
                    base + chrono::Duration::seconds(i as i64),
                    ChatMessage::user(*t),
                )
            })
            .collect()
    }

    fn contents(outcome: &ModerationOutcome) -> Vec<&str> {
        outcome
            .kept
            .iter()
            .map(|m| m.message.content.as_str())
            .collect()
    }

    #[test]
    fn test_score_at_threshold_is_dropped() {
        let moderator = FakeModerator::with_scores(&[("nasty", 0.7), ("borderline", 0.69)]);
        let policy = ModerationPolicy::default();
        let outcome =
            moderate_messages(stamped(&["hi", "nasty", "borderline"]), &moderator, &policy).unwrap();
        assert_eq!(contents(&outcome), vec!["hi", "borderline"]);
        assert_eq!(outcome.dropped, 1);
    }

    #[test]
    fn test_order_is_preserved() {
        let moderator = FakeModerator::with_scores(&[]);
        let texts: Vec<String> = (0..200).map(|i| format!("msg {}", i)).collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let outcome =
            moderate_messages(stamped(&refs), &moderator, &ModerationPolicy::default()).unwrap();
        assert_eq!(contents(&outcome), refs);
    }

    #[test]
    fn test_raising_threshold_never_removes_more() {
        let moderator =
            FakeModerator::with_scores(&[("a", 0.1), ("b", 0.4), ("c", 0.75), ("d", 0.95), ("e", 1.0)]);
        let input = ["a", "b", "c", "d", "e", "f"];
        let mut previous = 0;
        for step in 0..=10 {
            let threshold = step as f64 / 10.0;
            let policy = ModerationPolicy::new(threshold, FailurePolicy::FailClosed).unwrap();
            let kept = moderate_messages(stamped(&input), &moderator, &policy)
                .unwrap()
                .kept
                .len();
            assert!(kept >= previous, "threshold {} kept {} < {}", threshold, kept, previous);
            previous = kept;
        }
    }

    #[test]
    fn test_failure_is_fatal_by_default() {
        let moderator = FakeModerator {
            scores: HashMap::new(),
            fail_on: Some("boom".to_string()),
        };
        let result = moderate_messages(stamped(&["ok", "boom"]), &moderator, &ModerationPolicy::default());
        assert!(matches!(result, Err(ModerationError::Transport(_))));
    }

    #[test]
    fn test_fail_open_keeps_message() {
        let moderator = FakeModerator {
            scores: HashMap::new(),
            fail_on: Some("boom".to_string()),
        };
        let policy = ModerationPolicy::new(0.7, FailurePolicy::FailOpen).unwrap();
        let outcome = moderate_messages(stamped(&["ok", "boom"]), &moderator, &policy).unwrap();
        assert_eq!(contents(&outcome), vec!["ok", "boom"]);
        assert_eq!(outcome.unchecked, 1);
    }

    #[test]
    fn test_threshold_out_of_range_is_rejected() {
        assert!(ModerationPolicy::new(1.5, FailurePolicy::FailClosed).is_err());
        assert!(ModerationPolicy::new(-0.1, FailurePolicy::FailClosed).is_err());
    }

    #[test]
    fn test_verdict_score_is_max_category() {
        let mut scores = BTreeMap::new();
        scores.insert("violence".to_string(), 0.2);
        scores.insert("hate".to_string(), 0.8);
        let verdict = ModerationVerdict::from_scores(true, scores);
        assert_eq!(verdict.score, 0.8);
        assert_eq!(verdict.categories_at_or_above(0.5), vec!["hate"]);
    }
}
