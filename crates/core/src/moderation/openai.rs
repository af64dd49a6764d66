//! Blocking client for the OpenAI moderation endpoint.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use crate::error::ModerationError;
use crate::moderation::ModerationVerdict;
use crate::Moderator;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Requests allowed per minute and client.
pub const DEFAULT_CALLS_PER_MINUTE: u32 = 1000;

#[derive(Debug, Clone)]
pub struct OpenAiModeratorConfig {
    pub api_key: String,
    pub base_url: String,
    /// Moderation model; the endpoint default is used when `None`.
    pub model: Option<String>,
    pub timeout: Duration,
    /// Zero disables client-side rate limiting.
    pub calls_per_minute: u32,
}

impl Default for OpenAiModeratorConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: None,
            timeout: Duration::from_secs(30),
            calls_per_minute: DEFAULT_CALLS_PER_MINUTE,
        }
    }
}

/// Spaces requests evenly so that at most `calls_per_minute` start in any minute.
#[derive(Debug)]
struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    fn per_minute(calls: u32) -> Self {
        let interval = if calls == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(60) / calls
        };
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    /// Claim the next free slot and return how long the caller must wait for it.
    fn reserve(&self, now: Instant) -> Duration {
        if self.interval.is_zero() {
            return Duration::ZERO;
        }
        // A poisoned lock only means another worker panicked mid-reservation.
        let mut next = self
            .next_slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let slot = match *next {
            Some(at) if at > now => at,
            _ => now,
        };
        *next = Some(slot + self.interval);
        slot - now
    }

    fn acquire(&self) {
        let wait = self.reserve(Instant::now());
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
    }
}

#[derive(Serialize)]
struct ModerationRequest<'a> {
    input: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

#[derive(Deserialize)]
struct ModerationResponse {
    results: Vec<ModerationResult>,
}

// The API occasionally returns null for categories it did not evaluate.
#[derive(Deserialize)]
struct ModerationResult {
    flagged: bool,
    #[serde(default)]
    category_scores: HashMap<String, Option<f64>>,
}

impl ModerationResult {
    fn into_verdict(self) -> ModerationVerdict {
        let scores: BTreeMap<String, f64> = self
            .category_scores
            .into_iter()
            .map(|(name, score)| (name, score.unwrap_or(0.0)))
            .collect();
        ModerationVerdict::from_scores(self.flagged, scores)
    }
}

/// Decode a moderation response body into a verdict for its first result.
pub fn verdict_from_body(body: &str) -> Result<ModerationVerdict, ModerationError> {
    let parsed: ModerationResponse =
        serde_json::from_str(body).map_err(|e| ModerationError::Decode(e.to_string()))?;
    parsed
        .results
        .into_iter()
        .next()
        .map(ModerationResult::into_verdict)
        .ok_or(ModerationError::EmptyResponse)
}

/// [`Moderator`] backed by `POST {base_url}/moderations`.
///
/// The client is `Sync`: one instance is shared by every worker thread.
pub struct OpenAiModerator {
    client: Client,
    config: OpenAiModeratorConfig,
    limiter: RateLimiter,
}

impl OpenAiModerator {
    pub fn new(config: OpenAiModeratorConfig) -> Result<Self, ModerationError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("chat-sft/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ModerationError::Transport(e.to_string()))?;
        let limiter = RateLimiter::per_minute(config.calls_per_minute);
        Ok(Self {
            client,
            config,
            limiter,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/moderations", self.config.base_url.trim_end_matches('/'))
    }
}

impl Moderator for OpenAiModerator {
    fn moderate(&self, text: &str) -> Result<ModerationVerdict, ModerationError> {
        self.limiter.acquire();

        let request = ModerationRequest {
            input: text,
            model: self.config.model.as_deref(),
        };
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .map_err(|e| ModerationError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|e| ModerationError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(ModerationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        verdict_from_body(&body)
    }
}
