//! Error types shared across the pipeline stages.

use std::path::PathBuf;

use chrono::NaiveDateTime;
use thiserror::Error;

/// Failure of a single moderation request.
#[derive(Debug, Error)]
pub enum ModerationError {
    #[error("moderation request failed: {0}")]
    Transport(String),
    #[error("moderation endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("could not decode moderation response: {0}")]
    Decode(String),
    #[error("moderation response contained no results")]
    EmptyResponse,
}

/// Errors produced while turning one chat export into records.
#[derive(Debug, Error)]
pub enum ChatSftError {
    #[error("moderation service error: {0}")]
    Moderation(#[from] ModerationError),

    #[error("timestamp {found} precedes previous message at {previous}")]
    OutOfOrderTimestamp {
        previous: NaiveDateTime,
        found: NaiveDateTime,
    },

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no .txt chat exports found in {}", .0.display())]
    NoInputFiles(PathBuf),
}

impl ChatSftError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// A per-file failure collected during a batch run.
#[derive(Debug)]
pub struct FileFailure {
    pub path: PathBuf,
    pub error: ChatSftError,
}

impl std::fmt::Display for FileFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.error)
    }
}

pub type Result<T, E = ChatSftError> = std::result::Result<T, E>;
