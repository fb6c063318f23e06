//! Typed errors crossing the engine boundary.
//!
//! Tool failures never appear here: the dispatcher turns them into
//! conversation content. What remains is what the host has to act on.

use std::path::PathBuf;

use crate::model::ProviderError;

/// Storage failure. Fatal for the task, surfaced to the host.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Failed to access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to serialize {}: {source}", .path.display())]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl PersistenceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Why a task stopped making progress.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The task was aborted; every later ask/say fails with this.
    #[error("task aborted")]
    Aborted,
    /// A pending ask was replaced by a newer message before it was answered.
    #[error("ask superseded by a newer message")]
    Superseded,
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    /// The model request failed and was not retried.
    #[error("API request failed: {0}")]
    RequestFailed(ProviderError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl TaskError {
    /// True for the two cancellation outcomes of an ask.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, TaskError::Aborted | TaskError::Superseded)
    }
}

pub type TaskResult<T> = Result<T, TaskError>;

/// A user-supplied image that cannot be sent to the model.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImageError {
    #[error("image is not a base64 data URL")]
    NotDataUrl,
    #[error("unsupported image type '{0}' (expected png, jpeg, gif or webp)")]
    UnsupportedType(String),
    #[error("image data is not valid base64")]
    InvalidBase64,
}

/// Delivering a decision to a task failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RespondError {
    #[error("no task is running")]
    NoActiveTask,
    #[error("the task is not waiting for an answer")]
    NoPendingAsk,
    #[error(transparent)]
    InvalidImage(#[from] ImageError),
}

/// Starting or resuming a task failed.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("no saved task with id '{0}'")]
    UnknownTask(String),
    #[error(transparent)]
    InvalidImage(#[from] ImageError),
}
