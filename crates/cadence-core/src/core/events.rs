//! Host notifications.
//!
//! The engine never renders anything. It posts `TaskEvent`s over a bounded
//! channel and the host decides what to show. Events are serializable so a
//! host can forward them as JSON.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::messages::UiMessage;
use crate::model::ProviderErrorKind;

/// Events posted by a running task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// Full snapshot of the UI log (bulk edits, resumption, aborts).
    StateChanged {
        task_id: String,
        messages: Vec<UiMessage>,
    },

    /// A message was appended to the UI log.
    MessageAdded { task_id: String, message: UiMessage },

    /// An existing message changed in place (streaming update or finalization).
    PartialMessage { task_id: String, message: UiMessage },

    /// The task stopped with an error the host should show.
    Error {
        /// Error category for structured handling
        kind: ErrorKind,
        /// One-line summary
        message: String,
        /// Optional additional details
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },

    /// The task loop exited.
    TaskFinished {
        task_id: String,
        outcome: TaskOutcome,
    },
}

/// How a task loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    /// The user accepted the completion result.
    Completed,
    Aborted,
    Failed,
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskOutcome::Completed => write!(f, "completed"),
            TaskOutcome::Aborted => write!(f, "aborted"),
            TaskOutcome::Failed => write!(f, "failed"),
        }
    }
}

/// Error categories for `TaskEvent::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// HTTP status error (4xx, 5xx)
    HttpStatus,
    /// Connection/request timeout
    Timeout,
    /// Response parsing failed
    Parse,
    /// API-level error from provider
    ApiError,
    /// The response stream broke mid-way
    Stream,
    /// Storage write failed
    Persistence,
    /// Internal/unknown error
    Internal,
}

impl From<ProviderErrorKind> for ErrorKind {
    fn from(kind: ProviderErrorKind) -> Self {
        match kind {
            ProviderErrorKind::HttpStatus => ErrorKind::HttpStatus,
            ProviderErrorKind::Timeout => ErrorKind::Timeout,
            ProviderErrorKind::Parse => ErrorKind::Parse,
            ProviderErrorKind::ApiError => ErrorKind::ApiError,
            ProviderErrorKind::Stream => ErrorKind::Stream,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::HttpStatus => write!(f, "http_status"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Parse => write!(f, "parse"),
            ErrorKind::ApiError => write!(f, "api_error"),
            ErrorKind::Stream => write!(f, "stream"),
            ErrorKind::Persistence => write!(f, "persistence"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

/// Channel-based event sender (async, bounded).
///
/// Events are wrapped in `Arc` so hosts can fan them out cheaply.
pub type TaskEventTx = mpsc::Sender<Arc<TaskEvent>>;

/// Channel-based event receiver (async, bounded).
pub type TaskEventRx = mpsc::Receiver<Arc<TaskEvent>>;

/// Default channel capacity for event streams.
///
/// Set higher (128) to accommodate best-effort partial updates without blocking.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 128;

/// Creates a bounded event channel with the default capacity.
pub fn create_event_channel() -> (TaskEventTx, TaskEventRx) {
    mpsc::channel(DEFAULT_EVENT_CHANNEL_CAPACITY)
}

/// Event sender wrapper that provides best-effort and reliable send modes.
///
/// Use `send_delta()` for streaming partial updates that can be dropped if the
/// host is slow. Use `send_important()` for appended messages, finalizations,
/// snapshots and task completion.
#[derive(Clone)]
pub struct EventSender {
    tx: TaskEventTx,
}

impl EventSender {
    pub fn new(tx: TaskEventTx) -> Self {
        Self { tx }
    }

    /// Best-effort send: never awaits, drops if channel is full.
    pub fn send_delta(&self, ev: TaskEvent) {
        let _ = self.tx.try_send(Arc::new(ev));
    }

    /// Reliable send: awaits delivery. A closed channel is ignored.
    pub async fn send_important(&self, ev: TaskEvent) {
        let _ = self.tx.send(Arc::new(ev)).await;
    }
}
