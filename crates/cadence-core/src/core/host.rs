//! Host-side ownership of the running task.
//!
//! A `TaskHost` owns zero or one task. Starting a new task detaches the old
//! one first, and `detach` never returns while the task can still act:
//! after a bounded wait the task is marked abandoned and its future dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::events::{EventSender, TaskOutcome};
use crate::core::interaction::AskResponder;
use crate::core::messages::{AskDecision, validate_image};
use crate::core::store::ConversationStore;
use crate::core::task::{Task, TaskDeps, TaskStart};
use crate::error::{HostError, RespondError};

/// How long `detach` waits for an aborted task to wind down.
pub const DETACH_TIMEOUT: Duration = Duration::from_secs(3);

struct ActiveTask {
    id: String,
    handle: JoinHandle<TaskOutcome>,
    abort: CancellationToken,
    responder: AskResponder,
    abandoned: Arc<AtomicBool>,
}

pub struct TaskHost {
    deps: TaskDeps,
    events: EventSender,
    active: Option<ActiveTask>,
}

impl TaskHost {
    pub fn new(deps: TaskDeps, events: EventSender) -> Self {
        Self {
            deps,
            events,
            active: None,
        }
    }

    pub fn active_task_id(&self) -> Option<&str> {
        self.active.as_ref().map(|active| active.id.as_str())
    }

    /// Starts a new task and returns its id.
    pub async fn start_task(&mut self, text: String, images: Vec<String>) -> Result<String, HostError> {
        for image in &images {
            validate_image(image)?;
        }
        self.detach().await;
        let id = uuid::Uuid::new_v4().to_string();
        self.spawn(&id, TaskStart::New { text, images });
        Ok(id)
    }

    /// Resumes a saved task from its logs.
    pub async fn resume_task(&mut self, id: &str) -> Result<(), HostError> {
        if !ConversationStore::new(&self.deps.home, id).exists() {
            return Err(HostError::UnknownTask(id.to_string()));
        }
        self.detach().await;
        self.spawn(id, TaskStart::Resume);
        Ok(())
    }

    fn spawn(&mut self, id: &str, start: TaskStart) {
        let abort = CancellationToken::new();
        let responder = AskResponder::new();
        let task = Task::new(
            id,
            self.deps.clone(),
            self.events.clone(),
            abort.clone(),
            responder.clone(),
        );
        let abandoned = task.abandoned_flag();
        tracing::debug!(task_id = %id, "spawning task");
        self.active = Some(ActiveTask {
            id: id.to_string(),
            handle: tokio::spawn(task.run(start)),
            abort,
            responder,
            abandoned,
        });
    }

    /// Delivers a decision to the pending ask of the running task.
    pub fn respond(&self, decision: AskDecision) -> Result<(), RespondError> {
        let active = self.active.as_ref().ok_or(RespondError::NoActiveTask)?;
        active.responder.respond(decision)
    }

    /// Timestamp of the message the running task is waiting on.
    pub fn pending_ask(&self) -> Option<u64> {
        self.active.as_ref()?.responder.pending_ts()
    }

    /// Requests cancellation of the running task. Does not wait.
    pub fn abort_task(&self) {
        if let Some(active) = &self.active {
            tracing::info!(task_id = %active.id, "abort requested");
            active.abort.cancel();
        }
    }

    /// Waits for the running task to end on its own and clears the slot.
    pub async fn wait(&mut self) -> Option<TaskOutcome> {
        let active = self.active.take()?;
        match active.handle.await {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                tracing::error!(task_id = %active.id, error = %err, "task panicked");
                Some(TaskOutcome::Failed)
            }
        }
    }

    /// Aborts the running task and waits (bounded) for it to stop. The slot
    /// is empty afterwards whatever happened.
    pub async fn detach(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        active.abort.cancel();
        match tokio::time::timeout(DETACH_TIMEOUT, &mut active.handle).await {
            Ok(Ok(outcome)) => {
                tracing::debug!(task_id = %active.id, %outcome, "task detached");
            }
            Ok(Err(err)) => {
                tracing::warn!(task_id = %active.id, error = %err, "task ended abnormally on detach");
            }
            Err(_elapsed) => {
                tracing::warn!(task_id = %active.id, "task did not stop in time; abandoning");
                active.abandoned.store(true, Ordering::SeqCst);
                active.handle.abort();
            }
        }
    }
}
