//! Conversation store: the two durable logs of a task.
//!
//! Layout under the home directory:
//!
//! ```text
//! tasks/<task_id>/api_conversation_history.json   model-facing history
//! tasks/<task_id>/ui_messages.json                UI log (pretty-printed)
//! task_history.json                               index, see `history`
//! ```
//!
//! Every save completes before control returns, so a crash never loses an
//! acknowledged mutation.

use std::path::{Path, PathBuf};

use crate::core::history::{HistoryItem, TaskHistory};
use crate::core::json_storage::{read_json_array, write_json};
use crate::core::messages::{ApiMessage, UiMessage};
use crate::error::PersistenceError;

const API_HISTORY_FILE: &str = "api_conversation_history.json";
const UI_MESSAGES_FILE: &str = "ui_messages.json";

#[derive(Debug, Clone)]
pub struct ConversationStore {
    task_id: String,
    task_dir: PathBuf,
    history: TaskHistory,
}

impl ConversationStore {
    /// Store for `task_id` under `home` (the Cadence home directory).
    pub fn new(home: &Path, task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            task_dir: home.join("tasks").join(task_id),
            history: TaskHistory::new(home.join("task_history.json")),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn task_dir(&self) -> &Path {
        &self.task_dir
    }

    pub fn history(&self) -> &TaskHistory {
        &self.history
    }

    /// True when either log exists on disk.
    pub fn exists(&self) -> bool {
        self.api_history_path().exists() || self.ui_messages_path().exists()
    }

    fn api_history_path(&self) -> PathBuf {
        self.task_dir.join(API_HISTORY_FILE)
    }

    fn ui_messages_path(&self) -> PathBuf {
        self.task_dir.join(UI_MESSAGES_FILE)
    }

    pub async fn load_api_history(&self) -> Result<Vec<ApiMessage>, PersistenceError> {
        read_json_array(&self.api_history_path()).await
    }

    pub async fn save_api_history(&self, messages: &[ApiMessage]) -> Result<(), PersistenceError> {
        write_json(&self.api_history_path(), messages, false).await
    }

    pub async fn load_ui_messages(&self) -> Result<Vec<UiMessage>, PersistenceError> {
        read_json_array(&self.ui_messages_path()).await
    }

    /// Saves the UI log and refreshes this task's history entry.
    pub async fn save_ui_messages(&self, messages: &[UiMessage]) -> Result<(), PersistenceError> {
        write_json(&self.ui_messages_path(), messages, true).await?;
        if let Some(item) = HistoryItem::from_ui_messages(&self.task_id, messages) {
            self.history.upsert(item).await?;
        }
        Ok(())
    }
}
