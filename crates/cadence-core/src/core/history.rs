//! Task history index (`task_history.json`).
//!
//! One entry per task, refreshed on every UI-log save so task lists never
//! need to open the per-task logs.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::json_storage::{read_json_array, write_json};
use crate::core::messages::{ApiMetrics, UiMessage};
use crate::error::PersistenceError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryItem {
    pub id: String,
    /// Timestamp of the last non-resume message.
    pub ts: u64,
    /// Text of the first message, i.e. the task itself.
    pub task: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cache_writes: u64,
    pub cache_reads: u64,
    pub total_cost: f64,
}

impl HistoryItem {
    /// Summarizes a UI log. Returns `None` for an empty log.
    pub fn from_ui_messages(id: &str, messages: &[UiMessage]) -> Option<Self> {
        let first = messages.first()?;
        let last_relevant = messages
            .iter()
            .rev()
            .find(|m| !m.is_resume_ask())
            .unwrap_or(first);
        let metrics = ApiMetrics::from_ui_messages(messages);
        Some(Self {
            id: id.to_string(),
            ts: last_relevant.ts,
            task: first.text().to_string(),
            tokens_in: metrics.tokens_in,
            tokens_out: metrics.tokens_out,
            cache_writes: metrics.cache_writes,
            cache_reads: metrics.cache_reads,
            total_cost: metrics.total_cost,
        })
    }
}

/// The index file under the home directory.
#[derive(Debug, Clone)]
pub struct TaskHistory {
    path: PathBuf,
}

impl TaskHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All entries, newest first.
    pub async fn list(&self) -> Result<Vec<HistoryItem>, PersistenceError> {
        let mut items: Vec<HistoryItem> = read_json_array(&self.path).await?;
        items.sort_by(|a, b| b.ts.cmp(&a.ts));
        Ok(items)
    }

    pub async fn get(&self, id: &str) -> Result<Option<HistoryItem>, PersistenceError> {
        Ok(self.list().await?.into_iter().find(|item| item.id == id))
    }

    /// Inserts or replaces the entry with the same id.
    pub async fn upsert(&self, item: HistoryItem) -> Result<(), PersistenceError> {
        let mut items: Vec<HistoryItem> = read_json_array(&self.path).await?;
        match items.iter_mut().find(|existing| existing.id == item.id) {
            Some(existing) => *existing = item,
            None => items.push(item),
        }
        write_json(&self.path, &items, false).await
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::core::messages::{ApiReqInfo, AskKind, SayKind, UiKind};

    fn say(ts: u64, say: SayKind, text: &str) -> UiMessage {
        UiMessage {
            ts,
            kind: UiKind::Say { say },
            text: Some(text.to_string()),
            images: Vec::new(),
            partial: false,
        }
    }

    /// Summary: task text from the first message, ts skips resume asks.
    #[test]
    fn test_item_from_ui_messages() {
        let info = ApiReqInfo {
            tokens_in: Some(4),
            cost: Some(0.1),
            ..ApiReqInfo::default()
        };
        let messages = vec![
            say(10, SayKind::Task, "fix the build"),
            say(11, SayKind::ApiReqStarted, &info.to_text()),
            UiMessage {
                ts: 12,
                kind: UiKind::Ask {
                    ask: AskKind::ResumeTask,
                },
                text: None,
                images: Vec::new(),
                partial: false,
            },
        ];

        let item = HistoryItem::from_ui_messages("t1", &messages).unwrap();
        assert_eq!(item.task, "fix the build");
        assert_eq!(item.ts, 11);
        assert_eq!(item.tokens_in, 4);
        assert!(HistoryItem::from_ui_messages("t1", &[]).is_none());
    }

    /// Upsert replaces by id; list is newest first.
    #[tokio::test]
    async fn test_upsert_and_list() {
        let dir = tempdir().unwrap();
        let history = TaskHistory::new(dir.path().join("task_history.json"));
        let item = |id: &str, ts| HistoryItem {
            id: id.to_string(),
            ts,
            task: format!("task {id}"),
            tokens_in: 0,
            tokens_out: 0,
            cache_writes: 0,
            cache_reads: 0,
            total_cost: 0.0,
        };

        history.upsert(item("a", 1)).await.unwrap();
        history.upsert(item("b", 2)).await.unwrap();
        history.upsert(item("a", 3)).await.unwrap();

        let items = history.list().await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "a");
        assert_eq!(items[0].ts, 3);
        assert!(history.get("b").await.unwrap().is_some());
        assert!(history.get("c").await.unwrap().is_none());
    }
}
