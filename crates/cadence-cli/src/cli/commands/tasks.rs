//! Task command handlers.

use anyhow::{Context, Result};
use cadence_core::config::paths;
use cadence_core::core::history::TaskHistory;
use cadence_core::core::store::ConversationStore;

use crate::modes::console::format_message;

const TASK_PREVIEW_CHARS: usize = 60;

fn format_timestamp(ts: u64) -> String {
    i64::try_from(ts)
        .ok()
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map_or_else(
            || "unknown".to_string(),
            |dt| dt.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string(),
        )
}

fn preview(task: &str) -> String {
    let first_line = task.lines().next().unwrap_or_default();
    if first_line.chars().count() > TASK_PREVIEW_CHARS {
        let cut: String = first_line.chars().take(TASK_PREVIEW_CHARS).collect();
        format!("{cut}…")
    } else {
        first_line.to_string()
    }
}

pub async fn list() -> Result<()> {
    let items = TaskHistory::new(paths::task_history_path())
        .list()
        .await
        .context("list tasks")?;
    if items.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }
    for item in items {
        println!(
            "{}  {}  ${:.4}  {}",
            item.id,
            format_timestamp(item.ts),
            item.total_cost,
            preview(&item.task)
        );
    }
    Ok(())
}

pub async fn show(id: &str) -> Result<()> {
    let messages = ConversationStore::new(&paths::cadence_home(), id)
        .load_ui_messages()
        .await
        .with_context(|| format!("load task '{id}'"))?;
    if messages.is_empty() {
        println!("Task '{id}' is empty or not found.");
        return Ok(());
    }
    for message in &messages {
        if let Some(line) = format_message(message) {
            println!("{line}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Long or multi-line task texts are cut to one short line.
    #[test]
    fn test_preview() {
        assert_eq!(preview("fix the build\nthen run tests"), "fix the build");
        let long = "x".repeat(80);
        assert_eq!(preview(&long).chars().count(), TASK_PREVIEW_CHARS + 1);
    }

    #[test]
    fn test_format_timestamp_unknown_for_out_of_range() {
        assert_eq!(format_timestamp(u64::MAX), "unknown");
    }
}
