//! Cold-start resumption of a saved task.
//!
//! Both logs are cleaned up before the loop is re-entered:
//! - trailing `resume_*` asks from an earlier resumption are dropped,
//! - the last `api_req_started` record is dropped when it never got a cost
//!   or a cancel reason (the request never happened),
//! - native tool blocks are flattened into plain text,
//! - every tool call left without a result gets an "interrupted" result.

use std::collections::HashMap;
use std::path::Path;

use anyhow::bail;

use crate::core::messages::{
    ApiBlock, ApiMessage, ApiReqInfo, AskKind, Role, SayKind, UiMessage, image_blocks,
};
use crate::core::responses::INTERRUPTED_TOOL_RESULT;

/// Interruptions younger than this get the reverted-edit note.
pub const RECENT_INTERRUPTION_MS: u64 = 30_000;

/// Trims what an interrupted run left behind in the UI log.
pub fn clean_ui_messages(mut messages: Vec<UiMessage>) -> Vec<UiMessage> {
    let keep = messages
        .iter()
        .rposition(|m| !m.is_resume_ask())
        .map_or(0, |i| i + 1);
    messages.truncate(keep);

    if let Some(index) = messages
        .iter()
        .rposition(|m| m.say() == Some(SayKind::ApiReqStarted))
    {
        let info = ApiReqInfo::from_message(&messages[index]);
        if info.cost.is_none() && info.cancel_reason.is_none() {
            messages.remove(index);
        }
    }
    messages
}

/// Last message that is not a resume prompt.
pub fn last_relevant_message(messages: &[UiMessage]) -> Option<&UiMessage> {
    messages.iter().rev().find(|m| !m.is_resume_ask())
}

/// `resume_completed_task` when the task stopped at its completion prompt.
pub fn resume_ask_kind(messages: &[UiMessage]) -> AskKind {
    match last_relevant_message(messages).and_then(UiMessage::ask) {
        Some(AskKind::CompletionResult) => AskKind::ResumeCompletedTask,
        _ => AskKind::ResumeTask,
    }
}

/// Human-readable age of an interruption, e.g. "3 hours ago".
pub fn ago_text(now_ms: u64, then_ms: u64) -> String {
    let minutes = now_ms.saturating_sub(then_ms) / 60_000;
    let hours = minutes / 60;
    let days = hours / 24;

    let plural = |n: u64, unit: &str| {
        if n > 1 {
            format!("{n} {unit}s ago")
        } else {
            format!("{n} {unit} ago")
        }
    };
    if days > 0 {
        plural(days, "day")
    } else if hours > 0 {
        plural(hours, "hour")
    } else if minutes > 0 {
        plural(minutes, "minute")
    } else {
        "just now".to_string()
    }
}

/// History to keep plus the user content carried into the next turn.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumedHistory {
    pub history: Vec<ApiMessage>,
    pub carried_content: Vec<ApiBlock>,
}

/// Splits the saved API history for resumption.
///
/// A trailing user message is taken back out of the history and becomes the
/// start of the next turn's content. Tool calls of the last assistant turn
/// that never got a result receive an interrupted placeholder. Everything is
/// then flattened to text, so a second resumption finds nothing to pair.
pub fn prepare_api_history(messages: Vec<ApiMessage>) -> anyhow::Result<ResumedHistory> {
    let names: HashMap<String, String> = messages
        .iter()
        .flat_map(|m| &m.content)
        .filter_map(|block| match block {
            ApiBlock::ToolUse { id, name, .. } => Some((id.clone(), name.clone())),
            _ => None,
        })
        .collect();

    let mut history = messages;
    let Some(last) = history.last() else {
        bail!("the task has no API conversation history");
    };

    let carried = match last.role {
        Role::Assistant => interrupted_results(&last.content, &[]),
        Role::User => {
            let last = history.pop().map(|m| m.content).unwrap_or_default();
            let missing = match history.last() {
                Some(previous) if previous.role == Role::Assistant => {
                    interrupted_results(&previous.content, &last)
                }
                _ => Vec::new(),
            };
            last.into_iter().chain(missing).collect()
        }
    };

    let history = history
        .into_iter()
        .map(|message| ApiMessage {
            role: message.role,
            content: flatten_blocks(message.content, &names),
        })
        .collect();
    Ok(ResumedHistory {
        history,
        carried_content: flatten_blocks(carried, &names),
    })
}

fn interrupted_results(assistant: &[ApiBlock], answered: &[ApiBlock]) -> Vec<ApiBlock> {
    assistant
        .iter()
        .filter_map(|block| match block {
            ApiBlock::ToolUse { id, .. } => Some(id),
            _ => None,
        })
        .filter(|id| {
            !answered.iter().any(
                |b| matches!(b, ApiBlock::ToolResult { tool_use_id, .. } if tool_use_id == *id),
            )
        })
        .map(|id| ApiBlock::ToolResult {
            tool_use_id: id.clone(),
            content: vec![ApiBlock::text(INTERRUPTED_TOOL_RESULT)],
            is_error: false,
        })
        .collect()
}

fn flatten_blocks(blocks: Vec<ApiBlock>, names: &HashMap<String, String>) -> Vec<ApiBlock> {
    blocks
        .into_iter()
        .map(|block| match block {
            ApiBlock::ToolUse { name, input, .. } => {
                let params = input
                    .as_object()
                    .map(|object| {
                        object
                            .iter()
                            .map(|(key, value)| {
                                let value = value
                                    .as_str()
                                    .map_or_else(|| value.to_string(), str::to_string);
                                format!("<{key}>\n{value}\n</{key}>")
                            })
                            .collect::<Vec<_>>()
                            .join("\n")
                    })
                    .unwrap_or_default();
                ApiBlock::text(format!("<{name}>\n{params}\n</{name}>"))
            }
            ApiBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                let text = content
                    .iter()
                    .filter_map(ApiBlock::as_text)
                    .collect::<Vec<_>>()
                    .join("\n\n");
                let tool = names.get(&tool_use_id).map_or("unknown", String::as_str);
                ApiBlock::text(format!("[{tool} Result]\n\n{text}"))
            }
            other => other,
        })
        .collect()
}

/// The `[TASK RESUMPTION]` note for the next turn.
pub fn resumption_text(ago: &str, cwd: &Path, was_recent: bool) -> String {
    let mut text = format!(
        "[TASK RESUMPTION] This task was interrupted {ago}. It may or may not be complete, so please reassess the task context. Be aware that the project state may have changed since then. The current working directory is now '{}'. If the task has not been completed, retry the last step before interruption and proceed with completing the task.\n\nNote: If you previously attempted a tool use that the user did not provide a result for, you should assume the tool use was not successful and assess whether you should retry. If the last tool was a browser_action, the browser has been closed and you must launch a new browser if needed.",
        cwd.display()
    );
    if was_recent {
        text.push_str("\n\nIMPORTANT: If the last tool use was a replace_in_file or write_to_file that was interrupted, the file was reverted back to its original state before the interrupted edit, and you do NOT need to re-read the file as you already have its up-to-date contents.");
    }
    text
}

/// User content of the first resumed turn.
pub fn resumed_user_content(
    carried: Vec<ApiBlock>,
    resumption: String,
    answer: Option<(&str, &[String])>,
) -> Vec<ApiBlock> {
    let mut content = carried;
    match answer {
        Some((text, images)) => {
            content.push(ApiBlock::text(format!(
                "{resumption}\n\nNew instructions for task continuation:\n<user_message>\n{text}\n</user_message>"
            )));
            content.extend(image_blocks(images));
        }
        None => content.push(ApiBlock::text(resumption)),
    }
    content
}
