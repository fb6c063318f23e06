//! Model-facing texts fed back as user content.

use std::cmp::Ordering;
use std::path::Path;

use crate::core::messages::{ApiBlock, image_blocks};
use crate::tools::FileEntry;

const TOOL_USE_REMINDER: &str = "# Reminder: Instructions for Tool Use

Tool uses are formatted using XML-style tags. The tool name is enclosed in opening and closing tags, and each parameter is similarly enclosed within its own set of tags. Here's the structure:

<tool_name>
<parameter1_name>value1</parameter1_name>
<parameter2_name>value2</parameter2_name>
...
</tool_name>

For example:

<attempt_completion>
<result>
I have completed the task...
</result>
</attempt_completion>

Always adhere to this format for all tool uses to ensure proper parsing and execution.";

pub const INTERRUPTED_BY_FEEDBACK: &str = "\n\n[Response interrupted by user feedback]";
pub const INTERRUPTED_BY_TOOL_USE: &str = "\n\n[Response interrupted by a tool use result. Only one tool may be used at a time and should be placed at the end of the message.]";
pub const INTERRUPTED_BY_API_ERROR: &str = "\n\n[Response interrupted by API Error]";
pub const INTERRUPTED_BY_USER: &str = "\n\n[Response interrupted by user]";

pub const EMPTY_RESPONSE_ERROR: &str = "Unexpected API Response: The language model did not provide any assistant messages. This may indicate an issue with the API or the model's output.";
pub const EMPTY_RESPONSE_PLACEHOLDER: &str = "Failure: I did not provide a response.";

pub const NO_OUTPUT: &str = "(tool did not return anything)";
pub const INTERRUPTED_TOOL_RESULT: &str =
    "Task was interrupted before this tool call could be completed.";

pub fn tool_denied() -> String {
    "The user denied this operation.".to_string()
}

pub fn tool_denied_with_feedback(feedback: &str) -> String {
    format!(
        "The user denied this operation and provided the following feedback:\n<feedback>\n{feedback}\n</feedback>"
    )
}

pub fn tool_error(error: &str) -> String {
    format!("The tool execution failed with the following error:\n<error>\n{error}\n</error>")
}

pub fn no_tools_used() -> String {
    format!(
        "[ERROR] You did not use a tool in your previous response! Please retry with a tool use.

{TOOL_USE_REMINDER}

# Next Steps

If you have completed the user's task, use the attempt_completion tool.
If you require additional information from the user, use the ask_followup_question tool.
Otherwise, if you have not completed the task and do not need additional information, then proceed with the next step of the task.
(This is an automated message, so do not respond to it conversationally.)"
    )
}

pub fn too_many_mistakes(feedback: &str) -> String {
    format!(
        "You seem to be having trouble proceeding. The user has provided the following feedback to help guide you:\n<feedback>\n{feedback}\n</feedback>"
    )
}

pub fn missing_tool_parameter(param: &str) -> String {
    format!(
        "Missing value for required parameter '{param}'. Please retry with complete response.\n\n{TOOL_USE_REMINDER}"
    )
}

pub fn completion_feedback(feedback: &str) -> String {
    format!(
        "The user has provided feedback on the results. Consider their input to continue the task, and then attempt completion again.\n<feedback>\n{feedback}\n</feedback>"
    )
}

pub fn mistake_limit_guidance() -> &'static str {
    "This may indicate a failure in the model's thought process or inability to use a tool properly, which can be mitigated with some user guidance (e.g. \"Try breaking down the task into smaller steps\")."
}

pub fn skipped_after_rejection(description: &str, partial: bool) -> String {
    if partial {
        format!(
            "Tool {description} was interrupted and not executed due to user rejecting a previous tool."
        )
    } else {
        format!("Skipping tool {description} due to user rejecting a previous tool.")
    }
}

pub fn skipped_after_tool_use(tool: &str) -> String {
    format!(
        "Tool [{tool}] was not executed because a tool has already been used in this message. Only one tool may be used per message. You must assess the first tool's result before proceeding to use the next tool."
    )
}

pub fn command_feedback(output: &str, feedback: &str) -> String {
    format!(
        "Command is still running in the user's terminal.{output}\n\nThe user provided the following feedback:\n<feedback>\n{feedback}\n</feedback>"
    )
}

/// Text result followed by its images.
pub fn tool_result(text: impl Into<String>, images: &[String]) -> Vec<ApiBlock> {
    let mut blocks = vec![ApiBlock::text(text)];
    blocks.extend(image_blocks(images));
    blocks
}

/// Truncates to `max_lines`, keeping the head.
pub fn truncate_output(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.split('\n').collect();
    if lines.len() <= max_lines {
        return output.to_string();
    }
    format!(
        "{}\n\n... Output truncated. Showing {max_lines} of {} lines ...",
        lines[..max_lines].join("\n"),
        lines.len()
    )
}

/// Formats a listing relative to `base`. Entries are grouped under their
/// directory, and at each level plain files come before subdirectories.
pub fn format_files_list(base: &Path, entries: &[FileEntry], did_hit_limit: bool) -> String {
    let mut paths: Vec<String> = entries
        .iter()
        .map(|entry| {
            let relative = entry
                .path
                .strip_prefix(base)
                .unwrap_or(&entry.path)
                .to_string_lossy()
                .replace('\\', "/");
            if entry.is_dir {
                format!("{relative}/")
            } else {
                relative
            }
        })
        .collect();
    paths.sort_by(|a, b| compare_listing_paths(a, b));

    if did_hit_limit {
        format!(
            "{}\n\n(File list truncated. Use list_files on specific subdirectories if you need to explore further.)",
            paths.join("\n")
        )
    } else if paths.is_empty() || (paths.len() == 1 && paths[0].is_empty()) {
        "No files found.".to_string()
    } else {
        paths.join("\n")
    }
}

fn compare_listing_paths(a: &str, b: &str) -> Ordering {
    let a_parts: Vec<&str> = a.split('/').collect();
    let b_parts: Vec<&str> = b.split('/').collect();
    for (i, (a_part, b_part)) in a_parts.iter().zip(&b_parts).enumerate() {
        if a_part != b_part {
            // The entry that ends at this level sorts first.
            if i + 1 == a_parts.len() && i + 1 < b_parts.len() {
                return Ordering::Less;
            }
            if i + 1 == b_parts.len() && i + 1 < a_parts.len() {
                return Ordering::Greater;
            }
            return a_part
                .to_lowercase()
                .cmp(&b_part.to_lowercase())
                .then_with(|| a_part.cmp(b_part));
        }
    }
    a_parts.len().cmp(&b_parts.len())
}
