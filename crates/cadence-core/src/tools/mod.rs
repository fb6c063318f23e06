//! Tool vocabulary and the collaborators tools act through.
//!
//! The engine only knows tool *names* and *parameters* as they appear in the
//! model's tagged output. The actual work (files, shell, browser, tool
//! servers) happens behind the traits in the submodules.

pub mod browser;
pub mod local;
pub mod servers;
pub mod workspace;

use std::collections::BTreeMap;
use std::fmt;

pub use browser::{BrowserActionResult, BrowserSession, NoBrowser};
pub use local::LocalWorkspace;
pub use servers::{NoToolServers, ResourceResponse, ToolCallResponse, ToolContent, ToolServer};
pub use workspace::{CommandEvent, FileEntry, Workspace};

// ============================================================================
// Names
// ============================================================================

/// Tools the model may invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ToolName {
    ExecuteCommand,
    ReadFile,
    WriteToFile,
    SearchFiles,
    ListFiles,
    ListCodeDefinitionNames,
    BrowserAction,
    UseMcpTool,
    AccessMcpResource,
    AskFollowupQuestion,
    AttemptCompletion,
}

impl ToolName {
    pub const ALL: [ToolName; 11] = [
        ToolName::ExecuteCommand,
        ToolName::ReadFile,
        ToolName::WriteToFile,
        ToolName::SearchFiles,
        ToolName::ListFiles,
        ToolName::ListCodeDefinitionNames,
        ToolName::BrowserAction,
        ToolName::UseMcpTool,
        ToolName::AccessMcpResource,
        ToolName::AskFollowupQuestion,
        ToolName::AttemptCompletion,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ToolName::ExecuteCommand => "execute_command",
            ToolName::ReadFile => "read_file",
            ToolName::WriteToFile => "write_to_file",
            ToolName::SearchFiles => "search_files",
            ToolName::ListFiles => "list_files",
            ToolName::ListCodeDefinitionNames => "list_code_definition_names",
            ToolName::BrowserAction => "browser_action",
            ToolName::UseMcpTool => "use_mcp_tool",
            ToolName::AccessMcpResource => "access_mcp_resource",
            ToolName::AskFollowupQuestion => "ask_followup_question",
            ToolName::AttemptCompletion => "attempt_completion",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|name| name.as_str() == tag)
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameter tags recognized inside a tool block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParamName {
    Command,
    Path,
    Content,
    Regex,
    FilePattern,
    Recursive,
    Action,
    Url,
    Coordinate,
    Text,
    ServerName,
    ToolName,
    Arguments,
    Uri,
    Question,
    Result,
}

impl ParamName {
    pub const ALL: [ParamName; 16] = [
        ParamName::Command,
        ParamName::Path,
        ParamName::Content,
        ParamName::Regex,
        ParamName::FilePattern,
        ParamName::Recursive,
        ParamName::Action,
        ParamName::Url,
        ParamName::Coordinate,
        ParamName::Text,
        ParamName::ServerName,
        ParamName::ToolName,
        ParamName::Arguments,
        ParamName::Uri,
        ParamName::Question,
        ParamName::Result,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ParamName::Command => "command",
            ParamName::Path => "path",
            ParamName::Content => "content",
            ParamName::Regex => "regex",
            ParamName::FilePattern => "file_pattern",
            ParamName::Recursive => "recursive",
            ParamName::Action => "action",
            ParamName::Url => "url",
            ParamName::Coordinate => "coordinate",
            ParamName::Text => "text",
            ParamName::ServerName => "server_name",
            ParamName::ToolName => "tool_name",
            ParamName::Arguments => "arguments",
            ParamName::Uri => "uri",
            ParamName::Question => "question",
            ParamName::Result => "result",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|name| name.as_str() == tag)
    }
}

impl fmt::Display for ParamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type ToolParams = BTreeMap<ParamName, String>;

// ============================================================================
// Descriptions
// ============================================================================

/// Short label used to introduce a tool's result, e.g. `[read_file for 'a.rs']`.
pub fn tool_description(name: ToolName, params: &ToolParams) -> String {
    let param = |p: ParamName| params.get(&p).map_or("", String::as_str);
    match name {
        ToolName::ExecuteCommand => format!("[{name} for '{}']", param(ParamName::Command)),
        ToolName::ReadFile
        | ToolName::WriteToFile
        | ToolName::ListFiles
        | ToolName::ListCodeDefinitionNames => {
            format!("[{name} for '{}']", param(ParamName::Path))
        }
        ToolName::SearchFiles => match params.get(&ParamName::FilePattern) {
            Some(pattern) if !pattern.is_empty() => {
                format!("[{name} for '{}' in '{pattern}']", param(ParamName::Regex))
            }
            _ => format!("[{name} for '{}']", param(ParamName::Regex)),
        },
        ToolName::BrowserAction => format!("[{name} for '{}']", param(ParamName::Action)),
        ToolName::UseMcpTool => format!("[{name} for '{}']", param(ParamName::ServerName)),
        ToolName::AccessMcpResource => {
            format!("[{name} for '{}']", param(ParamName::ServerName))
        }
        ToolName::AskFollowupQuestion => {
            format!("[{name} for '{}']", param(ParamName::Question))
        }
        ToolName::AttemptCompletion => format!("[{name}]"),
    }
}
