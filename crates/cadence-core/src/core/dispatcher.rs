//! Tool dispatch: approval gating, execution and mistake tracking.
//!
//! The dispatcher runs one parsed tool block at a time. Partial blocks only
//! stream a preview. Final blocks are validated, approved (automatically or
//! by asking), executed through the collaborators, and turned into result
//! content. Collaborator failures become error-text results; only
//! `TaskError`s from the interaction layer propagate.

use std::future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use serde_json::Value;

use crate::config::{AutoApprovalConfig, Config};
use crate::core::context::ENVIRONMENT_FILES_LIMIT;
use crate::core::interaction::{Messenger, Update};
use crate::core::messages::{ApiBlock, ApprovalDecision, AskDecision, AskKind, SayKind};
use crate::core::parser::{ToolUse, remove_closing_tag};
use crate::core::responses::{
    command_feedback, completion_feedback, format_files_list, missing_tool_parameter, tool_denied,
    tool_denied_with_feedback, tool_error, tool_result, truncate_output,
};
use crate::error::{TaskError, TaskResult};
use crate::tools::workspace::{readable_path, resolve_path};
use crate::tools::{
    BrowserActionResult, BrowserSession, CommandEvent, ParamName, ToolName, ToolServer, Workspace,
};

/// Per-turn flags shared by the presenter and the stream reader.
#[derive(Debug, Default)]
pub struct TurnFlags {
    rejected: AtomicBool,
    used_tool: AtomicBool,
}

impl TurnFlags {
    /// The user denied a tool this turn.
    pub fn rejected(&self) -> bool {
        self.rejected.load(Ordering::SeqCst)
    }

    pub fn set_rejected(&self) {
        self.rejected.store(true, Ordering::SeqCst);
    }

    /// A tool result was already merged this turn.
    pub fn used_tool(&self) -> bool {
        self.used_tool.load(Ordering::SeqCst)
    }

    pub fn set_used_tool(&self) {
        self.used_tool.store(true, Ordering::SeqCst);
    }
}

/// What a tool block produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    /// A preview of a partial block; nothing to merge yet.
    Preview,
    /// Content to merge into the next user turn.
    Result(Vec<ApiBlock>),
    /// The user accepted the completion result.
    TaskCompleted,
}

/// The external collaborators tools act through.
#[derive(Clone)]
pub struct Collaborators {
    pub workspace: Arc<dyn Workspace>,
    pub browser: Arc<dyn BrowserSession>,
    pub tool_server: Arc<dyn ToolServer>,
}

impl Collaborators {
    /// Releases running commands and the browser session.
    pub async fn release(&self) {
        self.workspace.dispose().await;
        if let Err(err) = self.browser.close().await {
            tracing::warn!(error = %err, "failed to close browser");
        }
    }
}

/// Preview payload of file-system tools.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SayTool {
    tool: &'static str,
    path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    regex: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_pattern: Option<String>,
}

impl SayTool {
    fn new(tool: &'static str, path: String) -> Self {
        Self {
            tool,
            path,
            content: None,
            regex: None,
            file_pattern: None,
        }
    }

    #[must_use]
    fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Browser step shown while it runs.
#[derive(Debug, Serialize)]
struct SayBrowserAction<'a> {
    action: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    coordinate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

const BROWSER_ACTIONS: [&str; 6] = ["launch", "click", "type", "scroll_down", "scroll_up", "close"];

pub struct Dispatcher {
    collaborators: Collaborators,
    auto_approval: AutoApprovalConfig,
    command_output_max_lines: usize,
    unescape_html: bool,
    auto_approved: u32,
    mistakes: u32,
}

impl Dispatcher {
    pub fn new(collaborators: Collaborators, config: &Config) -> Self {
        Self {
            collaborators,
            auto_approval: config.auto_approval.clone(),
            command_output_max_lines: config.command_output_max_lines,
            unescape_html: !config.model.contains("claude"),
            auto_approved: 0,
            mistakes: 0,
        }
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// Consecutive mistakes (missing parameters, turns without a tool).
    pub fn mistakes(&self) -> u32 {
        self.mistakes
    }

    pub fn record_mistake(&mut self) {
        self.mistakes += 1;
    }

    pub fn reset_mistakes(&mut self) {
        self.mistakes = 0;
    }

    /// Whether `tool` may run without asking, given the policy and budget.
    pub fn should_auto_approve(&self, tool: ToolName) -> bool {
        if !self.auto_approval.enabled || self.auto_approved >= self.auto_approval.max_requests {
            return false;
        }
        let actions = &self.auto_approval.actions;
        match tool {
            ToolName::ReadFile
            | ToolName::ListFiles
            | ToolName::ListCodeDefinitionNames
            | ToolName::SearchFiles => actions.read_files,
            ToolName::WriteToFile => actions.edit_files,
            ToolName::ExecuteCommand => actions.execute_commands,
            ToolName::BrowserAction => actions.use_browser,
            ToolName::UseMcpTool | ToolName::AccessMcpResource => actions.use_mcp,
            ToolName::AskFollowupQuestion | ToolName::AttemptCompletion => false,
        }
    }

    /// Runs one tool block.
    pub async fn dispatch(
        &mut self,
        m: &Messenger,
        flags: &TurnFlags,
        tool: &ToolUse,
    ) -> TaskResult<ToolOutcome> {
        if tool.name != ToolName::BrowserAction
            && let Err(err) = self.collaborators.browser.close().await
        {
            tracing::warn!(error = %err, "failed to close browser");
        }

        tracing::debug!(tool = %tool.name, partial = tool.partial, "dispatching tool");
        match tool.name {
            ToolName::ReadFile => self.read_file(m, flags, tool).await,
            ToolName::WriteToFile => self.write_to_file(m, flags, tool).await,
            ToolName::ListFiles => self.list_files(m, flags, tool).await,
            ToolName::SearchFiles => self.search_files(m, flags, tool).await,
            ToolName::ListCodeDefinitionNames => self.list_code_definitions(m, flags, tool).await,
            ToolName::ExecuteCommand => self.execute_command(m, flags, tool).await,
            ToolName::BrowserAction => self.browser_action(m, flags, tool).await,
            ToolName::UseMcpTool => self.use_mcp_tool(m, flags, tool).await,
            ToolName::AccessMcpResource => self.access_mcp_resource(m, flags, tool).await,
            ToolName::AskFollowupQuestion => self.ask_followup_question(m, tool).await,
            ToolName::AttemptCompletion => self.attempt_completion(m, flags, tool).await,
        }
    }

    // ========================================================================
    // Shared steps
    // ========================================================================

    fn cwd(&self) -> PathBuf {
        self.collaborators.workspace.root().to_path_buf()
    }

    fn readable(&self, tool: &ToolUse, param: ParamName) -> String {
        let raw = remove_closing_tag(param, tool.param(param).unwrap_or_default(), tool.partial);
        readable_path(&self.cwd(), &raw)
    }

    /// Streams a preview: a partial say when auto-approved, else a partial ask.
    async fn preview(
        &self,
        m: &Messenger,
        tool: ToolName,
        ask: AskKind,
        say: SayKind,
        text: String,
    ) -> TaskResult<ToolOutcome> {
        if self.should_auto_approve(tool) {
            m.say_streaming(say, text, true).await?;
        } else {
            m.ask_partial(ask, text).await?;
        }
        Ok(ToolOutcome::Preview)
    }

    /// Auto-approves or asks. Returns the denial result when not approved.
    async fn approve(
        &mut self,
        m: &Messenger,
        flags: &TurnFlags,
        tool: ToolName,
        ask: AskKind,
        say: SayKind,
        text: String,
    ) -> TaskResult<Option<Vec<ApiBlock>>> {
        if self.should_auto_approve(tool) {
            m.say_full(say, Some(text), Vec::new(), Update::Final).await?;
            self.auto_approved += 1;
            tracing::debug!(tool = %tool, count = self.auto_approved, "auto-approved");
            return Ok(None);
        }
        self.ask_approval(m, flags, ask, text).await
    }

    async fn ask_approval(
        &mut self,
        m: &Messenger,
        flags: &TurnFlags,
        ask: AskKind,
        text: String,
    ) -> TaskResult<Option<Vec<ApiBlock>>> {
        let decision = m.ask_full(ask, Some(text), Update::Final).await?;
        self.auto_approved = 0;
        match decision.approval() {
            ApprovalDecision::Approve => Ok(None),
            ApprovalDecision::Deny => {
                flags.set_rejected();
                Ok(Some(vec![ApiBlock::text(tool_denied())]))
            }
            ApprovalDecision::DenyWithFeedback { text, images } => {
                m.say_with_images(SayKind::UserFeedback, text.clone(), images.clone())
                    .await?;
                flags.set_rejected();
                Ok(Some(tool_result(tool_denied_with_feedback(&text), &images)))
            }
        }
    }

    async fn missing_param(
        &mut self,
        m: &Messenger,
        tool: ToolName,
        param: ParamName,
        rel_path: Option<&str>,
    ) -> TaskResult<ToolOutcome> {
        self.mistakes += 1;
        let target = rel_path.map(|p| format!(" for '{p}'")).unwrap_or_default();
        m.say(
            SayKind::Error,
            format!(
                "Cadence tried to use {tool}{target} without value for required parameter '{param}'. Retrying..."
            ),
        )
        .await?;
        tracing::info!(tool = %tool, param = %param, mistakes = self.mistakes, "missing tool parameter");
        Ok(ToolOutcome::Result(vec![ApiBlock::text(tool_error(
            &missing_tool_parameter(param.as_str()),
        ))]))
    }

    async fn handle_error(
        &self,
        m: &Messenger,
        action: &str,
        err: &anyhow::Error,
    ) -> TaskResult<ToolOutcome> {
        tracing::warn!(error = %err, action, "tool failed");
        m.say(SayKind::Error, format!("Error {action}:\n{err:#}"))
            .await?;
        Ok(ToolOutcome::Result(vec![ApiBlock::text(tool_error(
            &format!("Error {action}: {err:#}"),
        ))]))
    }

    // ========================================================================
    // File tools
    // ========================================================================

    async fn read_file(
        &mut self,
        m: &Messenger,
        flags: &TurnFlags,
        tool: &ToolUse,
    ) -> TaskResult<ToolOutcome> {
        let message = SayTool::new("readFile", self.readable(tool, ParamName::Path));
        if tool.partial {
            return self
                .preview(m, tool.name, AskKind::Tool, SayKind::Tool, message.to_text())
                .await;
        }
        let Some(rel_path) = tool.param(ParamName::Path).filter(|p| !p.is_empty()) else {
            return self.missing_param(m, tool.name, ParamName::Path, None).await;
        };
        self.mistakes = 0;

        let absolute = resolve_path(&self.cwd(), rel_path);
        let message = message.with_content(absolute.display().to_string());
        if let Some(denied) = self
            .approve(m, flags, tool.name, AskKind::Tool, SayKind::Tool, message.to_text())
            .await?
        {
            return Ok(ToolOutcome::Result(denied));
        }

        match self.collaborators.workspace.read_file(&absolute).await {
            Ok(content) => Ok(ToolOutcome::Result(vec![ApiBlock::text(content)])),
            Err(err) => self.handle_error(m, "reading file", &err).await,
        }
    }

    async fn write_to_file(
        &mut self,
        m: &Messenger,
        flags: &TurnFlags,
        tool: &ToolUse,
    ) -> TaskResult<ToolOutcome> {
        let rel_path = tool.param(ParamName::Path).filter(|p| !p.is_empty());
        let content = tool.param(ParamName::Content).filter(|c| !c.is_empty());
        let (Some(rel_path), Some(content)) = (rel_path, content) else {
            if tool.partial {
                return Ok(ToolOutcome::Preview);
            }
            return match rel_path {
                None => self.missing_param(m, tool.name, ParamName::Path, None).await,
                Some(path) => {
                    self.missing_param(m, tool.name, ParamName::Content, Some(path))
                        .await
                }
            };
        };

        let absolute = resolve_path(&self.cwd(), rel_path);
        let exists = self.collaborators.workspace.file_exists(&absolute).await;
        let mut new_content = strip_code_fences(content);
        if self.unescape_html {
            new_content = unescape_html_entities(&new_content);
        }
        let message = SayTool::new(
            if exists {
                "editedExistingFile"
            } else {
                "newFileCreated"
            },
            self.readable(tool, ParamName::Path),
        );
        let message = if exists {
            message
        } else {
            message.with_content(new_content.clone())
        };

        if tool.partial {
            return self
                .preview(m, tool.name, AskKind::Tool, SayKind::Tool, message.to_text())
                .await;
        }
        self.mistakes = 0;

        if let Some(denied) = self
            .approve(m, flags, tool.name, AskKind::Tool, SayKind::Tool, message.to_text())
            .await?
        {
            return Ok(ToolOutcome::Result(denied));
        }

        match self
            .collaborators
            .workspace
            .write_file(&absolute, &new_content)
            .await
        {
            Ok(()) => Ok(ToolOutcome::Result(vec![ApiBlock::text(format!(
                "The content was successfully saved to {rel_path}.\n\nHere is the full, updated content of the file:\n\n<final_file_content path=\"{rel_path}\">\n{new_content}\n</final_file_content>\n\n"
            ))])),
            Err(err) => self.handle_error(m, "writing file", &err).await,
        }
    }

    async fn list_files(
        &mut self,
        m: &Messenger,
        flags: &TurnFlags,
        tool: &ToolUse,
    ) -> TaskResult<ToolOutcome> {
        let recursive = tool
            .param(ParamName::Recursive)
            .is_some_and(|r| r.eq_ignore_ascii_case("true"));
        let message = SayTool::new(
            if recursive {
                "listFilesRecursive"
            } else {
                "listFilesTopLevel"
            },
            self.readable(tool, ParamName::Path),
        );
        if tool.partial {
            let message = message.with_content("");
            return self
                .preview(m, tool.name, AskKind::Tool, SayKind::Tool, message.to_text())
                .await;
        }
        let Some(rel_path) = tool.param(ParamName::Path).filter(|p| !p.is_empty()) else {
            return self.missing_param(m, tool.name, ParamName::Path, None).await;
        };
        self.mistakes = 0;

        let absolute = resolve_path(&self.cwd(), rel_path);
        let listing = match self
            .collaborators
            .workspace
            .list_files(&absolute, recursive, ENVIRONMENT_FILES_LIMIT)
            .await
        {
            Ok((entries, hit_limit)) => format_files_list(&absolute, &entries, hit_limit),
            Err(err) => return self.handle_error(m, "listing files", &err).await,
        };

        let message = message.with_content(listing.clone());
        if let Some(denied) = self
            .approve(m, flags, tool.name, AskKind::Tool, SayKind::Tool, message.to_text())
            .await?
        {
            return Ok(ToolOutcome::Result(denied));
        }
        Ok(ToolOutcome::Result(vec![ApiBlock::text(listing)]))
    }

    async fn search_files(
        &mut self,
        m: &Messenger,
        flags: &TurnFlags,
        tool: &ToolUse,
    ) -> TaskResult<ToolOutcome> {
        let mut message = SayTool::new("searchFiles", self.readable(tool, ParamName::Path));
        message.regex = Some(remove_closing_tag(
            ParamName::Regex,
            tool.param(ParamName::Regex).unwrap_or_default(),
            tool.partial,
        ));
        message.file_pattern = tool
            .param(ParamName::FilePattern)
            .map(|p| remove_closing_tag(ParamName::FilePattern, p, tool.partial));
        if tool.partial {
            let message = message.with_content("");
            return self
                .preview(m, tool.name, AskKind::Tool, SayKind::Tool, message.to_text())
                .await;
        }
        let Some(rel_path) = tool.param(ParamName::Path).filter(|p| !p.is_empty()) else {
            return self.missing_param(m, tool.name, ParamName::Path, None).await;
        };
        let Some(regex) = tool.param(ParamName::Regex).filter(|r| !r.is_empty()) else {
            return self
                .missing_param(m, tool.name, ParamName::Regex, Some(rel_path))
                .await;
        };
        self.mistakes = 0;

        let absolute = resolve_path(&self.cwd(), rel_path);
        let results = match self
            .collaborators
            .workspace
            .search_files(&absolute, regex, tool.param(ParamName::FilePattern))
            .await
        {
            Ok(results) => results,
            Err(err) => return self.handle_error(m, "searching files", &err).await,
        };

        let message = message.with_content(results.clone());
        if let Some(denied) = self
            .approve(m, flags, tool.name, AskKind::Tool, SayKind::Tool, message.to_text())
            .await?
        {
            return Ok(ToolOutcome::Result(denied));
        }
        Ok(ToolOutcome::Result(vec![ApiBlock::text(results)]))
    }

    async fn list_code_definitions(
        &mut self,
        m: &Messenger,
        flags: &TurnFlags,
        tool: &ToolUse,
    ) -> TaskResult<ToolOutcome> {
        let message = SayTool::new(
            "listCodeDefinitionNames",
            self.readable(tool, ParamName::Path),
        );
        if tool.partial {
            let message = message.with_content("");
            return self
                .preview(m, tool.name, AskKind::Tool, SayKind::Tool, message.to_text())
                .await;
        }
        let Some(rel_path) = tool.param(ParamName::Path).filter(|p| !p.is_empty()) else {
            return self.missing_param(m, tool.name, ParamName::Path, None).await;
        };
        self.mistakes = 0;

        let absolute = resolve_path(&self.cwd(), rel_path);
        let definitions = match self
            .collaborators
            .workspace
            .list_code_definitions(&absolute)
            .await
        {
            Ok(definitions) => definitions,
            Err(err) => {
                return self
                    .handle_error(m, "parsing source code definitions", &err)
                    .await;
            }
        };

        let message = message.with_content(definitions.clone());
        if let Some(denied) = self
            .approve(m, flags, tool.name, AskKind::Tool, SayKind::Tool, message.to_text())
            .await?
        {
            return Ok(ToolOutcome::Result(denied));
        }
        Ok(ToolOutcome::Result(vec![ApiBlock::text(definitions)]))
    }

    // ========================================================================
    // Commands
    // ========================================================================

    async fn execute_command(
        &mut self,
        m: &Messenger,
        flags: &TurnFlags,
        tool: &ToolUse,
    ) -> TaskResult<ToolOutcome> {
        let command = tool.param(ParamName::Command).unwrap_or_default();
        if tool.partial {
            m.ask_partial(
                AskKind::Command,
                remove_closing_tag(ParamName::Command, command, true),
            )
            .await?;
            return Ok(ToolOutcome::Preview);
        }
        if command.is_empty() {
            return self
                .missing_param(m, tool.name, ParamName::Command, None)
                .await;
        }
        self.mistakes = 0;

        if let Some(denied) = self
            .approve(
                m,
                flags,
                tool.name,
                AskKind::Command,
                SayKind::Command,
                command.to_string(),
            )
            .await?
        {
            return Ok(ToolOutcome::Result(denied));
        }
        self.run_command(m, flags, command).await
    }

    /// Runs `command` until it completes or the task is aborted.
    ///
    /// Output lines are posted as `command_output` asks, each superseding the
    /// last. Approving one lets the command run to completion with its output
    /// said instead. Any other answer stops waiting: the command keeps running
    /// in the background and the answer goes back to the model as feedback.
    async fn run_command(
        &self,
        m: &Messenger,
        flags: &TurnFlags,
        command: &str,
    ) -> TaskResult<ToolOutcome> {
        let mut rx = match self.collaborators.workspace.run_command(command).await {
            Ok(rx) => rx,
            Err(err) => return self.handle_error(m, "executing command", &err).await,
        };

        let mut output = String::new();
        let mut exit = None;
        let mut pending: Option<Pin<Box<dyn Future<Output = TaskResult<AskDecision>> + Send>>> =
            None;
        let mut proceeding = false;
        let feedback = loop {
            let answer = async {
                match pending.as_mut() {
                    Some(waiter) => waiter.await,
                    None => future::pending().await,
                }
            };
            let event = tokio::select! {
                biased;
                () = m.abort_token().cancelled() => return Err(TaskError::Aborted),
                decision = answer => Err(decision),
                event = rx.recv() => Ok(event),
            };
            match event {
                Ok(Some(CommandEvent::Line(line))) => {
                    output.push_str(&line);
                    output.push('\n');
                    if proceeding {
                        m.say(SayKind::CommandOutput, line).await?;
                    } else {
                        let posted = m.post_ask(AskKind::CommandOutput, line).await?;
                        pending = Some(Box::pin(posted.decision()));
                    }
                }
                Ok(Some(CommandEvent::Completed { exit_code })) => {
                    exit = Some(exit_code);
                    break None;
                }
                Ok(None) => break None,
                Err(decision) => {
                    pending = None;
                    let decision = decision?;
                    match decision.approval() {
                        ApprovalDecision::Approve => proceeding = true,
                        ApprovalDecision::Deny => break Some((String::new(), Vec::new())),
                        ApprovalDecision::DenyWithFeedback { text, images } => {
                            break Some((text, images));
                        }
                    }
                }
            }
        };
        if pending.is_some() {
            m.withdraw_ask();
        }

        let summary = truncate_output(output.trim(), self.command_output_max_lines);
        let summary = if summary.is_empty() {
            String::new()
        } else {
            format!("\nOutput:\n{summary}")
        };

        if let Some((text, images)) = feedback {
            tracing::debug!(command, "stopped waiting on command after user feedback");
            // Dropping the receiver would kill the process.
            tokio::spawn(async move { while rx.recv().await.is_some() {} });
            if !text.is_empty() || !images.is_empty() {
                m.say_with_images(SayKind::UserFeedback, text.clone(), images.clone())
                    .await?;
            }
            flags.set_rejected();
            return Ok(ToolOutcome::Result(tool_result(
                command_feedback(&summary, &text),
                &images,
            )));
        }

        tracing::debug!(command, exit = ?exit, "command finished");
        let text = match exit {
            Some(Some(code)) if code != 0 => {
                format!("Command executed with exit code {code}.{summary}")
            }
            Some(_) => format!("Command executed.{summary}"),
            None => format!("Command stopped before reporting completion.{summary}"),
        };
        Ok(ToolOutcome::Result(vec![ApiBlock::text(text)]))
    }

    // ========================================================================
    // Browser
    // ========================================================================

    async fn browser_action(
        &mut self,
        m: &Messenger,
        flags: &TurnFlags,
        tool: &ToolUse,
    ) -> TaskResult<ToolOutcome> {
        let Some(action) = tool
            .param(ParamName::Action)
            .filter(|a| BROWSER_ACTIONS.contains(a))
        else {
            if tool.partial {
                return Ok(ToolOutcome::Preview);
            }
            return self
                .missing_param(m, tool.name, ParamName::Action, None)
                .await;
        };
        let url = tool.param(ParamName::Url).filter(|u| !u.is_empty());
        let coordinate = tool.param(ParamName::Coordinate).filter(|c| !c.is_empty());
        let text = tool.param(ParamName::Text).filter(|t| !t.is_empty());

        if tool.partial {
            if action == "launch" {
                let url = remove_closing_tag(ParamName::Url, url.unwrap_or_default(), true);
                return self
                    .preview(
                        m,
                        tool.name,
                        AskKind::BrowserActionLaunch,
                        SayKind::BrowserActionLaunch,
                        url,
                    )
                    .await;
            }
            let step = SayBrowserAction {
                action,
                coordinate: coordinate.map(|c| remove_closing_tag(ParamName::Coordinate, c, true)),
                text: text.map(|t| remove_closing_tag(ParamName::Text, t, true)),
            };
            m.say_streaming(SayKind::BrowserAction, to_json(&step), true)
                .await?;
            return Ok(ToolOutcome::Preview);
        }

        let browser = Arc::clone(&self.collaborators.browser);
        let result = match action {
            "launch" => {
                let Some(url) = url else {
                    return self.missing_param(m, tool.name, ParamName::Url, None).await;
                };
                self.mistakes = 0;
                if let Some(denied) = self
                    .approve(
                        m,
                        flags,
                        tool.name,
                        AskKind::BrowserActionLaunch,
                        SayKind::BrowserActionLaunch,
                        url.to_string(),
                    )
                    .await?
                {
                    return Ok(ToolOutcome::Result(denied));
                }
                m.say(SayKind::BrowserActionResult, "").await?;
                browser.launch(url).await
            }
            _ => {
                if action == "click" && coordinate.is_none() {
                    return self
                        .missing_param(m, tool.name, ParamName::Coordinate, None)
                        .await;
                }
                if action == "type" && text.is_none() {
                    return self.missing_param(m, tool.name, ParamName::Text, None).await;
                }
                self.mistakes = 0;
                let step = SayBrowserAction {
                    action,
                    coordinate: coordinate.map(str::to_string),
                    text: text.map(str::to_string),
                };
                m.say_full(
                    SayKind::BrowserAction,
                    Some(to_json(&step)),
                    Vec::new(),
                    Update::Final,
                )
                .await?;
                match action {
                    "click" => browser.click(coordinate.unwrap_or_default()).await,
                    "type" => browser.type_text(text.unwrap_or_default()).await,
                    "scroll_down" => browser.scroll_down().await,
                    "scroll_up" => browser.scroll_up().await,
                    _ => browser.close().await.map(|()| BrowserActionResult::default()),
                }
            }
        };

        let result = match result {
            Ok(result) => result,
            Err(err) => {
                if let Err(close_err) = browser.close().await {
                    tracing::warn!(error = %close_err, "failed to close browser");
                }
                return self
                    .handle_error(m, "executing browser action", &err)
                    .await;
            }
        };

        if action == "close" {
            return Ok(ToolOutcome::Result(vec![ApiBlock::text(
                "The browser has been closed. You may now proceed to using other tools.",
            )]));
        }
        m.say(SayKind::BrowserActionResult, to_json(&result)).await?;
        let logs = result
            .logs
            .as_deref()
            .filter(|l| !l.is_empty())
            .unwrap_or("(No new logs)");
        let screenshots: Vec<String> = result.screenshot.iter().cloned().collect();
        Ok(ToolOutcome::Result(tool_result(
            format!(
                "The browser action has been executed. The console logs and screenshot have been captured for your analysis.\n\nConsole logs:\n{logs}\n\n(REMEMBER: if you need to proceed to using non-`browser_action` tools or launch a new browser, you MUST first close this browser. For example, if after analyzing the logs and screenshot you need to edit a file, you must first close the browser before you can use the write_to_file tool.)"
            ),
            &screenshots,
        )))
    }

    // ========================================================================
    // Tool servers
    // ========================================================================

    async fn use_mcp_tool(
        &mut self,
        m: &Messenger,
        flags: &TurnFlags,
        tool: &ToolUse,
    ) -> TaskResult<ToolOutcome> {
        let server = tool.param(ParamName::ServerName).unwrap_or_default();
        let tool_name = tool.param(ParamName::ToolName).unwrap_or_default();
        let arguments = tool.param(ParamName::Arguments).filter(|a| !a.is_empty());
        let request = |arguments: &str| {
            to_json(&serde_json::json!({
                "type": "use_mcp_tool",
                "serverName": server,
                "toolName": tool_name,
                "arguments": arguments,
            }))
        };
        if tool.partial {
            return self
                .preview(
                    m,
                    tool.name,
                    AskKind::UseMcpServer,
                    SayKind::UseMcpServer,
                    request(arguments.unwrap_or_default()),
                )
                .await;
        }
        if server.is_empty() {
            return self
                .missing_param(m, tool.name, ParamName::ServerName, None)
                .await;
        }
        if tool_name.is_empty() {
            return self
                .missing_param(m, tool.name, ParamName::ToolName, None)
                .await;
        }
        let parsed: Option<Value> = match arguments.map(serde_json::from_str).transpose() {
            Ok(parsed) => parsed,
            Err(err) => {
                self.mistakes += 1;
                tracing::info!(error = %err, tool = tool_name, "invalid tool arguments");
                m.say(
                    SayKind::Error,
                    format!("Cadence tried to use {tool_name} with an invalid JSON argument. Retrying..."),
                )
                .await?;
                return Ok(ToolOutcome::Result(vec![ApiBlock::text(tool_error(
                    &format!("Invalid JSON argument for tool {tool_name} on server {server}"),
                ))]));
            }
        };
        self.mistakes = 0;

        if let Some(denied) = self
            .approve(
                m,
                flags,
                tool.name,
                AskKind::UseMcpServer,
                SayKind::UseMcpServer,
                request(arguments.unwrap_or_default()),
            )
            .await?
        {
            return Ok(ToolOutcome::Result(denied));
        }

        m.say(SayKind::McpServerRequestStarted, "").await?;
        let response = match self
            .collaborators
            .tool_server
            .call_tool(server, tool_name, parsed)
            .await
        {
            Ok(response) => response.to_text(),
            Err(err) => return self.handle_error(m, "executing MCP tool", &err).await,
        };
        m.say(SayKind::McpServerResponse, response.clone()).await?;
        Ok(ToolOutcome::Result(vec![ApiBlock::text(response)]))
    }

    async fn access_mcp_resource(
        &mut self,
        m: &Messenger,
        flags: &TurnFlags,
        tool: &ToolUse,
    ) -> TaskResult<ToolOutcome> {
        let server = tool.param(ParamName::ServerName).unwrap_or_default();
        let uri = tool.param(ParamName::Uri).unwrap_or_default();
        let request = to_json(&serde_json::json!({
            "type": "access_mcp_resource",
            "serverName": server,
            "uri": uri,
        }));
        if tool.partial {
            return self
                .preview(
                    m,
                    tool.name,
                    AskKind::UseMcpServer,
                    SayKind::UseMcpServer,
                    request,
                )
                .await;
        }
        if server.is_empty() {
            return self
                .missing_param(m, tool.name, ParamName::ServerName, None)
                .await;
        }
        if uri.is_empty() {
            return self.missing_param(m, tool.name, ParamName::Uri, None).await;
        }
        self.mistakes = 0;

        if let Some(denied) = self
            .approve(
                m,
                flags,
                tool.name,
                AskKind::UseMcpServer,
                SayKind::UseMcpServer,
                request,
            )
            .await?
        {
            return Ok(ToolOutcome::Result(denied));
        }

        m.say(SayKind::McpServerRequestStarted, "").await?;
        let response = match self
            .collaborators
            .tool_server
            .read_resource(server, uri)
            .await
        {
            Ok(response) => response.to_text(),
            Err(err) => return self.handle_error(m, "accessing MCP resource", &err).await,
        };
        m.say(SayKind::McpServerResponse, response.clone()).await?;
        Ok(ToolOutcome::Result(vec![ApiBlock::text(response)]))
    }

    // ========================================================================
    // Conversation tools
    // ========================================================================

    async fn ask_followup_question(
        &mut self,
        m: &Messenger,
        tool: &ToolUse,
    ) -> TaskResult<ToolOutcome> {
        let question = tool.param(ParamName::Question).unwrap_or_default();
        if tool.partial {
            m.ask_partial(
                AskKind::Followup,
                remove_closing_tag(ParamName::Question, question, true),
            )
            .await?;
            return Ok(ToolOutcome::Preview);
        }
        if question.is_empty() {
            return self
                .missing_param(m, tool.name, ParamName::Question, None)
                .await;
        }
        self.mistakes = 0;

        let answer = m
            .ask_full(AskKind::Followup, Some(question.to_string()), Update::Final)
            .await?;
        let text = answer.text.unwrap_or_default();
        m.say_with_images(SayKind::UserFeedback, text.clone(), answer.images.clone())
            .await?;
        Ok(ToolOutcome::Result(tool_result(
            format!("<answer>\n{text}\n</answer>"),
            &answer.images,
        )))
    }

    async fn attempt_completion(
        &mut self,
        m: &Messenger,
        flags: &TurnFlags,
        tool: &ToolUse,
    ) -> TaskResult<ToolOutcome> {
        let result = tool.param(ParamName::Result).unwrap_or_default();
        let command = tool.param(ParamName::Command).filter(|c| !c.is_empty());

        if tool.partial {
            let shown = remove_closing_tag(ParamName::Result, result, true);
            match command {
                Some(command) => {
                    let asking_command = m
                        .last_message()
                        .await
                        .is_some_and(|last| last.ask() == Some(AskKind::Command));
                    if !asking_command {
                        m.say_full(
                            SayKind::CompletionResult,
                            Some(shown),
                            Vec::new(),
                            Update::Final,
                        )
                        .await?;
                    }
                    m.ask_partial(
                        AskKind::Command,
                        remove_closing_tag(ParamName::Command, command, true),
                    )
                    .await?;
                }
                None => {
                    m.say_streaming(SayKind::CompletionResult, shown, true)
                        .await?;
                }
            }
            return Ok(ToolOutcome::Preview);
        }

        if result.is_empty() {
            return self
                .missing_param(m, tool.name, ParamName::Result, None)
                .await;
        }
        self.mistakes = 0;
        if self.auto_approval.enabled && self.auto_approval.enable_notifications {
            tracing::info!(task_id = %m.task_id(), result = %result.replace('\n', " "), "task completed");
        }

        let mut command_result = Vec::new();
        if let Some(command) = command {
            m.say_full(
                SayKind::CompletionResult,
                Some(result.to_string()),
                Vec::new(),
                Update::Final,
            )
            .await?;
            if let Some(denied) = self
                .ask_approval(m, flags, AskKind::Command, command.to_string())
                .await?
            {
                return Ok(ToolOutcome::Result(denied));
            }
            if let ToolOutcome::Result(blocks) = self.run_command(m, flags, command).await? {
                command_result = blocks;
            }
        } else {
            m.say_streaming(SayKind::CompletionResult, result, false)
                .await?;
        }

        // An empty ask hands the conversation back to the user.
        let decision = m.ask(AskKind::CompletionResult, "").await?;
        if decision.approval() == ApprovalDecision::Approve {
            tracing::info!(task_id = %m.task_id(), "completion accepted");
            return Ok(ToolOutcome::TaskCompleted);
        }
        let feedback = decision.text.unwrap_or_default();
        m.say_with_images(SayKind::UserFeedback, feedback.clone(), decision.images.clone())
            .await?;

        let mut blocks = command_result;
        blocks.extend(tool_result(completion_feedback(&feedback), &decision.images));
        Ok(ToolOutcome::Result(blocks))
    }
}

/// Drops markdown fences some models wrap file content in, and trailing
/// whitespace.
fn strip_code_fences(content: &str) -> String {
    let mut content = content.to_string();
    if content.starts_with("```") {
        content = content
            .split('\n')
            .skip(1)
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string();
    }
    if content.ends_with("```") {
        let lines: Vec<&str> = content.split('\n').collect();
        content = lines[..lines.len() - 1].join("\n").trim().to_string();
    }
    content.trim_end().to_string()
}

/// Models other than Claude sometimes HTML-escape file content.
fn unescape_html_entities(content: &str) -> String {
    content
        .replace("&gt;", ">")
        .replace("&lt;", "<")
        .replace("&quot;", "\"")
}

fn to_json(value: &impl Serialize) -> String {
    serde_json::to_string(value).unwrap_or_default()
}
