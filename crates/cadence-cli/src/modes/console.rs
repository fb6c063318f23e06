//! Line-oriented console host.
//!
//! `ConsoleRenderer` turns task events into stdout lines, and `run_console`
//! drives a `TaskHost` from the terminal: asks are answered from stdin (or
//! approved outright with `--yes`) and Ctrl+C aborts the task.
//!
//! # Output contract
//! - Finalized UI messages → stdout, one block per message
//! - Task errors and the closing summary → stderr

use std::collections::HashSet;
use std::io::{BufRead, Stderr, Stdout, Write, stderr, stdout};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use cadence_core::config::{Config, paths};
use cadence_core::core::context::SystemInfo;
use cadence_core::core::dispatcher::Collaborators;
use cadence_core::core::events::{
    EventSender, TaskEvent, TaskEventRx, TaskOutcome, create_event_channel,
};
use cadence_core::core::host::TaskHost;
use cadence_core::core::interrupt;
use cadence_core::core::messages::{
    ApiMetrics, ApiReqInfo, AskDecision, AskKind, SayKind, UiKind, UiMessage,
};
use cadence_core::core::store::ConversationStore;
use cadence_core::core::task::TaskDeps;
use cadence_core::model::{ModelClient, ModelInfo, ScriptedModel};
use cadence_core::tools::{BrowserSession, LocalWorkspace, NoBrowser, NoToolServers, ToolServer};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Options shared by `run` and `resume`.
#[derive(Debug, Clone)]
pub struct ConsoleOptions {
    pub root: PathBuf,
    pub script: PathBuf,
    /// Approve every ask instead of reading stdin.
    pub auto_answer: bool,
}

pub enum ConsoleStart {
    New { text: String, images: Vec<String> },
    Resume { id: String },
}

/// What the renderer tells the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// A finalized ask was shown.
    Ask { ts: u64, kind: AskKind },
    Finished,
}

// ============================================================================
// Rendering
// ============================================================================

/// Label used for a message kind, e.g. `ask:command` or `say:tool`.
fn kind_label(kind: UiKind) -> String {
    let (prefix, name) = match kind {
        UiKind::Ask { ask } => ("ask", serde_json::to_value(ask)),
        UiKind::Say { say } => ("say", serde_json::to_value(say)),
    };
    let name = name
        .ok()
        .and_then(|v| v.as_str().map(ToString::to_string))
        .unwrap_or_default();
    format!("{prefix}:{name}")
}

/// Formats one UI message for display. Returns `None` for messages with
/// nothing to show.
pub fn format_message(message: &UiMessage) -> Option<String> {
    let text = message.text().trim_end();
    let body = match message.say() {
        Some(SayKind::Text) if text.is_empty() => return None,
        Some(SayKind::Text) => text.to_string(),
        Some(SayKind::Task) => format!("Task: {text}"),
        Some(SayKind::CompletionResult) => format!("Result: {text}"),
        Some(SayKind::UserFeedback) => format!("> {text}"),
        Some(SayKind::ApiReqStarted) => {
            let info = ApiReqInfo::from_message(message);
            if info.tokens_in.is_none() && info.cost.is_none() {
                return None;
            }
            format!(
                "[api request] {} in, {} out, ${:.4}",
                info.tokens_in.unwrap_or(0),
                info.tokens_out.unwrap_or(0),
                info.cost.unwrap_or(0.0)
            )
        }
        _ if text.is_empty() => format!("[{}]", kind_label(message.kind)),
        _ => format!("[{}] {text}", kind_label(message.kind)),
    };
    let images = match message.images.len() {
        0 => String::new(),
        1 => " (1 image)".to_string(),
        n => format!(" ({n} images)"),
    };
    Some(format!("{body}{images}"))
}

/// Renders task events and reports asks to the driver.
pub struct ConsoleRenderer {
    stdout: Stdout,
    stderr: Stderr,
    /// Messages already printed, by timestamp.
    printed: HashSet<u64>,
    signals: mpsc::UnboundedSender<Signal>,
}

impl ConsoleRenderer {
    pub fn new(signals: mpsc::UnboundedSender<Signal>) -> Self {
        Self {
            stdout: stdout(),
            stderr: stderr(),
            printed: HashSet::new(),
            signals,
        }
    }

    /// Handles one event. Returns true once the task has finished.
    pub fn handle_event(&mut self, event: &TaskEvent) -> bool {
        match event {
            TaskEvent::MessageAdded { message, .. } | TaskEvent::PartialMessage { message, .. } => {
                self.show(message);
            }
            TaskEvent::StateChanged { messages, .. } => {
                for message in messages {
                    self.show(message);
                }
            }
            TaskEvent::Error {
                kind,
                message,
                details,
            } => {
                let _ = writeln!(self.stderr, "Error ({kind}): {message}");
                if let Some(details) = details {
                    let _ = writeln!(self.stderr, "{details}");
                }
            }
            TaskEvent::TaskFinished { .. } => {
                let _ = self.signals.send(Signal::Finished);
                return true;
            }
        }
        false
    }

    /// Prints a message the first time it is seen finalized.
    fn show(&mut self, message: &UiMessage) {
        // api_req_started is rewritten in place once usage is known
        if message.partial || message.say() == Some(SayKind::ApiReqStarted) {
            return;
        }
        if !self.printed.insert(message.ts) {
            return;
        }
        if let Some(line) = format_message(message) {
            let _ = writeln!(self.stdout, "{line}");
            let _ = self.stdout.flush();
        }
        if let Some(kind) = message.ask() {
            let _ = self.signals.send(Signal::Ask {
                ts: message.ts,
                kind,
            });
        }
    }
}

/// Spawns a renderer that consumes events until the task finishes.
pub fn spawn_console_renderer_task(
    mut rx: TaskEventRx,
    signals: mpsc::UnboundedSender<Signal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut renderer = ConsoleRenderer::new(signals);
        while let Some(event) = rx.recv().await {
            if renderer.handle_event(&event) {
                break;
            }
        }
    })
}

// ============================================================================
// Answers
// ============================================================================

/// Unattended answer: approve everything except retrying a failed request,
/// so a run against an exhausted script still terminates.
pub fn auto_answer(kind: AskKind) -> AskDecision {
    match kind {
        AskKind::ApiReqFailed => AskDecision::no(),
        _ => AskDecision::yes(),
    }
}

/// Maps a line typed at the prompt to a decision. End of input declines.
pub fn parse_answer(line: Option<&str>) -> AskDecision {
    let Some(line) = line.map(str::trim) else {
        return AskDecision::no();
    };
    match line.to_ascii_lowercase().as_str() {
        "" | "y" | "yes" => AskDecision::yes(),
        "n" | "no" => AskDecision::no(),
        _ => AskDecision::message(line),
    }
}

async fn read_answer() -> Result<AskDecision> {
    {
        let mut out = stdout();
        let _ = write!(out, "[Y]es / [n]o / or type feedback: ");
        let _ = out.flush();
    }
    let line = tokio::task::spawn_blocking(|| -> std::io::Result<Option<String>> {
        let mut line = String::new();
        let read = std::io::stdin().lock().read_line(&mut line)?;
        Ok((read > 0).then_some(line))
    })
    .await
    .context("join stdin reader")?
    .context("read answer from stdin")?;
    Ok(parse_answer(line.as_deref()))
}

// ============================================================================
// Driver
// ============================================================================

fn build_host(config: Config, options: &ConsoleOptions, events: EventSender) -> Result<TaskHost> {
    let root = std::fs::canonicalize(&options.root)
        .with_context(|| format!("resolve root {}", options.root.display()))?;
    let model = ScriptedModel::from_file(ModelInfo::from_config(&config), &options.script)?;
    tracing::debug!(model = %config.model, root = %root.display(), "console host ready");

    let deps = TaskDeps {
        model: Arc::new(model) as Arc<dyn ModelClient>,
        collaborators: Collaborators {
            workspace: Arc::new(LocalWorkspace::new(&root)),
            browser: Arc::new(NoBrowser) as Arc<dyn BrowserSession>,
            tool_server: Arc::new(NoToolServers) as Arc<dyn ToolServer>,
        },
        system_info: SystemInfo::detect(root),
        home: paths::cadence_home(),
        config,
    };
    Ok(TaskHost::new(deps, events))
}

/// Answers asks until the task reports it has finished.
async fn drive(
    host: &mut TaskHost,
    signals: &mut mpsc::UnboundedReceiver<Signal>,
    auto_answer: bool,
) -> Result<bool> {
    let mut interrupted = false;
    loop {
        tokio::select! {
            biased;

            () = interrupt::wait_for_interrupt(), if !interrupted => {
                interrupted = true;
                host.abort_task();
            }

            signal = signals.recv() => match signal {
                Some(Signal::Ask { ts, kind }) => {
                    if interrupted || host.pending_ask() != Some(ts) {
                        continue;
                    }
                    let decision = if auto_answer {
                        Some(self::auto_answer(kind))
                    } else {
                        tokio::select! {
                            biased;
                            () = interrupt::wait_for_interrupt() => None,
                            answer = read_answer() => Some(answer?),
                        }
                    };
                    let Some(decision) = decision else {
                        let _ = writeln!(stdout());
                        interrupted = true;
                        host.abort_task();
                        continue;
                    };
                    if let Err(err) = host.respond(decision) {
                        tracing::debug!(ts, error = %err, "answer dropped");
                    }
                }
                Some(Signal::Finished) | None => break,
            },
        }
    }
    Ok(interrupted)
}

/// Runs one task in the console and maps its outcome to a result.
///
/// Completion is `Ok`; an abort surfaces as `InterruptedError` (exit 130).
pub async fn run_console(config: Config, start: ConsoleStart, options: &ConsoleOptions) -> Result<()> {
    let (tx, rx) = create_event_channel();
    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
    let renderer = spawn_console_renderer_task(rx, signal_tx);
    let mut host = build_host(config, options, EventSender::new(tx))?;

    let task_id = match start {
        ConsoleStart::New { text, images } => host
            .start_task(text, images)
            .await
            .context("start task")?,
        ConsoleStart::Resume { id } => {
            host.resume_task(&id)
                .await
                .with_context(|| format!("resume task '{id}'"))?;
            id
        }
    };

    let interrupted = drive(&mut host, &mut signal_rx, options.auto_answer).await?;
    let outcome = host.wait().await.unwrap_or(TaskOutcome::Failed);
    drop(host);
    let _ = renderer.await;

    let messages = ConversationStore::new(&paths::cadence_home(), &task_id)
        .load_ui_messages()
        .await
        .with_context(|| format!("load messages of task '{task_id}'"))?;
    let metrics = ApiMetrics::from_ui_messages(&messages);
    let _ = writeln!(
        stderr(),
        "Task {task_id} {outcome} ({} in, {} out, ${:.4})",
        metrics.tokens_in,
        metrics.tokens_out,
        metrics.total_cost
    );

    match outcome {
        TaskOutcome::Completed => Ok(()),
        TaskOutcome::Aborted if interrupted => Err(interrupt::InterruptedError.into()),
        TaskOutcome::Aborted => bail!("task {task_id} was aborted"),
        TaskOutcome::Failed => bail!("task {task_id} failed"),
    }
}
