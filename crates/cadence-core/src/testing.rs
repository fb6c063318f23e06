//! In-memory collaborators and fixtures shared by the unit tests.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::events::{EventSender, TaskEvent, create_event_channel};
use crate::core::interaction::{AskResponder, Messenger};
use crate::core::messages::AskDecision;
use crate::core::store::ConversationStore;
use crate::tools::servers::ResourceContent;
use crate::tools::{
    BrowserActionResult, BrowserSession, CommandEvent, FileEntry, ResourceResponse,
    ToolCallResponse, ToolContent, ToolServer, Workspace,
};

pub const SCREENSHOT: &str = "data:image/png;base64,iVBORw0KGgo=";

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Workspace
// ============================================================================

/// Workspace backed by a map of relative paths to contents.
pub struct FakeWorkspace {
    root: PathBuf,
    files: Mutex<BTreeMap<String, String>>,
    commands: HashMap<String, (Vec<String>, Option<i32>)>,
    running: Mutex<Vec<mpsc::Sender<CommandEvent>>>,
    calls: Mutex<Vec<String>>,
    disposed: AtomicBool,
}

impl FakeWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            files: Mutex::new(BTreeMap::new()),
            commands: HashMap::new(),
            running: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn with_file(self, path: &str, content: &str) -> Self {
        lock(&self.files).insert(path.to_string(), content.to_string());
        self
    }

    /// Scripts the output and exit code of `command`.
    #[must_use]
    pub fn with_command_output(mut self, command: &str, lines: &[&str], exit_code: i32) -> Self {
        self.commands.insert(
            command.to_string(),
            (lines.iter().map(ToString::to_string).collect(), Some(exit_code)),
        );
        self
    }

    /// Scripts a command that prints `lines` and keeps running until
    /// `emit` completes it.
    #[must_use]
    pub fn with_running_command(mut self, command: &str, lines: &[&str]) -> Self {
        self.commands.insert(
            command.to_string(),
            (lines.iter().map(ToString::to_string).collect(), None),
        );
        self
    }

    /// Sends `event` to every command still running.
    pub async fn emit(&self, event: CommandEvent) {
        let running = lock(&self.running).clone();
        for tx in running {
            let _ = tx.send(event.clone()).await;
        }
    }

    pub fn file(&self, path: &str) -> Option<String> {
        lock(&self.files).get(path).cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }

    fn record(&self, call: String) {
        lock(&self.calls).push(call);
    }
}

#[async_trait]
impl Workspace for FakeWorkspace {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn read_file(&self, path: &Path) -> Result<String> {
        let relative = self.relative(path);
        self.record(format!("read {relative}"));
        match self.file(&relative) {
            Some(content) => Ok(content),
            None => bail!("File not found: {}", path.display()),
        }
    }

    async fn file_exists(&self, path: &Path) -> bool {
        lock(&self.files).contains_key(&self.relative(path))
    }

    async fn write_file(&self, path: &Path, content: &str) -> Result<()> {
        let relative = self.relative(path);
        self.record(format!("write {relative}"));
        lock(&self.files).insert(relative, content.to_string());
        Ok(())
    }

    async fn list_files(
        &self,
        path: &Path,
        recursive: bool,
        limit: usize,
    ) -> Result<(Vec<FileEntry>, bool)> {
        let files = lock(&self.files);
        let matching: Vec<FileEntry> = files
            .keys()
            .map(|relative| self.root.join(relative))
            .filter(|full| {
                if recursive {
                    full.starts_with(path)
                } else {
                    full.parent() == Some(path)
                }
            })
            .map(|full| FileEntry {
                path: full,
                is_dir: false,
            })
            .collect();
        let hit_limit = matching.len() > limit;
        Ok((matching.into_iter().take(limit).collect(), hit_limit))
    }

    async fn search_files(
        &self,
        _path: &Path,
        regex: &str,
        _file_pattern: Option<&str>,
    ) -> Result<String> {
        let files = lock(&self.files);
        let hits: Vec<String> = files
            .iter()
            .filter(|(_, content)| content.contains(regex))
            .map(|(path, _)| path.clone())
            .collect();
        Ok(format!("Found {} results.\n{}", hits.len(), hits.join("\n")))
    }

    async fn list_code_definitions(&self, path: &Path) -> Result<String> {
        Ok(format!("definitions in {}", self.relative(path)))
    }

    async fn run_command(&self, command: &str) -> Result<mpsc::Receiver<CommandEvent>> {
        self.record(format!("run {command}"));
        let (lines, exit_code) = self.commands.get(command).cloned().unwrap_or_default();
        let (tx, rx) = mpsc::channel(lines.len() + 8);
        for line in lines {
            tx.send(CommandEvent::Line(line)).await?;
        }
        match exit_code {
            Some(code) => {
                tx.send(CommandEvent::Completed {
                    exit_code: Some(code),
                })
                .await?;
            }
            None => lock(&self.running).push(tx),
        }
        Ok(rx)
    }

    async fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// Browser and tool servers
// ============================================================================

/// Browser that records every action and always succeeds.
#[derive(Default)]
pub struct RecordingBrowser {
    calls: Mutex<Vec<String>>,
}

impl RecordingBrowser {
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    fn act(&self, call: String) -> Result<BrowserActionResult> {
        lock(&self.calls).push(call);
        Ok(BrowserActionResult {
            screenshot: Some(SCREENSHOT.to_string()),
            logs: Some("ready".to_string()),
            current_url: Some("http://localhost:3000".to_string()),
            current_mouse_position: None,
        })
    }
}

#[async_trait]
impl BrowserSession for RecordingBrowser {
    async fn launch(&self, url: &str) -> Result<BrowserActionResult> {
        self.act(format!("launch {url}"))
    }

    async fn click(&self, coordinate: &str) -> Result<BrowserActionResult> {
        self.act(format!("click {coordinate}"))
    }

    async fn type_text(&self, text: &str) -> Result<BrowserActionResult> {
        self.act(format!("type {text}"))
    }

    async fn scroll_down(&self) -> Result<BrowserActionResult> {
        self.act("scroll_down".to_string())
    }

    async fn scroll_up(&self) -> Result<BrowserActionResult> {
        self.act("scroll_up".to_string())
    }

    async fn close(&self) -> Result<()> {
        lock(&self.calls).push("close".to_string());
        Ok(())
    }
}

/// Tool server that echoes its arguments back.
#[derive(Default)]
pub struct RecordingToolServer {
    calls: Mutex<Vec<String>>,
}

impl RecordingToolServer {
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl ToolServer for RecordingToolServer {
    async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Option<Value>,
    ) -> Result<ToolCallResponse> {
        lock(&self.calls).push(format!("call {server}/{tool}"));
        let arguments = arguments.map(|a| a.to_string()).unwrap_or_default();
        Ok(ToolCallResponse {
            is_error: false,
            content: vec![ToolContent::Text {
                text: format!("{tool} on {server}: {arguments}"),
            }],
        })
    }

    async fn read_resource(&self, server: &str, uri: &str) -> Result<ResourceResponse> {
        lock(&self.calls).push(format!("read {server} {uri}"));
        Ok(ResourceResponse {
            contents: vec![ResourceContent {
                uri: uri.to_string(),
                mime_type: Some("text/plain".to_string()),
                text: Some(format!("contents of {uri}")),
            }],
        })
    }
}

// ============================================================================
// Messenger fixtures
// ============================================================================

/// Events collected from a task's channel in the background.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<Arc<TaskEvent>>>>,
}

impl EventLog {
    pub fn events(&self) -> Vec<Arc<TaskEvent>> {
        lock(&self.events).clone()
    }
}

/// Spawns a drain for a fresh event channel and returns its sender.
pub fn collect_events() -> (EventSender, EventLog) {
    let (tx, mut rx) = create_event_channel();
    let log = EventLog::default();
    let sink = Arc::clone(&log.events);
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            lock(&sink).push(event);
        }
    });
    (EventSender::new(tx), log)
}

/// Messenger for task `t` storing under `home`, with events drained.
pub fn test_messenger(home: &Path, abort: CancellationToken) -> (Messenger, AskResponder, EventLog) {
    let (events, log) = collect_events();
    let responder = AskResponder::new();
    let messenger = Messenger::new(
        ConversationStore::new(home, "t"),
        events,
        abort,
        responder.clone(),
        Vec::new(),
    );
    (messenger, responder, log)
}

/// Answers the next asks, in order, as they appear.
pub fn answer_when_asked(responder: AskResponder, decisions: Vec<AskDecision>) -> JoinHandle<()> {
    tokio::spawn(async move {
        for decision in decisions {
            loop {
                if responder.pending_ts().is_some() && responder.respond(decision.clone()).is_ok() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    })
}
