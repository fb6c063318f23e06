//! The task loop.
//!
//! One task drives turns until the user accepts a completion result, the
//! task is aborted, or a request fails for good:
//!
//! ```text
//! prepare context ─► send request ─► stream response ─┬─► present blocks
//!        ▲                                              │
//!        └───────── next user content ◄── decide ◄──────┘
//! ```
//!
//! Every turn appends one user and one assistant message to the API history
//! and persists it before moving on. A broken stream re-enters the loop
//! through resumption, the same way a cold start from history does.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, PricingConfig};
use crate::core::compaction::{should_compact, truncate_half_conversation};
use crate::core::context::{SystemInfo, environment_details};
use crate::core::dispatcher::{Collaborators, Dispatcher, TurnFlags};
use crate::core::events::{ErrorKind, EventSender, TaskEvent, TaskOutcome};
use crate::core::interaction::{AskResponder, Messenger, Update};
use crate::core::messages::{
    ApiBlock, ApiMessage, ApiReqInfo, AskKind, AskResponse, CancelReason, SayKind,
    blocks_to_markdown, image_blocks,
};
use crate::core::presenter::{Presenter, ReadEnd, StreamSnapshot, read_stream};
use crate::core::prompts::render_system_prompt;
use crate::core::responses::{
    EMPTY_RESPONSE_ERROR, EMPTY_RESPONSE_PLACEHOLDER, INTERRUPTED_BY_API_ERROR,
    INTERRUPTED_BY_FEEDBACK, INTERRUPTED_BY_TOOL_USE, INTERRUPTED_BY_USER, mistake_limit_guidance,
    no_tools_used, too_many_mistakes,
};
use crate::core::resume::{
    RECENT_INTERRUPTION_MS, ResumedHistory, ago_text, clean_ui_messages, last_relevant_message,
    prepare_api_history, resume_ask_kind, resumed_user_content, resumption_text,
};
use crate::core::store::ConversationStore;
use crate::error::{PersistenceError, TaskError, TaskResult};
use crate::model::{ApiChunk, ApiStream, ModelClient, Usage, calculate_api_cost};

/// What a task needs from its host, fixed for the task's lifetime.
#[derive(Clone)]
pub struct TaskDeps {
    pub config: Config,
    pub model: Arc<dyn ModelClient>,
    pub collaborators: Collaborators,
    pub system_info: SystemInfo,
    /// Cadence home directory; task logs live under `tasks/<id>`.
    pub home: PathBuf,
}

/// How a task run begins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStart {
    New { text: String, images: Vec<String> },
    /// Cold start from the saved logs of the task.
    Resume,
}

enum TurnOutcome {
    Completed,
    Next(Vec<ApiBlock>),
    /// The stream broke; the task resumes from its saved logs.
    Interrupted,
}

/// Model-facing history, saved after every change.
struct ApiHistory {
    messages: Vec<ApiMessage>,
}

impl ApiHistory {
    async fn push(
        &mut self,
        store: &ConversationStore,
        message: ApiMessage,
    ) -> Result<(), PersistenceError> {
        self.messages.push(message);
        store.save_api_history(&self.messages).await
    }

    async fn replace(
        &mut self,
        store: &ConversationStore,
        messages: Vec<ApiMessage>,
    ) -> Result<(), PersistenceError> {
        self.messages = messages;
        store.save_api_history(&self.messages).await
    }
}

/// Usage and cost of one request.
struct RequestRecord {
    ts: u64,
    usage: Usage,
    cost: f64,
}

impl RequestRecord {
    fn new(ts: u64, usage: Usage, pricing: &PricingConfig) -> Self {
        let cost = usage.total_cost.unwrap_or_else(|| {
            calculate_api_cost(
                pricing,
                usage.input_tokens,
                usage.output_tokens,
                usage.cache_write_tokens,
                usage.cache_read_tokens,
            )
        });
        Self { ts, usage, cost }
    }

    fn apply(&self, info: &mut ApiReqInfo) {
        info.tokens_in = Some(self.usage.input_tokens);
        info.tokens_out = Some(self.usage.output_tokens);
        info.cache_writes = Some(self.usage.cache_write_tokens);
        info.cache_reads = Some(self.usage.cache_read_tokens);
        info.cost = Some(self.cost);
    }
}

pub struct Task {
    messenger: Messenger,
    dispatcher: Dispatcher,
    model: Arc<dyn ModelClient>,
    config: Config,
    system_info: SystemInfo,
    history: ApiHistory,
    abandoned: Arc<AtomicBool>,
}

impl Task {
    pub fn new(
        task_id: &str,
        deps: TaskDeps,
        events: EventSender,
        abort: CancellationToken,
        responder: AskResponder,
    ) -> Self {
        let store = ConversationStore::new(&deps.home, task_id);
        Self {
            messenger: Messenger::new(store, events, abort, responder, Vec::new()),
            dispatcher: Dispatcher::new(deps.collaborators, &deps.config),
            model: deps.model,
            config: deps.config,
            system_info: deps.system_info,
            history: ApiHistory {
                messages: Vec::new(),
            },
            abandoned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set by the host when it stops waiting for this task.
    pub fn abandoned_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abandoned)
    }

    /// Runs the task to its end and reports how it ended.
    ///
    /// Collaborators are released and `TaskFinished` is posted on every path.
    pub async fn run(mut self, start: TaskStart) -> TaskOutcome {
        let task_id = self.messenger.task_id().to_string();
        tracing::info!(%task_id, resume = matches!(start, TaskStart::Resume), "task started");

        let result = match start {
            TaskStart::New { text, images } => self.start_new(text, images).await,
            TaskStart::Resume => self.resume().await,
        };
        let outcome = match result {
            Ok(()) => TaskOutcome::Completed,
            Err(err) if err.is_cancellation() => TaskOutcome::Aborted,
            Err(err) => {
                self.report(&err).await;
                TaskOutcome::Failed
            }
        };

        self.dispatcher.collaborators().release().await;
        tracing::info!(%task_id, %outcome, "task finished");
        self.messenger
            .events()
            .send_important(TaskEvent::TaskFinished { task_id, outcome })
            .await;
        outcome
    }

    async fn report(&self, err: &TaskError) {
        tracing::error!(task_id = %self.messenger.task_id(), error = %err, "task failed");
        let event = match err {
            TaskError::RequestFailed(provider) => TaskEvent::Error {
                kind: provider.kind.clone().into(),
                message: provider.message.clone(),
                details: provider.details.clone(),
            },
            TaskError::Persistence(persistence) => TaskEvent::Error {
                kind: ErrorKind::Persistence,
                message: persistence.to_string(),
                details: None,
            },
            other => TaskEvent::Error {
                kind: ErrorKind::Internal,
                message: format!("{other:#}"),
                details: None,
            },
        };
        self.messenger.events().send_important(event).await;
    }

    async fn start_new(&mut self, text: String, images: Vec<String>) -> TaskResult<()> {
        self.messenger
            .say_with_images(SayKind::Task, text.clone(), images.clone())
            .await?;
        let mut content = vec![ApiBlock::text(format!("<task>\n{text}\n</task>"))];
        content.extend(image_blocks(&images));
        self.run_loop(content).await
    }

    async fn resume(&mut self) -> TaskResult<()> {
        let content = self.prepare_resumption().await?;
        self.run_loop(content).await
    }

    async fn run_loop(&mut self, mut user_content: Vec<ApiBlock>) -> TaskResult<()> {
        let mut include_file_details = true;
        loop {
            let outcome = self.turn(user_content, include_file_details).await?;
            include_file_details = false;
            user_content = match outcome {
                TurnOutcome::Completed => return Ok(()),
                TurnOutcome::Next(content) => content,
                TurnOutcome::Interrupted => {
                    include_file_details = true;
                    self.prepare_resumption().await?
                }
            };
        }
    }

    // ========================================================================
    // Resumption
    // ========================================================================

    /// Cleans both saved logs, asks whether to resume, and builds the first
    /// user content of the resumed run.
    async fn prepare_resumption(&mut self) -> TaskResult<Vec<ApiBlock>> {
        let saved = self.messenger.store().load_ui_messages().await?;
        let cleaned = clean_ui_messages(saved);
        let ask = resume_ask_kind(&cleaned);
        let interrupted_at = last_relevant_message(&cleaned).map(|m| m.ts);
        self.messenger.overwrite(cleaned).await?;

        let decision = self.messenger.ask_full(ask, None, Update::New).await?;
        let answer = match decision.response {
            AskResponse::YesButtonClicked => None,
            AskResponse::NoButtonClicked => {
                tracing::info!(task_id = %self.messenger.task_id(), "resumption declined");
                return Err(TaskError::Aborted);
            }
            AskResponse::MessageResponse => {
                let text = decision.text.unwrap_or_default();
                self.messenger
                    .say_with_images(SayKind::UserFeedback, text.clone(), decision.images.clone())
                    .await?;
                Some((text, decision.images))
            }
        };

        let saved_history = self.messenger.store().load_api_history().await?;
        let ResumedHistory {
            history,
            carried_content,
        } = prepare_api_history(saved_history)?;

        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let then = interrupted_at.unwrap_or(now);
        let was_recent = now.saturating_sub(then) < RECENT_INTERRUPTION_MS;
        let resumption = resumption_text(&ago_text(now, then), &self.system_info.cwd, was_recent);
        let content = resumed_user_content(
            carried_content,
            resumption,
            answer
                .as_ref()
                .map(|(text, images)| (text.as_str(), images.as_slice())),
        );

        self.history
            .replace(self.messenger.store(), history)
            .await?;
        tracing::info!(
            task_id = %self.messenger.task_id(),
            messages = self.history.messages.len(),
            "task resumed"
        );
        Ok(content)
    }

    // ========================================================================
    // Turns
    // ========================================================================

    async fn turn(
        &mut self,
        mut user_content: Vec<ApiBlock>,
        include_file_details: bool,
    ) -> TaskResult<TurnOutcome> {
        self.messenger.ensure_not_aborted()?;
        self.check_mistake_limit(&mut user_content).await?;

        let previous_tokens = self.previous_request_tokens().await;
        let loading = ApiReqInfo {
            request: Some(format!(
                "{}\n\nLoading...",
                blocks_to_markdown(&user_content)
            )),
            ..ApiReqInfo::default()
        };
        self.messenger
            .say(SayKind::ApiReqStarted, loading.to_text())
            .await?;
        let req_ts = self
            .messenger
            .last_message()
            .await
            .map_or(0, |message| message.ts);

        let details = environment_details(
            &self.system_info,
            self.dispatcher.collaborators().workspace.as_ref(),
            include_file_details,
        )
        .await;
        user_content.push(ApiBlock::text(details));
        let request = blocks_to_markdown(&user_content);
        self.history
            .push(self.messenger.store(), ApiMessage::user(user_content))
            .await?;
        self.messenger
            .update_api_req(req_ts, |info| info.request = Some(request))
            .await?;

        if previous_tokens > 0 && should_compact(previous_tokens, self.model.info().context_window)
        {
            let before = self.history.messages.len();
            let kept = truncate_half_conversation(&self.history.messages);
            self.history.replace(self.messenger.store(), kept).await?;
            tracing::info!(
                task_id = %self.messenger.task_id(),
                previous_tokens,
                before,
                after = self.history.messages.len(),
                "history compacted"
            );
        }

        let (stream, first) = self.attempt_request().await?;
        let pricing = self.model.info().pricing.clone();

        let flags = TurnFlags::default();
        let stop = self.messenger.abort_token().child_token();
        let (tx, rx) = watch::channel(StreamSnapshot::default());

        // The presenter borrows the dispatcher until this block ends.
        let presented = {
            let presenter = Presenter::new(&self.messenger, &mut self.dispatcher, &flags, &stop);
            let reading = read_stream(stream, first, tx, &stop);
            let presenting = presenter.run(rx);
            tokio::pin!(reading, presenting);

            let mut early = None;
            let read = loop {
                tokio::select! {
                    read = &mut reading => break read,
                    result = &mut presenting, if early.is_none() => early = Some(result),
                }
            };
            let record = RequestRecord::new(req_ts, read.usage, &pricing);
            let mut text = read.text;

            if self.messenger.abort_token().is_cancelled() {
                if let Err(err) = abort_stream(
                    &self.messenger,
                    &mut self.history,
                    &record,
                    &text,
                    CancelReason::UserCancelled,
                    None,
                )
                .await
                {
                    tracing::warn!(error = %err, "failed to record the cancelled response");
                }
                return Err(TaskError::Aborted);
            }

            match read.end {
                ReadEnd::Failed(err) => {
                    tracing::warn!(
                        task_id = %self.messenger.task_id(),
                        error = %err,
                        "response stream failed"
                    );
                    abort_stream(
                        &self.messenger,
                        &mut self.history,
                        &record,
                        &text,
                        CancelReason::StreamingFailed,
                        Some(err.message),
                    )
                    .await?;
                    return Ok(TurnOutcome::Interrupted);
                }
                ReadEnd::Stopped if flags.rejected() => text.push_str(INTERRUPTED_BY_FEEDBACK),
                ReadEnd::Stopped if flags.used_tool() => text.push_str(INTERRUPTED_BY_TOOL_USE),
                ReadEnd::Stopped | ReadEnd::Finished => {}
            }

            self.messenger
                .update_api_req(req_ts, |info| record.apply(info))
                .await?;

            if text.is_empty() {
                None
            } else {
                self.history
                    .push(self.messenger.store(), ApiMessage::assistant_text(text))
                    .await?;
                let presented = match early {
                    Some(result) => result,
                    None => presenting.await,
                };
                Some(presented?)
            }
        };

        let Some(presented) = presented else {
            tracing::warn!(task_id = %self.messenger.task_id(), "empty model response");
            self.messenger
                .say(SayKind::Error, EMPTY_RESPONSE_ERROR)
                .await?;
            self.history
                .push(
                    self.messenger.store(),
                    ApiMessage::assistant_text(EMPTY_RESPONSE_PLACEHOLDER),
                )
                .await?;
            self.dispatcher.record_mistake();
            return Ok(TurnOutcome::Next(vec![ApiBlock::text(no_tools_used())]));
        };

        if presented.completed {
            return Ok(TurnOutcome::Completed);
        }
        let mut next = presented.user_content;
        if !presented.saw_tool_use {
            next.push(ApiBlock::text(no_tools_used()));
            self.dispatcher.record_mistake();
        }
        Ok(TurnOutcome::Next(next))
    }

    /// Asks for guidance once too many mistakes piled up.
    async fn check_mistake_limit(&mut self, user_content: &mut Vec<ApiBlock>) -> TaskResult<()> {
        if self.dispatcher.mistakes() < self.config.mistake_limit {
            return Ok(());
        }
        tracing::info!(
            task_id = %self.messenger.task_id(),
            mistakes = self.dispatcher.mistakes(),
            "mistake limit reached"
        );
        let decision = self
            .messenger
            .ask(AskKind::MistakeLimitReached, mistake_limit_guidance())
            .await?;
        if decision.response == AskResponse::MessageResponse {
            let feedback = decision.text.unwrap_or_default();
            self.messenger
                .say_with_images(SayKind::UserFeedback, feedback.clone(), decision.images.clone())
                .await?;
            user_content.push(ApiBlock::text(too_many_mistakes(&feedback)));
            user_content.extend(image_blocks(&decision.images));
        }
        self.dispatcher.reset_mistakes();
        Ok(())
    }

    /// Total tokens of the last recorded request.
    async fn previous_request_tokens(&self) -> u64 {
        self.messenger
            .messages()
            .await
            .iter()
            .rev()
            .find(|m| m.say() == Some(SayKind::ApiReqStarted))
            .map_or(0, |m| ApiReqInfo::from_message(m).total_tokens())
    }

    /// Starts the request and waits for its first chunk. A failure before
    /// the first chunk asks the user whether to retry the same request.
    async fn attempt_request(&self) -> TaskResult<(ApiStream, Option<ApiChunk>)> {
        loop {
            let system_prompt = render_system_prompt(
                &self.system_info,
                self.config.custom_instructions.as_deref(),
            )?;
            let mut stream = self
                .model
                .create_message(&system_prompt, &self.history.messages);
            let first = tokio::select! {
                biased;
                () = self.messenger.abort_token().cancelled() => return Err(TaskError::Aborted),
                item = stream.next() => item,
            };
            let err = match first {
                Some(Ok(chunk)) => return Ok((stream, Some(chunk))),
                None => return Ok((stream, None)),
                Some(Err(err)) => err,
            };

            tracing::warn!(task_id = %self.messenger.task_id(), error = %err, "API request failed");
            if self.abandoned.load(Ordering::SeqCst) {
                return Err(TaskError::RequestFailed(err));
            }
            let decision = self
                .messenger
                .ask(AskKind::ApiReqFailed, err.message.clone())
                .await?;
            if decision.response != AskResponse::YesButtonClicked {
                return Err(TaskError::RequestFailed(err));
            }
            self.messenger
                .say_full(SayKind::ApiReqRetried, None, Vec::new(), Update::New)
                .await?;
        }
    }
}

/// Records a response that ended early: the partial message is finalized,
/// the text so far is saved with an interruption marker, and the request
/// record gets its usage and cancel reason.
async fn abort_stream(
    messenger: &Messenger,
    history: &mut ApiHistory,
    record: &RequestRecord,
    text: &str,
    reason: CancelReason,
    failure: Option<String>,
) -> TaskResult<()> {
    messenger.finalize_last_partial().await?;
    let marker = match reason {
        CancelReason::UserCancelled => INTERRUPTED_BY_USER,
        CancelReason::StreamingFailed => INTERRUPTED_BY_API_ERROR,
    };
    history
        .push(
            messenger.store(),
            ApiMessage::assistant_text(format!("{text}{marker}")),
        )
        .await?;
    messenger
        .update_api_req(record.ts, |info| {
            record.apply(info);
            info.cancel_reason = Some(reason);
            info.streaming_failed_message = failure;
        })
        .await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::{TempDir, tempdir};
    use tokio::time::timeout;

    use super::*;
    use crate::config::AutoApprovalActions;
    use crate::core::messages::{AskDecision, Role, UiMessage};
    use crate::model::{ModelInfo, ScriptedModel, ScriptedTurn};
    use crate::testing::{
        EventLog, FakeWorkspace, RecordingBrowser, RecordingToolServer, answer_when_asked,
        collect_events,
    };
    use crate::tools::{BrowserSession, ToolServer, Workspace};

    const COMPLETE: &str =
        "Done.\n<attempt_completion>\n<result>\nAll set.\n</result>\n</attempt_completion>";

    struct Harness {
        dir: TempDir,
        config: Config,
        workspace: Arc<FakeWorkspace>,
        browser: Arc<RecordingBrowser>,
        responder: AskResponder,
        abort: CancellationToken,
        events: EventLog,
    }

    impl Harness {
        fn new(config: Config, workspace: FakeWorkspace) -> Self {
            Self {
                dir: tempdir().unwrap(),
                config,
                workspace: Arc::new(workspace),
                browser: Arc::new(RecordingBrowser::default()),
                responder: AskResponder::new(),
                abort: CancellationToken::new(),
                events: EventLog::default(),
            }
        }

        fn task(&mut self, id: &str, model: &Arc<ScriptedModel>) -> Task {
            let (events, log) = collect_events();
            self.events = log;
            let deps = TaskDeps {
                config: self.config.clone(),
                model: Arc::clone(model) as Arc<dyn ModelClient>,
                collaborators: Collaborators {
                    workspace: Arc::clone(&self.workspace) as Arc<dyn Workspace>,
                    browser: Arc::clone(&self.browser) as Arc<dyn BrowserSession>,
                    tool_server: Arc::new(RecordingToolServer::default()) as Arc<dyn ToolServer>,
                },
                system_info: SystemInfo {
                    os: "linux".into(),
                    shell: "/bin/bash".into(),
                    home: PathBuf::from("/home/dev"),
                    cwd: PathBuf::from("/work"),
                },
                home: self.dir.path().to_path_buf(),
            };
            Task::new(
                id,
                deps,
                events,
                self.abort.clone(),
                self.responder.clone(),
            )
        }

        fn store(&self, id: &str) -> ConversationStore {
            ConversationStore::new(self.dir.path(), id)
        }

        async fn finished(&self) -> TaskOutcome {
            timeout(Duration::from_secs(5), async {
                loop {
                    let finished = self.events.events().iter().find_map(|e| match **e {
                        TaskEvent::TaskFinished { outcome, .. } => Some(outcome),
                        _ => None,
                    });
                    if let Some(outcome) = finished {
                        return outcome;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap()
        }
    }

    fn scripted(turns: Vec<ScriptedTurn>) -> Arc<ScriptedModel> {
        Arc::new(ScriptedModel::new(
            ModelInfo::from_config(&Config::default()),
            turns,
        ))
    }

    fn auto_read_config() -> Config {
        let mut config = Config::default();
        config.auto_approval.enabled = true;
        config.auto_approval.actions = AutoApprovalActions {
            read_files: true,
            ..AutoApprovalActions::default()
        };
        config
    }

    fn new_task(text: &str) -> TaskStart {
        TaskStart::New {
            text: text.into(),
            images: Vec::new(),
        }
    }

    async fn run(task: Task, start: TaskStart) -> TaskOutcome {
        timeout(Duration::from_secs(5), task.run(start))
            .await
            .unwrap()
    }

    fn texts(message: &ApiMessage) -> Vec<&str> {
        message.content.iter().filter_map(ApiBlock::as_text).collect()
    }

    fn find_ask(ui: &[UiMessage], kind: AskKind) -> Option<&UiMessage> {
        ui.iter().find(|m| m.ask() == Some(kind))
    }

    /// A task whose first response is accepted completes and records usage.
    #[tokio::test]
    async fn test_new_task_completes() {
        let model = scripted(vec![ScriptedTurn::text(COMPLETE).with_usage(Usage {
            input_tokens: 100,
            output_tokens: 20,
            ..Usage::default()
        })]);
        let mut h = Harness::new(Config::default(), FakeWorkspace::new("/work"));
        let task = h.task("t1", &model);
        let answer = answer_when_asked(h.responder.clone(), vec![AskDecision::yes()]);

        let outcome = run(task, new_task("say hi")).await;
        answer.await.unwrap();

        assert_eq!(outcome, TaskOutcome::Completed);
        assert_eq!(h.finished().await, TaskOutcome::Completed);

        let requests = model.requests();
        assert_eq!(requests.len(), 1);
        let first = texts(&requests[0][0]);
        assert_eq!(first[0], "<task>\nsay hi\n</task>");
        assert!(first[1].contains("# Current Working Directory (/work) Files"));

        let store = h.store("t1");
        let ui = store.load_ui_messages().await.unwrap();
        assert_eq!(ui[0].say(), Some(SayKind::Task));
        let info = ApiReqInfo::from_message(&ui[1]);
        assert_eq!(info.tokens_in, Some(100));
        assert!(info.cost.is_some_and(|c| c > 0.0));
        assert!(!info.request.unwrap().contains("Loading..."));
        assert_eq!(ui.last().unwrap().ask(), Some(AskKind::CompletionResult));

        let api = store.load_api_history().await.unwrap();
        assert_eq!(api.len(), 2);
        assert_eq!(api[1].role, Role::Assistant);
        assert!(h.workspace.disposed());
    }

    /// The tool result of one turn is the next request's user content.
    #[tokio::test]
    async fn test_tool_result_feeds_next_request() {
        let model = scripted(vec![
            ScriptedTurn::text("<read_file>\n<path>a.rs</path>\n</read_file>"),
            ScriptedTurn::text(COMPLETE),
        ]);
        let mut h = Harness::new(
            auto_read_config(),
            FakeWorkspace::new("/work").with_file("a.rs", "alpha"),
        );
        let task = h.task("t1", &model);
        let answer = answer_when_asked(h.responder.clone(), vec![AskDecision::yes()]);

        assert_eq!(run(task, new_task("read a")).await, TaskOutcome::Completed);
        answer.await.unwrap();

        let requests = model.requests();
        assert_eq!(requests.len(), 2);
        let second = &requests[1];
        assert_eq!(second.len(), 3);
        let content = texts(&second[2]);
        assert_eq!(content[0], "[read_file for 'a.rs'] Result:");
        assert_eq!(content[1], "alpha");
        assert!(!content[2].contains("Files"));
    }

    /// Three turns without a tool raise the checkpoint prompt; its feedback
    /// goes into the next request.
    #[tokio::test]
    async fn test_turns_without_tools_reach_mistake_limit() {
        let model = scripted(vec![
            ScriptedTurn::text("Thinking."),
            ScriptedTurn::text("Still thinking."),
            ScriptedTurn::text("Almost."),
            ScriptedTurn::text(COMPLETE),
        ]);
        let mut h = Harness::new(Config::default(), FakeWorkspace::new("/work"));
        let task = h.task("t1", &model);
        let answer = answer_when_asked(
            h.responder.clone(),
            vec![AskDecision::message("use attempt_completion"), AskDecision::yes()],
        );

        assert_eq!(run(task, new_task("think")).await, TaskOutcome::Completed);
        answer.await.unwrap();

        let requests = model.requests();
        assert_eq!(requests.len(), 4);
        assert_eq!(texts(requests[1].last().unwrap())[0], no_tools_used());
        assert_eq!(
            texts(requests[3].last().unwrap())[1],
            too_many_mistakes("use attempt_completion")
        );

        let ui = h.store("t1").load_ui_messages().await.unwrap();
        let checkpoint = find_ask(&ui, AskKind::MistakeLimitReached).unwrap();
        assert_eq!(checkpoint.text(), mistake_limit_guidance());
        assert_eq!(
            ui.iter()
                .filter(|m| m.ask() == Some(AskKind::MistakeLimitReached))
                .count(),
            1
        );
    }

    /// A request failing before its first chunk is retried on "yes" with
    /// the identical history.
    #[tokio::test]
    async fn test_failed_request_is_retried() {
        let model = scripted(vec![
            ScriptedTurn::failing("overloaded"),
            ScriptedTurn::text(COMPLETE),
        ]);
        let mut h = Harness::new(Config::default(), FakeWorkspace::new("/work"));
        let task = h.task("t1", &model);
        let answer = answer_when_asked(
            h.responder.clone(),
            vec![AskDecision::yes(), AskDecision::yes()],
        );

        assert_eq!(run(task, new_task("go")).await, TaskOutcome::Completed);
        answer.await.unwrap();

        let requests = model.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0], requests[1]);
        let ui = h.store("t1").load_ui_messages().await.unwrap();
        assert!(find_ask(&ui, AskKind::ApiReqFailed).unwrap().text().contains("overloaded"));
        assert!(ui.iter().any(|m| m.say() == Some(SayKind::ApiReqRetried)));
    }

    /// Declining the retry fails the task with a surfaced error.
    #[tokio::test]
    async fn test_failed_request_declined() {
        let model = scripted(vec![ScriptedTurn::failing("overloaded")]);
        let mut h = Harness::new(Config::default(), FakeWorkspace::new("/work"));
        let task = h.task("t1", &model);
        let answer = answer_when_asked(h.responder.clone(), vec![AskDecision::no()]);

        assert_eq!(run(task, new_task("go")).await, TaskOutcome::Failed);
        answer.await.unwrap();

        h.finished().await;
        assert!(h.events.events().iter().any(|e| matches!(
            **e,
            TaskEvent::Error { kind: ErrorKind::ApiError, ref message, .. } if message.contains("overloaded")
        )));
    }

    /// An empty response is recorded as a failure and counts as a mistake.
    #[tokio::test]
    async fn test_empty_response() {
        let model = scripted(vec![ScriptedTurn::chunks(Vec::<String>::new()), ScriptedTurn::text(COMPLETE)]);
        let mut h = Harness::new(Config::default(), FakeWorkspace::new("/work"));
        let task = h.task("t1", &model);
        let answer = answer_when_asked(h.responder.clone(), vec![AskDecision::yes()]);

        assert_eq!(run(task, new_task("go")).await, TaskOutcome::Completed);
        answer.await.unwrap();

        let requests = model.requests();
        assert_eq!(texts(&requests[1][1]), vec![EMPTY_RESPONSE_PLACEHOLDER]);
        assert_eq!(texts(&requests[1][2])[0], no_tools_used());
        let ui = h.store("t1").load_ui_messages().await.unwrap();
        assert!(ui
            .iter()
            .any(|m| m.say() == Some(SayKind::Error) && m.text() == EMPTY_RESPONSE_ERROR));
    }

    /// Large previous requests halve the history before the next request.
    #[tokio::test]
    async fn test_history_compacted_near_context_window() {
        let usage = Usage {
            input_tokens: 9_000,
            ..Usage::default()
        };
        let read = "<read_file>\n<path>a.rs</path>\n</read_file>";
        let model = scripted(vec![
            ScriptedTurn::text(read).with_usage(usage),
            ScriptedTurn::text(read).with_usage(usage),
            ScriptedTurn::text(COMPLETE),
        ]);
        let mut config = auto_read_config();
        config.context_window = 10_000;
        let mut h = Harness::new(config, FakeWorkspace::new("/work").with_file("a.rs", "alpha"));
        let task = h.task("t1", &model);
        let answer = answer_when_asked(h.responder.clone(), vec![AskDecision::yes()]);

        assert_eq!(run(task, new_task("read twice")).await, TaskOutcome::Completed);
        answer.await.unwrap();

        let requests = model.requests();
        assert_eq!(requests[1].len(), 3);
        assert_eq!(requests[2].len(), 3);
        assert!(texts(&requests[2][0])[0].starts_with("<task>"));
        assert_eq!(requests[2][1].role, Role::Assistant);
    }

    /// Aborting while an approval is pending ends the task and releases the
    /// collaborators; the assistant message is already saved.
    #[tokio::test]
    async fn test_abort_while_asking() {
        let model = scripted(vec![ScriptedTurn::text(
            "<write_to_file>\n<path>b.rs</path>\n<content>x</content>\n</write_to_file>",
        )]);
        let mut h = Harness::new(Config::default(), FakeWorkspace::new("/work"));
        let task = h.task("t1", &model);
        let handle = tokio::spawn(task.run(new_task("write b")));

        timeout(Duration::from_secs(5), async {
            while h.responder.pending_ts().is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        h.abort.cancel();

        let outcome = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(outcome, TaskOutcome::Aborted);
        assert!(h.workspace.disposed());
        assert!(h.workspace.file("b.rs").is_none());
        assert!(h.browser.calls().contains(&"close".to_string()));

        let api = h.store("t1").load_api_history().await.unwrap();
        assert_eq!(api.len(), 2);
        assert!(texts(&api[1])[0].contains("<write_to_file>"));
    }

    /// An approval that races an abort is dropped and the write never runs.
    #[tokio::test]
    async fn test_approval_racing_abort_does_not_write() {
        for answer_first in [true, false] {
            let model = scripted(vec![ScriptedTurn::text(
                "<write_to_file>\n<path>b.rs</path>\n<content>x</content>\n</write_to_file>",
            )]);
            let mut h = Harness::new(Config::default(), FakeWorkspace::new("/work"));
            let task = h.task("t1", &model);
            let handle = tokio::spawn(task.run(new_task("write b")));

            timeout(Duration::from_secs(5), async {
                while h.responder.pending_ts().is_none() {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap();
            if answer_first {
                h.responder.respond(AskDecision::yes()).unwrap();
                h.abort.cancel();
            } else {
                h.abort.cancel();
                assert!(h.responder.respond(AskDecision::yes()).is_err());
            }

            let outcome = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
            assert_eq!(outcome, TaskOutcome::Aborted);
            assert!(h.workspace.file("b.rs").is_none());
            assert!(!h.workspace.calls().iter().any(|c| c.starts_with("write")));
        }
    }

    /// A cold resume asks first, then folds the answer and the resumption
    /// note into the next request.
    #[tokio::test]
    async fn test_resume_from_history() {
        let first = scripted(vec![ScriptedTurn::text(
            "<write_to_file>\n<path>b.rs</path>\n<content>x</content>\n</write_to_file>",
        )]);
        let mut h = Harness::new(Config::default(), FakeWorkspace::new("/work"));
        let task = h.task("t1", &first);
        let handle = tokio::spawn(task.run(new_task("write b")));
        timeout(Duration::from_secs(5), async {
            while h.responder.pending_ts().is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        h.abort.cancel();
        handle.await.unwrap();

        h.abort = CancellationToken::new();
        let second = scripted(vec![ScriptedTurn::text(COMPLETE)]);
        let task = h.task("t1", &second);
        let answer = answer_when_asked(
            h.responder.clone(),
            vec![AskDecision::message("keep going"), AskDecision::yes()],
        );
        assert_eq!(run(task, TaskStart::Resume).await, TaskOutcome::Completed);
        answer.await.unwrap();

        let request = &second.requests()[0];
        assert_eq!(request.len(), 3);
        assert!(texts(&request[1])[0].contains("<write_to_file>"));
        let resumed = texts(&request[2])[0];
        assert!(resumed.starts_with("[TASK RESUMPTION] This task was interrupted just now."));
        assert!(resumed.contains("<user_message>\nkeep going\n</user_message>"));

        let ui = h.store("t1").load_ui_messages().await.unwrap();
        assert_eq!(
            ui.iter()
                .filter(|m| m.ask() == Some(AskKind::ResumeTask))
                .count(),
            1
        );
        assert!(ui
            .iter()
            .any(|m| m.say() == Some(SayKind::UserFeedback) && m.text() == "keep going"));
    }

    /// A stream breaking mid-way keeps the partial text with a marker and
    /// resumes the task in place.
    #[tokio::test]
    async fn test_stream_failure_resumes_in_place() {
        let broken = ScriptedTurn {
            chunks: vec!["Let me look".into()],
            fail_after: Some("connection reset".into()),
            ..ScriptedTurn::default()
        };
        let model = scripted(vec![broken, ScriptedTurn::text(COMPLETE)]);
        let mut h = Harness::new(Config::default(), FakeWorkspace::new("/work"));
        let task = h.task("t1", &model);
        let answer = answer_when_asked(
            h.responder.clone(),
            vec![AskDecision::yes(), AskDecision::yes()],
        );

        assert_eq!(run(task, new_task("look")).await, TaskOutcome::Completed);
        answer.await.unwrap();

        let requests = model.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(
            texts(&requests[1][1]),
            vec![format!("Let me look{INTERRUPTED_BY_API_ERROR}")]
        );
        assert!(texts(&requests[1][2])[0].starts_with("[TASK RESUMPTION]"));

        let ui = h.store("t1").load_ui_messages().await.unwrap();
        assert!(find_ask(&ui, AskKind::ResumeTask).is_some());
        let failed = ui
            .iter()
            .map(ApiReqInfo::from_message)
            .find(|info| info.cancel_reason.is_some())
            .unwrap();
        assert_eq!(failed.cancel_reason, Some(CancelReason::StreamingFailed));
        assert_eq!(
            failed.streaming_failed_message.as_deref(),
            Some("connection reset")
        );
    }
}
