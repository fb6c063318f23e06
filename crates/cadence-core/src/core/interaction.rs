//! Interaction protocol: `ask` blocks for a host decision, `say` does not.
//!
//! Every UI message has a strictly increasing timestamp. A non-partial ask
//! registers a single-slot wait keyed by its message's timestamp:
//!
//! ```text
//! ask(kind) ──► push UiMessage{ts} ──► slot = {ts, oneshot tx, child token}
//!                                         │
//!   host: AskResponder::respond ──────────┤  tx.send(decision)   → Ok(decision)
//!   newer message (say/ask)     ──────────┤  token.cancel()      → Superseded
//!   task abort (parent token)   ──────────┘  token.cancel()      → Aborted
//! ```
//!
//! Streaming updates (`Update::Partial`) mutate the last message in place
//! when it has the same kind and is still partial; they never supersede.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::core::events::{EventSender, TaskEvent};
use crate::core::messages::{
    ApiReqInfo, AskDecision, AskKind, SayKind, UiKind, UiMessage, validate_image,
};
use crate::core::store::ConversationStore;
use crate::error::{RespondError, TaskError, TaskResult};

/// How a message relates to the last one in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Update {
    /// A new, complete message.
    New,
    /// A streaming update; collapses into the last message when it is a
    /// partial of the same kind.
    Partial,
    /// The last update of a streamed message; finalizes it in place.
    Final,
}

impl Update {
    pub fn streaming(partial: bool) -> Self {
        if partial { Update::Partial } else { Update::Final }
    }
}

struct PendingAsk {
    ts: u64,
    tx: oneshot::Sender<AskDecision>,
    cancel: CancellationToken,
}

/// Host-side handle for answering the pending ask.
#[derive(Clone, Default)]
pub struct AskResponder {
    slot: Arc<Mutex<Option<PendingAsk>>>,
}

impl AskResponder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers `decision` to the pending ask. Succeeds at most once per ask,
    /// and never once the ask has been cancelled by abort or supersession.
    pub fn respond(&self, decision: AskDecision) -> Result<(), RespondError> {
        for image in &decision.images {
            validate_image(image)?;
        }
        let pending = self.lock().take().ok_or(RespondError::NoPendingAsk)?;
        if pending.cancel.is_cancelled() {
            tracing::debug!(ts = pending.ts, "answer dropped; ask already cancelled");
            return Err(RespondError::NoPendingAsk);
        }
        tracing::debug!(ts = pending.ts, response = ?decision.response, "ask answered");
        pending
            .tx
            .send(decision)
            .map_err(|_decision| RespondError::NoPendingAsk)
    }

    /// Timestamp of the message currently waiting for an answer.
    pub fn pending_ts(&self) -> Option<u64> {
        self.lock()
            .as_ref()
            .filter(|p| !p.cancel.is_cancelled())
            .map(|p| p.ts)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<PendingAsk>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, ts: u64, abort: &CancellationToken) -> AskWaiter {
        let (tx, rx) = oneshot::channel();
        let cancel = abort.child_token();
        let previous = self.lock().replace(PendingAsk {
            ts,
            tx,
            cancel: cancel.clone(),
        });
        if let Some(previous) = previous {
            tracing::debug!(old = previous.ts, new = ts, "ask superseded by newer ask");
            previous.cancel.cancel();
        }
        AskWaiter {
            ts,
            rx,
            cancel,
            responder: self.clone(),
        }
    }

    /// Cancels the pending ask unless it belongs to message `ts`.
    fn supersede_unless(&self, ts: u64) {
        let mut slot = self.lock();
        if slot.as_ref().is_some_and(|p| p.ts != ts)
            && let Some(previous) = slot.take()
        {
            tracing::debug!(old = previous.ts, new = ts, "ask superseded by newer message");
            previous.cancel.cancel();
        }
    }

    fn withdraw(&self) {
        if let Some(previous) = self.lock().take() {
            tracing::debug!(ts = previous.ts, "ask withdrawn");
            previous.cancel.cancel();
        }
    }

    fn clear_if(&self, ts: u64) {
        let mut slot = self.lock();
        if slot.as_ref().is_some_and(|p| p.ts == ts) {
            slot.take();
        }
    }
}

struct AskWaiter {
    ts: u64,
    rx: oneshot::Receiver<AskDecision>,
    cancel: CancellationToken,
    responder: AskResponder,
}

impl AskWaiter {
    async fn wait(self, abort: &CancellationToken) -> TaskResult<AskDecision> {
        let AskWaiter {
            ts,
            rx,
            cancel,
            responder,
        } = self;
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            decision = rx => decision.ok(),
        };
        // A decision that raced an abort is discarded.
        match result {
            Some(decision) if !abort.is_cancelled() => Ok(decision),
            _ => {
                responder.clear_if(ts);
                if abort.is_cancelled() {
                    Err(TaskError::Aborted)
                } else {
                    Err(TaskError::Superseded)
                }
            }
        }
    }
}

/// An ask posted with [`Messenger::post_ask`], not yet answered.
pub struct PostedAsk {
    waiter: AskWaiter,
    abort: CancellationToken,
}

impl PostedAsk {
    pub async fn decision(self) -> TaskResult<AskDecision> {
        self.waiter.wait(&self.abort).await
    }
}

struct LogState {
    messages: Vec<UiMessage>,
    last_ts: u64,
}

impl LogState {
    fn next_ts(&mut self) -> u64 {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        self.last_ts = now.max(self.last_ts + 1);
        self.last_ts
    }

    fn last_partial(&mut self, kind: UiKind) -> Option<&mut UiMessage> {
        self.messages
            .last_mut()
            .filter(|m| m.partial && m.kind == kind)
    }
}

/// Owner of a task's UI log.
///
/// All methods take `&self`; the log sits behind an async mutex so the
/// presenter and the stream reader can share one messenger within a turn.
pub struct Messenger {
    task_id: String,
    store: ConversationStore,
    events: EventSender,
    abort: CancellationToken,
    responder: AskResponder,
    state: tokio::sync::Mutex<LogState>,
}

impl Messenger {
    pub fn new(
        store: ConversationStore,
        events: EventSender,
        abort: CancellationToken,
        responder: AskResponder,
        messages: Vec<UiMessage>,
    ) -> Self {
        let last_ts = messages.iter().map(|m| m.ts).max().unwrap_or(0);
        Self {
            task_id: store.task_id().to_string(),
            store,
            events,
            abort,
            responder,
            state: tokio::sync::Mutex::new(LogState { messages, last_ts }),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn events(&self) -> &EventSender {
        &self.events
    }

    pub fn abort_token(&self) -> &CancellationToken {
        &self.abort
    }

    pub fn ensure_not_aborted(&self) -> TaskResult<()> {
        if self.abort.is_cancelled() {
            Err(TaskError::Aborted)
        } else {
            Ok(())
        }
    }

    /// Snapshot of the UI log.
    pub async fn messages(&self) -> Vec<UiMessage> {
        self.state.lock().await.messages.clone()
    }

    pub async fn last_message(&self) -> Option<UiMessage> {
        self.state.lock().await.messages.last().cloned()
    }

    /// Posts a complete, standalone message.
    pub async fn say(&self, kind: SayKind, text: impl Into<String>) -> TaskResult<()> {
        self.say_full(kind, Some(text.into()), Vec::new(), Update::New)
            .await
    }

    pub async fn say_with_images(
        &self,
        kind: SayKind,
        text: impl Into<String>,
        images: Vec<String>,
    ) -> TaskResult<()> {
        self.say_full(kind, Some(text.into()), images, Update::New)
            .await
    }

    /// Posts or updates a streamed message.
    pub async fn say_streaming(
        &self,
        kind: SayKind,
        text: impl Into<String>,
        partial: bool,
    ) -> TaskResult<()> {
        self.say_full(
            kind,
            Some(text.into()),
            Vec::new(),
            Update::streaming(partial),
        )
        .await
    }

    pub async fn say_full(
        &self,
        kind: SayKind,
        text: Option<String>,
        images: Vec<String>,
        update: Update,
    ) -> TaskResult<()> {
        self.ensure_not_aborted()?;
        let ui_kind = UiKind::Say { say: kind };
        let mut state = self.state.lock().await;

        if update != Update::New
            && let Some(last) = state.last_partial(ui_kind)
        {
            last.text = text;
            last.images = images;
            if update == Update::Partial {
                let event = self.partial_event(last.clone());
                self.events.send_delta(event);
                return Ok(());
            }
            last.partial = false;
            let finished = last.clone();
            self.responder.supersede_unless(finished.ts);
            self.store.save_ui_messages(&state.messages).await?;
            self.events
                .send_important(self.partial_event(finished))
                .await;
            return Ok(());
        }

        let ts = state.next_ts();
        let message = UiMessage {
            ts,
            kind: ui_kind,
            text,
            images,
            partial: update == Update::Partial,
        };
        self.responder.supersede_unless(ts);
        self.push(&mut state, message).await
    }

    /// Asks the host and waits for the decision.
    ///
    /// Fails with `Superseded` if a newer message lands first, and with
    /// `Aborted` if the task is aborted while waiting.
    pub async fn ask(&self, kind: AskKind, text: impl Into<String>) -> TaskResult<AskDecision> {
        self.ask_full(kind, Some(text.into()), Update::New).await
    }

    /// Streams a preview of an ask. Never waits; a superseded preview is
    /// the expected outcome and is swallowed.
    pub async fn ask_partial(&self, kind: AskKind, text: impl Into<String>) -> TaskResult<()> {
        match self
            .ask_full(kind, Some(text.into()), Update::Partial)
            .await
        {
            Err(TaskError::Superseded) | Ok(_) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn ask_full(
        &self,
        kind: AskKind,
        text: Option<String>,
        update: Update,
    ) -> TaskResult<AskDecision> {
        self.ensure_not_aborted()?;
        let ui_kind = UiKind::Ask { ask: kind };
        let waiter = {
            let mut state = self.state.lock().await;

            if update != Update::New
                && let Some(last) = state.last_partial(ui_kind)
            {
                last.text = text;
                if update == Update::Partial {
                    let event = self.partial_event(last.clone());
                    self.events.send_delta(event);
                    return Err(TaskError::Superseded);
                }
                last.partial = false;
                let finished = last.clone();
                let waiter = self.responder.register(finished.ts, &self.abort);
                self.store.save_ui_messages(&state.messages).await?;
                self.events
                    .send_important(self.partial_event(finished))
                    .await;
                waiter
            } else {
                let ts = state.next_ts();
                let partial = update == Update::Partial;
                let message = UiMessage {
                    ts,
                    kind: ui_kind,
                    text,
                    images: Vec::new(),
                    partial,
                };
                if partial {
                    self.responder.supersede_unless(ts);
                    self.push(&mut state, message).await?;
                    return Err(TaskError::Superseded);
                }
                let waiter = self.responder.register(ts, &self.abort);
                self.push(&mut state, message).await?;
                waiter
            }
        };

        tracing::debug!(task_id = %self.task_id, ts = waiter.ts, ask = ?kind, "waiting for decision");
        waiter.wait(&self.abort).await
    }

    /// Posts a blocking ask and returns without waiting. The returned
    /// handle resolves the way `ask` would; a newer message supersedes it.
    pub async fn post_ask(&self, kind: AskKind, text: impl Into<String>) -> TaskResult<PostedAsk> {
        self.ensure_not_aborted()?;
        let mut state = self.state.lock().await;
        let ts = state.next_ts();
        let waiter = self.responder.register(ts, &self.abort);
        let message = UiMessage {
            ts,
            kind: UiKind::Ask { ask: kind },
            text: Some(text.into()),
            images: Vec::new(),
            partial: false,
        };
        self.push(&mut state, message).await?;
        Ok(PostedAsk {
            waiter,
            abort: self.abort.clone(),
        })
    }

    /// Cancels the pending ask, if any, so the host can no longer answer it.
    pub fn withdraw_ask(&self) {
        self.responder.withdraw();
    }

    async fn push(&self, state: &mut LogState, message: UiMessage) -> TaskResult<()> {
        state.messages.push(message.clone());
        self.store.save_ui_messages(&state.messages).await?;
        self.events
            .send_important(TaskEvent::MessageAdded {
                task_id: self.task_id.clone(),
                message,
            })
            .await;
        Ok(())
    }

    fn partial_event(&self, message: UiMessage) -> TaskEvent {
        TaskEvent::PartialMessage {
            task_id: self.task_id.clone(),
            message,
        }
    }

    /// Rewrites the payload of an `api_req_started` message, then saves and
    /// posts state. Works after abort so cancelled requests keep their record.
    pub async fn update_api_req(
        &self,
        ts: u64,
        edit: impl FnOnce(&mut ApiReqInfo),
    ) -> TaskResult<()> {
        let mut state = self.state.lock().await;
        if let Some(message) = state.messages.iter_mut().find(|m| m.ts == ts) {
            let mut info = ApiReqInfo::from_message(message);
            edit(&mut info);
            message.text = Some(info.to_text());
        }
        self.save_and_post(&state).await
    }

    /// Marks a trailing partial message final without posting a new message.
    pub async fn finalize_last_partial(&self) -> TaskResult<()> {
        let mut state = self.state.lock().await;
        if let Some(last) = state.messages.last_mut().filter(|m| m.partial) {
            last.partial = false;
        }
        self.save_and_post(&state).await
    }

    /// Replaces the whole log (resumption cleanup).
    pub async fn overwrite(&self, messages: Vec<UiMessage>) -> TaskResult<()> {
        let mut state = self.state.lock().await;
        state.last_ts = state
            .last_ts
            .max(messages.iter().map(|m| m.ts).max().unwrap_or(0));
        state.messages = messages;
        self.save_and_post(&state).await
    }

    async fn save_and_post(&self, state: &LogState) -> TaskResult<()> {
        self.store.save_ui_messages(&state.messages).await?;
        self.events
            .send_important(TaskEvent::StateChanged {
                task_id: self.task_id.clone(),
                messages: state.messages.clone(),
            })
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::{TempDir, tempdir};
    use tokio::time::timeout;

    use super::*;
    use crate::core::events::{TaskEventRx, create_event_channel};
    use crate::core::messages::AskResponse;

    struct Fixture {
        _dir: TempDir,
        messenger: Messenger,
        responder: AskResponder,
        abort: CancellationToken,
        rx: TaskEventRx,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let store = ConversationStore::new(dir.path(), "t");
        let (tx, rx) = create_event_channel();
        let responder = AskResponder::new();
        let abort = CancellationToken::new();
        let messenger = Messenger::new(
            store,
            EventSender::new(tx),
            abort.clone(),
            responder.clone(),
            Vec::new(),
        );
        Fixture {
            _dir: dir,
            messenger,
            responder,
            abort,
            rx,
        }
    }

    async fn wait_for_pending(responder: &AskResponder) -> u64 {
        timeout(Duration::from_secs(5), async {
            loop {
                if let Some(ts) = responder.pending_ts() {
                    return ts;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("timeout waiting for ask")
    }

    /// Partial says collapse into one message, finalized in place.
    #[tokio::test]
    async fn test_partial_say_collapses() {
        let mut f = fixture();
        let m = &f.messenger;

        m.say_streaming(SayKind::Text, "He", true).await.unwrap();
        m.say_streaming(SayKind::Text, "Hello", true).await.unwrap();
        m.say_streaming(SayKind::Text, "Hello world", false)
            .await
            .unwrap();

        let messages = m.messages().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text(), "Hello world");
        assert!(!messages[0].partial);

        let first = f.rx.recv().await.unwrap();
        assert!(matches!(&*first, TaskEvent::MessageAdded { message, .. } if message.partial));
        let second = f.rx.recv().await.unwrap();
        assert!(matches!(&*second, TaskEvent::PartialMessage { message, .. } if message.text() == "Hello"));
        let third = f.rx.recv().await.unwrap();
        assert!(matches!(&*third, TaskEvent::PartialMessage { message, .. } if !message.partial));

        let saved = m.store().load_ui_messages().await.unwrap();
        assert_eq!(saved, messages);
    }

    /// A partial say of a different kind starts a new message.
    #[tokio::test]
    async fn test_partial_say_different_kind_appends() {
        let f = fixture();
        let m = &f.messenger;

        m.say_streaming(SayKind::Text, "thinking", true).await.unwrap();
        m.say_streaming(SayKind::CompletionResult, "done", true)
            .await
            .unwrap();

        let messages = m.messages().await;
        assert_eq!(messages.len(), 2);
        assert!(messages[0].ts < messages[1].ts);
    }

    /// Timestamps are strictly increasing even within one millisecond.
    #[tokio::test]
    async fn test_timestamps_strictly_increase() {
        let f = fixture();
        for i in 0..20 {
            f.messenger.say(SayKind::Text, format!("{i}")).await.unwrap();
        }
        let messages = f.messenger.messages().await;
        assert!(messages.windows(2).all(|w| w[0].ts < w[1].ts));
    }

    /// An ask resolves with the delivered decision, exactly once.
    #[tokio::test]
    async fn test_ask_resolves_once() {
        let f = fixture();
        let responder = f.responder.clone();

        let (decision, ()) = tokio::join!(
            f.messenger.ask(AskKind::Followup, "which file?"),
            async {
                wait_for_pending(&responder).await;
                responder.respond(AskDecision::message("main.rs")).unwrap();
                assert_eq!(
                    responder.respond(AskDecision::yes()),
                    Err(RespondError::NoPendingAsk)
                );
            }
        );

        let decision = decision.unwrap();
        assert_eq!(decision.response, AskResponse::MessageResponse);
        assert_eq!(decision.text.as_deref(), Some("main.rs"));
        assert!(f.responder.pending_ts().is_none());
    }

    /// Two asks in flight: the first is superseded and never sees the
    /// answer meant for the second.
    #[tokio::test]
    async fn test_second_ask_supersedes_first() {
        let f = fixture();
        let m = &f.messenger;
        let responder = f.responder.clone();

        let (first, second, ()) = tokio::join!(
            m.ask(AskKind::Followup, "first"),
            async {
                wait_for_pending(&responder).await;
                m.ask(AskKind::Followup, "second").await
            },
            async {
                timeout(Duration::from_secs(5), async {
                    while m.messages().await.len() < 2 {
                        tokio::task::yield_now().await;
                    }
                })
                .await
                .expect("timeout waiting for second ask");
                responder.respond(AskDecision::message("answer")).unwrap();
            }
        );

        assert!(matches!(first, Err(TaskError::Superseded)));
        assert_eq!(second.unwrap().text.as_deref(), Some("answer"));
    }

    /// A new say supersedes the pending ask.
    #[tokio::test]
    async fn test_say_supersedes_pending_ask() {
        let f = fixture();
        let m = &f.messenger;
        let responder = f.responder.clone();

        let (asked, said) = tokio::join!(m.ask(AskKind::Tool, "write?"), async {
            wait_for_pending(&responder).await;
            m.say(SayKind::Error, "boom").await
        });

        assert!(matches!(asked, Err(TaskError::Superseded)));
        said.unwrap();
        assert!(responder.pending_ts().is_none());
    }

    /// Abort fails the pending ask with `Aborted`, and later calls at once.
    #[tokio::test]
    async fn test_abort_fails_pending_and_later_calls() {
        let f = fixture();
        let responder = f.responder.clone();
        let abort = f.abort.clone();

        let (asked, ()) = tokio::join!(f.messenger.ask(AskKind::Command, "ls"), async {
            wait_for_pending(&responder).await;
            abort.cancel();
        });

        assert!(matches!(asked, Err(TaskError::Aborted)));
        assert!(matches!(
            f.messenger.say(SayKind::Text, "late").await,
            Err(TaskError::Aborted)
        ));
        assert!(matches!(
            f.messenger.ask(AskKind::Followup, "late").await,
            Err(TaskError::Aborted)
        ));
    }

    /// Partial asks never wait, and finalizing keeps the original ts.
    #[tokio::test]
    async fn test_partial_ask_then_final_keeps_ts() {
        let f = fixture();
        let m = &f.messenger;
        let responder = f.responder.clone();

        assert!(matches!(
            m.ask_full(AskKind::Tool, Some("{\"path\":\"a".into()), Update::Partial)
                .await,
            Err(TaskError::Superseded)
        ));
        m.ask_partial(AskKind::Tool, "{\"path\":\"a.rs\"")
            .await
            .unwrap();
        let partial_ts = m.messages().await[0].ts;

        let (decision, ts) = tokio::join!(
            m.ask_full(AskKind::Tool, Some("{\"path\":\"a.rs\"}".into()), Update::Final),
            async {
                let ts = wait_for_pending(&responder).await;
                responder.respond(AskDecision::yes()).unwrap();
                ts
            }
        );

        assert_eq!(decision.unwrap().response, AskResponse::YesButtonClicked);
        assert_eq!(ts, partial_ts);
        let messages = m.messages().await;
        assert_eq!(messages.len(), 1);
        assert!(!messages[0].partial);
    }

    /// Invalid images are rejected before reaching the task.
    #[tokio::test]
    async fn test_respond_rejects_invalid_image() {
        let f = fixture();
        let responder = f.responder.clone();
        let (asked, ()) = tokio::join!(f.messenger.ask(AskKind::Followup, "?"), async {
            wait_for_pending(&responder).await;
            let mut decision = AskDecision::message("see");
            decision.images.push("not-a-data-url".into());
            assert!(matches!(
                responder.respond(decision),
                Err(RespondError::InvalidImage(_))
            ));
            responder.respond(AskDecision::yes()).unwrap();
        });
        assert!(asked.is_ok());
    }

    /// Request records can be rewritten after abort.
    #[tokio::test]
    async fn test_update_api_req_after_abort() {
        let f = fixture();
        let m = &f.messenger;
        m.say(SayKind::ApiReqStarted, "{\"request\":\"hi\"}")
            .await
            .unwrap();
        let ts = m.messages().await[0].ts;
        f.abort.cancel();

        m.update_api_req(ts, |info| info.cost = Some(0.5))
            .await
            .unwrap();

        let info = ApiReqInfo::from_message(&m.messages().await[0]);
        assert_eq!(info.request.as_deref(), Some("hi"));
        assert_eq!(info.cost, Some(0.5));
    }

    /// An answer arriving after abort is refused and the ask fails.
    #[tokio::test]
    async fn test_respond_after_abort_is_refused() {
        let f = fixture();
        let responder = f.responder.clone();
        let abort = f.abort.clone();

        let (asked, ()) = tokio::join!(f.messenger.ask(AskKind::Tool, "write?"), async {
            wait_for_pending(&responder).await;
            abort.cancel();
            assert_eq!(
                responder.respond(AskDecision::yes()),
                Err(RespondError::NoPendingAsk)
            );
            assert!(responder.pending_ts().is_none());
        });

        assert!(matches!(asked, Err(TaskError::Aborted)));
    }

    /// A decision delivered just before abort is discarded by the waiter.
    #[tokio::test]
    async fn test_decision_racing_abort_is_discarded() {
        let f = fixture();
        let responder = f.responder.clone();
        let abort = f.abort.clone();

        let (asked, ()) = tokio::join!(f.messenger.ask(AskKind::Tool, "write?"), async {
            wait_for_pending(&responder).await;
            responder.respond(AskDecision::yes()).unwrap();
            abort.cancel();
        });

        assert!(matches!(asked, Err(TaskError::Aborted)));
    }
}
