//! Streaming content processing for one turn.
//!
//! Two futures run side by side:
//!
//! ```text
//! read_stream ──(watch: StreamSnapshot)──► Presenter::run
//!      ▲                                        │
//!      └──────── stop token (tool used, ────────┘
//!                rejected, presenter error)
//! ```
//!
//! The reader re-parses the whole accumulated text after every chunk and
//! publishes the block list. The presenter is the only worker that ever
//! presents blocks: it owns a cursor, presents `blocks[cursor]`, and only
//! advances once that block is final (or the turn already used or rejected a
//! tool). A partial block is presented again whenever a newer snapshot
//! arrives, so each block is finished exactly once and strictly in order.

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::core::dispatcher::{Dispatcher, ToolOutcome, TurnFlags};
use crate::core::interaction::Messenger;
use crate::core::messages::{ApiBlock, SayKind};
use crate::core::parser::{ContentBlock, display_text, parse_assistant_message};
use crate::core::responses::{NO_OUTPUT, skipped_after_rejection, skipped_after_tool_use};
use crate::error::TaskResult;
use crate::model::{ApiChunk, ApiStream, ProviderError, Usage};
use crate::tools::tool_description;

/// Parsed view of the stream so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSnapshot {
    pub blocks: Vec<ContentBlock>,
    /// The reader is done; every block is final.
    pub complete: bool,
}

/// How reading ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadEnd {
    /// The stream ran out.
    Finished,
    /// The stop token fired (abort, tool used, tool rejected).
    Stopped,
    /// The stream yielded an error.
    Failed(ProviderError),
}

/// Raw outcome of reading a response stream.
#[derive(Debug, Clone)]
pub struct StreamRead {
    /// Accumulated assistant text, exactly as streamed.
    pub text: String,
    pub usage: Usage,
    pub end: ReadEnd,
}

/// Reads `stream` until it ends, fails, or `stop` fires, publishing a
/// snapshot after every text chunk. `first` is a chunk already pulled off
/// the stream.
///
/// The last snapshot sent has every block forced final and `complete` set.
pub async fn read_stream(
    mut stream: ApiStream,
    first: Option<ApiChunk>,
    snapshots: watch::Sender<StreamSnapshot>,
    stop: &CancellationToken,
) -> StreamRead {
    let mut text = String::new();
    let mut usage = Usage::default();
    let mut pending = first;

    let end = loop {
        let item = match pending.take() {
            Some(chunk) => Some(Ok(chunk)),
            None => tokio::select! {
                biased;
                () = stop.cancelled() => break ReadEnd::Stopped,
                item = stream.next() => item,
            },
        };
        match item {
            None => break ReadEnd::Finished,
            Some(Err(err)) => break ReadEnd::Failed(err),
            Some(Ok(ApiChunk::Usage(chunk))) => {
                usage.input_tokens += chunk.input_tokens;
                usage.output_tokens += chunk.output_tokens;
                usage.cache_write_tokens += chunk.cache_write_tokens;
                usage.cache_read_tokens += chunk.cache_read_tokens;
                usage.total_cost = chunk.total_cost.or(usage.total_cost);
            }
            Some(Ok(ApiChunk::Text(chunk))) => {
                text.push_str(&chunk);
                snapshots.send_replace(StreamSnapshot {
                    blocks: parse_assistant_message(&text),
                    complete: false,
                });
            }
        }
        if stop.is_cancelled() {
            break ReadEnd::Stopped;
        }
    };

    let blocks = parse_assistant_message(&text)
        .into_iter()
        .map(ContentBlock::into_final)
        .collect();
    snapshots.send_replace(StreamSnapshot {
        blocks,
        complete: true,
    });
    StreamRead { text, usage, end }
}

/// What presenting a turn produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresentedTurn {
    /// Content for the next user message.
    pub user_content: Vec<ApiBlock>,
    /// The user accepted a completion result.
    pub completed: bool,
    /// At least one block was a tool call.
    pub saw_tool_use: bool,
}

/// Single worker presenting the blocks of one turn in order.
pub struct Presenter<'a> {
    messenger: &'a Messenger,
    dispatcher: &'a mut Dispatcher,
    flags: &'a TurnFlags,
    stop: &'a CancellationToken,
    turn: PresentedTurn,
}

impl<'a> Presenter<'a> {
    pub fn new(
        messenger: &'a Messenger,
        dispatcher: &'a mut Dispatcher,
        flags: &'a TurnFlags,
        stop: &'a CancellationToken,
    ) -> Self {
        Self {
            messenger,
            dispatcher,
            flags,
            stop,
            turn: PresentedTurn::default(),
        }
    }

    /// Presents snapshots until the cursor passes the last block of a
    /// complete snapshot. On error the stop token is cancelled so the reader
    /// does not keep consuming.
    pub async fn run(mut self, mut snapshots: watch::Receiver<StreamSnapshot>) -> TaskResult<PresentedTurn> {
        match self.present_all(&mut snapshots).await {
            Ok(()) => Ok(self.turn),
            Err(err) => {
                self.stop.cancel();
                Err(err)
            }
        }
    }

    async fn present_all(&mut self, snapshots: &mut watch::Receiver<StreamSnapshot>) -> TaskResult<()> {
        let mut cursor = 0;
        let mut closed = false;
        loop {
            let (block, complete) = {
                let snapshot = snapshots.borrow_and_update();
                (snapshot.blocks.get(cursor).cloned(), snapshot.complete || closed)
            };
            let Some(block) = block else {
                if complete {
                    tracing::debug!(blocks = cursor, "turn presented");
                    return Ok(());
                }
                closed = snapshots.changed().await.is_err();
                continue;
            };
            let block = if complete { block.into_final() } else { block };

            self.present(&block).await?;

            if !block.is_partial() || self.flags.rejected() || self.flags.used_tool() {
                cursor += 1;
                continue;
            }
            closed = snapshots.changed().await.is_err();
        }
    }

    async fn present(&mut self, block: &ContentBlock) -> TaskResult<()> {
        match block {
            ContentBlock::Text { content, partial } => {
                if self.flags.rejected() || self.flags.used_tool() {
                    return Ok(());
                }
                let shown = display_text(content);
                if shown.is_empty() {
                    return Ok(());
                }
                self.messenger
                    .say_streaming(SayKind::Text, shown, *partial)
                    .await
            }
            ContentBlock::ToolUse(tool) => {
                self.turn.saw_tool_use = true;
                let description = tool_description(tool.name, &tool.params);
                if self.flags.rejected() {
                    self.turn.user_content.push(ApiBlock::text(skipped_after_rejection(
                        &description,
                        tool.partial,
                    )));
                    return Ok(());
                }
                if self.flags.used_tool() {
                    self.turn
                        .user_content
                        .push(ApiBlock::text(skipped_after_tool_use(tool.name.as_str())));
                    return Ok(());
                }

                match self
                    .dispatcher
                    .dispatch(self.messenger, self.flags, tool)
                    .await?
                {
                    ToolOutcome::Preview => {}
                    ToolOutcome::Result(content) => self.push_tool_result(&description, content),
                    ToolOutcome::TaskCompleted => {
                        self.turn.completed = true;
                        self.push_tool_result(&description, Vec::new());
                    }
                }
                Ok(())
            }
        }
    }

    /// Merges the turn's one tool result and stops the reader.
    fn push_tool_result(&mut self, description: &str, content: Vec<ApiBlock>) {
        let content_empty = content
            .iter()
            .all(|block| block.as_text().is_some_and(str::is_empty));
        self.turn
            .user_content
            .push(ApiBlock::text(format!("{description} Result:")));
        if content_empty {
            self.turn.user_content.push(ApiBlock::text(NO_OUTPUT));
        } else {
            self.turn.user_content.extend(content);
        }
        self.flags.set_used_tool();
        self.stop.cancel();
    }
}
