//! Sliding-window compaction of the API history.

use crate::core::messages::ApiMessage;

/// Context window assumed when the model reports none.
const FALLBACK_CONTEXT_WINDOW: u64 = 128_000;

/// Headroom kept free below the context window.
const CONTEXT_HEADROOM: u64 = 40_000;

/// True when the previous request used enough of the window that the
/// history should be halved before the next one.
pub fn should_compact(previous_total_tokens: u64, context_window: u64) -> bool {
    let window = if context_window == 0 {
        FALLBACK_CONTEXT_WINDOW
    } else {
        context_window
    };
    let threshold = window
        .saturating_sub(CONTEXT_HEADROOM)
        .max(window * 4 / 5);
    previous_total_tokens >= threshold
}

/// Drops roughly the oldest half of the turns after the first message.
///
/// The first message (the task) is always kept. An even number of messages
/// is removed starting right after it, so user/assistant alternation holds
/// and a tool call is never separated from its result.
pub fn truncate_half_conversation(messages: &[ApiMessage]) -> Vec<ApiMessage> {
    let Some((first, rest)) = messages.split_first() else {
        return Vec::new();
    };
    let remove = (rest.len() / 4) * 2;
    let mut kept = Vec::with_capacity(messages.len() - remove);
    kept.push(first.clone());
    kept.extend_from_slice(&rest[remove..]);
    kept
}
