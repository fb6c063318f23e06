//! Core module: the UI-agnostic turn engine.
//!
//! This module contains:
//! - `messages`, `store`, `history`, `json_storage`: both conversation logs and their persistence
//! - `events`, `interaction`: host notifications and the ask/say protocol
//! - `parser`, `presenter`: streaming parse and in-order presentation of a response
//! - `dispatcher`, `responses`: tool approval, execution and model-facing texts
//! - `prompts`, `context`, `compaction`: what goes into each request
//! - `task`, `resume`, `host`: the task loop, cold-start resumption and task ownership
//! - `interrupt`: Ctrl+C handling for console hosts

pub mod compaction;
pub mod context;
pub mod dispatcher;
pub mod events;
pub mod history;
pub mod host;
pub mod interaction;
pub mod interrupt;
pub mod json_storage;
pub mod messages;
pub mod parser;
pub mod presenter;
pub mod prompts;
pub mod responses;
pub mod resume;
pub mod store;
pub mod task;
