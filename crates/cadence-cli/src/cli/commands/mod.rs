//! CLI command handlers.

pub mod config;
pub mod resume;
pub mod run;
pub mod tasks;
