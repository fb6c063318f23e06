//! Runtime execution modes.
//!
//! - `console`: line-oriented host answering asks from stdin

pub mod console;
