//! Cadence engine library (task loop, tools, config, model adapter).

pub mod config;
pub mod core;
pub mod error;
pub mod model;
pub mod tools;

#[cfg(test)]
mod testing;
