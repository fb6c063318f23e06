//! Resume command handler.

use std::path::Path;

use anyhow::Result;
use cadence_core::config::Config;

use crate::modes::console::{self, ConsoleOptions, ConsoleStart};

pub async fn run(id: &str, root: &Path, script: &Path, yes: bool, config: Config) -> Result<()> {
    let options = ConsoleOptions {
        root: root.to_path_buf(),
        script: script.to_path_buf(),
        auto_answer: yes,
    };
    console::run_console(config, ConsoleStart::Resume { id: id.to_string() }, &options).await
}
