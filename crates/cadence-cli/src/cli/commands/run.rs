//! Run command handler.

use std::path::Path;

use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use cadence_core::config::Config;

use crate::modes::console::{self, ConsoleOptions, ConsoleStart};

pub struct RunOptions<'a> {
    pub root: &'a Path,
    pub task: String,
    pub images: Vec<String>,
    pub script: &'a Path,
    pub yes: bool,
    pub config: Config,
}

/// Turns on auto-approval for every action category, for this run only.
pub fn enable_auto_approval(config: &mut Config) {
    let auto = &mut config.auto_approval;
    auto.enabled = true;
    auto.actions.read_files = true;
    auto.actions.edit_files = true;
    auto.actions.execute_commands = true;
    auto.actions.use_browser = true;
    auto.actions.use_mcp = true;
}

pub async fn run(options: RunOptions<'_>) -> Result<()> {
    let images = options
        .images
        .iter()
        .map(|image| load_image(image))
        .collect::<Result<Vec<_>>>()?;

    let console_opts = ConsoleOptions {
        root: options.root.to_path_buf(),
        script: options.script.to_path_buf(),
        auto_answer: options.yes,
    };
    console::run_console(
        options.config,
        ConsoleStart::New {
            text: options.task,
            images,
        },
        &console_opts,
    )
    .await
}

/// Accepts a data URL as is, or reads an image file into one.
fn load_image(arg: &str) -> Result<String> {
    if arg.starts_with("data:") {
        return Ok(arg.to_string());
    }
    let path = Path::new(arg);
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let media_type = match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => bail!("unsupported image file '{arg}' (expected png, jpeg, gif or webp)"),
    };
    let bytes = std::fs::read(path).with_context(|| format!("read image {}", path.display()))?;
    Ok(format!("data:{media_type};base64,{}", BASE64.encode(bytes)))
}
