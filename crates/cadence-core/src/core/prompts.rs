//! System prompt assembly (`MiniJinja`).

use anyhow::{Context, Result};
use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;

use crate::core::context::SystemInfo;

/// Prompt template for the system prompt.
pub const SYSTEM_PROMPT_TEMPLATE: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/prompts/system_prompt.md"
));

#[derive(Debug, Serialize)]
struct PromptVars<'a> {
    cwd: &'a str,
    os: &'a str,
    shell: &'a str,
    home: &'a str,
    custom_instructions: &'a str,
}

/// Renders the system prompt, with custom instructions appended when set.
pub fn render_system_prompt(info: &SystemInfo, custom_instructions: Option<&str>) -> Result<String> {
    let cwd = info.cwd.display().to_string();
    let home = info.home.display().to_string();
    let vars = PromptVars {
        cwd: &cwd,
        os: &info.os,
        shell: &info.shell,
        home: &home,
        custom_instructions: custom_instructions.map_or("", str::trim),
    };

    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.add_template("system_prompt", SYSTEM_PROMPT_TEMPLATE)
        .context("parse system prompt template")?;
    let output = env
        .get_template("system_prompt")
        .context("load system prompt template")?
        .render(&vars)
        .context("render system prompt")?;

    Ok(output.replace("\r\n", "\n").trim().to_string())
}
