//! Workspace backed by the local filesystem and `sh`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use globset::{Glob, GlobMatcher};
use ignore::WalkBuilder;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::workspace::{CommandEvent, FileEntry, Workspace};

/// Maximum matches reported by a search.
const MAX_SEARCH_RESULTS: usize = 300;

/// Source extensions scanned for definitions.
const SOURCE_EXTENSIONS: &[&str] = &[
    "rs", "ts", "tsx", "js", "jsx", "py", "go", "java", "c", "h", "cpp", "hpp", "rb", "swift",
];

const COMMAND_CHANNEL_CAPACITY: usize = 64;

pub struct LocalWorkspace {
    root: PathBuf,
    shutdown: CancellationToken,
}

impl LocalWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            shutdown: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Workspace for LocalWorkspace {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn read_file(&self, path: &Path) -> Result<String> {
        tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))
    }

    async fn file_exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn write_file(&self, path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    async fn list_files(
        &self,
        path: &Path,
        recursive: bool,
        limit: usize,
    ) -> Result<(Vec<FileEntry>, bool)> {
        let dir = path.to_path_buf();
        tokio::task::spawn_blocking(move || walk_entries(&dir, recursive, limit))
            .await
            .context("list_files worker panicked")?
    }

    async fn search_files(
        &self,
        path: &Path,
        regex: &str,
        file_pattern: Option<&str>,
    ) -> Result<String> {
        let pattern = Regex::new(regex).with_context(|| format!("Invalid regex '{regex}'"))?;
        let matcher = file_pattern
            .map(|glob| {
                Glob::new(glob)
                    .map(|g| g.compile_matcher())
                    .with_context(|| format!("Invalid file pattern '{glob}'"))
            })
            .transpose()?;
        let dir = path.to_path_buf();
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || search(&root, &dir, &pattern, matcher.as_ref()))
            .await
            .context("search_files worker panicked")?
    }

    async fn list_code_definitions(&self, path: &Path) -> Result<String> {
        let (entries, _) = self.list_files(path, false, 200).await?;
        let definition = Regex::new(
            r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:export\s+)?(?:default\s+)?(?:async\s+)?(?:fn|struct|enum|trait|impl|mod|class|def|function|interface|type|func)\b",
        )?;

        let mut out = String::new();
        for entry in entries.iter().filter(|e| !e.is_dir) {
            let is_source = entry
                .path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext));
            if !is_source {
                continue;
            }
            let Ok(contents) = tokio::fs::read_to_string(&entry.path).await else {
                continue;
            };
            let lines: Vec<&str> = contents
                .lines()
                .filter(|line| definition.is_match(line))
                .collect();
            if lines.is_empty() {
                continue;
            }
            out.push_str(&relative_to(&self.root, &entry.path));
            out.push_str("\n|----\n");
            for line in lines {
                out.push('│');
                out.push_str(line.trim_end());
                out.push_str("\n|----\n");
            }
            out.push('\n');
        }

        if out.is_empty() {
            Ok("No source code definitions found.".to_string())
        } else {
            Ok(out.trim_end().to_string())
        }
    }

    async fn run_command(&self, command: &str) -> Result<mpsc::Receiver<CommandEvent>> {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.root)
            // Non-interactive, dumb terminal: no colors or progress bars.
            .env("TERM", "dumb")
            .env("NO_COLOR", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to execute command '{command}'"))?;

        let stdout = child.stdout.take().context("stdout not captured")?;
        let stderr = child.stderr.take().context("stderr not captured")?;
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let cancel = self.shutdown.child_token();

        tokio::spawn(async move {
            let mut out_lines = BufReader::new(stdout).lines();
            let mut err_lines = BufReader::new(stderr).lines();
            let mut out_open = true;
            let mut err_open = true;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        let _ = child.kill().await;
                        return;
                    }
                    () = tx.closed() => {
                        let _ = child.kill().await;
                        return;
                    }
                    line = out_lines.next_line(), if out_open => match line {
                        Ok(Some(line)) => {
                            let _ = tx.send(CommandEvent::Line(line)).await;
                        }
                        _ => out_open = false,
                    },
                    line = err_lines.next_line(), if err_open => match line {
                        Ok(Some(line)) => {
                            let _ = tx.send(CommandEvent::Line(line)).await;
                        }
                        _ => err_open = false,
                    },
                    status = child.wait(), if !out_open && !err_open => {
                        let exit_code = status.ok().and_then(|s| s.code());
                        let _ = tx.send(CommandEvent::Completed { exit_code }).await;
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn dispose(&self) {
        self.shutdown.cancel();
    }
}

fn relative_to(base: &Path, path: &Path) -> String {
    path.strip_prefix(base).unwrap_or(path).display().to_string()
}

fn walk_entries(dir: &Path, recursive: bool, limit: usize) -> Result<(Vec<FileEntry>, bool)> {
    if !dir.is_dir() {
        anyhow::bail!("{} is not a directory", dir.display());
    }
    let walker = WalkBuilder::new(dir)
        .standard_filters(true)
        .hidden(false)
        .filter_entry(|entry| entry.file_name() != ".git")
        .max_depth(if recursive { None } else { Some(1) })
        .build();

    let mut entries = Vec::new();
    for entry in walker.flatten() {
        if entry.depth() == 0 {
            continue;
        }
        if entries.len() >= limit {
            return Ok((entries, true));
        }
        entries.push(FileEntry {
            path: entry.path().to_path_buf(),
            is_dir: entry.file_type().is_some_and(|ft| ft.is_dir()),
        });
    }
    Ok((entries, false))
}

fn search(
    root: &Path,
    dir: &Path,
    pattern: &Regex,
    matcher: Option<&GlobMatcher>,
) -> Result<String> {
    let walker = WalkBuilder::new(dir).standard_filters(true).build();

    // (file, line) pairs, grouped by file in walk order.
    let mut matches: Vec<(String, String)> = Vec::new();
    let mut truncated = false;
    'files: for entry in walker.flatten() {
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        let path = entry.path();
        if let Some(matcher) = matcher {
            let name_matches = path.file_name().is_some_and(|name| matcher.is_match(name));
            if !name_matches && !matcher.is_match(path) {
                continue;
            }
        }
        let Ok(contents) = std::fs::read_to_string(path) else {
            continue;
        };
        let relative = relative_to(root, path);
        for line in contents.lines().filter(|line| pattern.is_match(line)) {
            if matches.len() >= MAX_SEARCH_RESULTS {
                truncated = true;
                break 'files;
            }
            matches.push((relative.clone(), line.trim_end().to_string()));
        }
    }

    let mut out = if truncated {
        format!(
            "Showing first {MAX_SEARCH_RESULTS} of {MAX_SEARCH_RESULTS}+ results. Use a more specific search if necessary.\n\n"
        )
    } else if matches.len() == 1 {
        "Found 1 result.\n\n".to_string()
    } else {
        format!("Found {} results.\n\n", matches.len())
    };

    let mut current: Option<&str> = None;
    for (file, line) in &matches {
        if current != Some(file.as_str()) {
            if current.is_some() {
                out.push('\n');
            }
            out.push_str(file);
            out.push_str("\n│----\n");
            current = Some(file);
        }
        out.push('│');
        out.push_str(line);
        out.push_str("\n│----\n");
    }
    Ok(out.trim_end().to_string())
}
