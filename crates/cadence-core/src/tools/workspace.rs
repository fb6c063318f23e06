//! File and shell collaborator.

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// A listed path. Directories are reported separately so listings can put
/// them first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub is_dir: bool,
}

/// Progress of a running shell command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandEvent {
    Line(String),
    /// The process exited. `None` when it was killed by a signal.
    Completed { exit_code: Option<i32> },
}

/// Everything tools do to the user's machine goes through here.
///
/// Paths handed to these methods are already resolved against [`root`].
///
/// [`root`]: Workspace::root
#[async_trait]
pub trait Workspace: Send + Sync {
    /// Working directory of the task.
    fn root(&self) -> &Path;

    async fn read_file(&self, path: &Path) -> Result<String>;

    async fn file_exists(&self, path: &Path) -> bool;

    /// Writes `content`, creating parent directories as needed.
    async fn write_file(&self, path: &Path, content: &str) -> Result<()>;

    /// Lists up to `limit` entries. The flag is true when the limit was hit.
    async fn list_files(
        &self,
        path: &Path,
        recursive: bool,
        limit: usize,
    ) -> Result<(Vec<FileEntry>, bool)>;

    /// Regex search, formatted for the model.
    async fn search_files(&self, path: &Path, regex: &str, file_pattern: Option<&str>)
    -> Result<String>;

    /// Top-level definitions of the source files in `path`, formatted for
    /// the model.
    async fn list_code_definitions(&self, path: &Path) -> Result<String>;

    /// Starts `command` in [`root`](Workspace::root). Output arrives line by
    /// line and ends with [`CommandEvent::Completed`]. Dropping the receiver
    /// kills the process.
    async fn run_command(&self, command: &str) -> Result<mpsc::Receiver<CommandEvent>>;

    /// Releases running processes. Called on abort.
    async fn dispose(&self);
}

/// Resolves a model-supplied path against the workspace root.
pub fn resolve_path(root: &Path, path: &str) -> PathBuf {
    let requested = Path::new(path);
    if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        root.join(requested)
    }
}

/// Path as shown to the user: relative to `root` when inside it.
pub fn readable_path(root: &Path, path: &str) -> String {
    let absolute = resolve_path(root, path);
    match absolute.strip_prefix(root) {
        Ok(relative) if relative.as_os_str().is_empty() => root.display().to_string(),
        Ok(relative) => relative.display().to_string(),
        Err(_) => absolute.display().to_string(),
    }
}
