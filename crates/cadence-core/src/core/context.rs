//! Environment details attached to every outgoing user turn.

use std::path::PathBuf;

use crate::core::responses::format_files_list;
use crate::tools::Workspace;

/// Maximum entries in the first-request directory listing.
pub const ENVIRONMENT_FILES_LIMIT: usize = 200;

/// Facts about the machine the task runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemInfo {
    pub os: String,
    pub shell: String,
    pub home: PathBuf,
    pub cwd: PathBuf,
}

impl SystemInfo {
    pub fn detect(cwd: PathBuf) -> Self {
        Self {
            os: format!("{} ({})", std::env::consts::OS, std::env::consts::ARCH),
            shell: std::env::var("SHELL").unwrap_or_else(|_| "sh".to_string()),
            home: dirs::home_dir().unwrap_or_default(),
            cwd,
        }
    }
}

/// Builds the `<environment_details>` block.
///
/// With `include_file_details`, a recursive listing of the working
/// directory is added. Listing failures degrade to a note; they never fail
/// the request.
pub async fn environment_details(
    info: &SystemInfo,
    workspace: &dyn Workspace,
    include_file_details: bool,
) -> String {
    let mut details = format!(
        "# SYSTEM INFORMATION\nOperating System: {}\nDefault Shell: {}\nHome Directory: {}\nCurrent Working Directory: {}",
        info.os,
        info.shell,
        info.home.display(),
        info.cwd.display()
    );

    if include_file_details {
        details.push_str(&format!(
            "\n\n# Current Working Directory ({}) Files\n",
            info.cwd.display()
        ));
        match workspace
            .list_files(&info.cwd, true, ENVIRONMENT_FILES_LIMIT)
            .await
        {
            Ok((entries, hit_limit)) => {
                details.push_str(&format_files_list(&info.cwd, &entries, hit_limit));
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to list working directory");
                details.push_str("(Unable to list files)");
            }
        }
    }

    format!(
        "<environment_details>\n{}\n</environment_details>",
        details.trim()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeWorkspace;

    fn info() -> SystemInfo {
        SystemInfo {
            os: "linux".into(),
            shell: "/bin/zsh".into(),
            home: PathBuf::from("/home/dev"),
            cwd: PathBuf::from("/work"),
        }
    }

    /// Without file details only the system section is present.
    #[tokio::test]
    async fn test_environment_details_basic() {
        let ws = FakeWorkspace::new("/work");
        let details = environment_details(&info(), &ws, false).await;
        assert!(details.starts_with("<environment_details>\n# SYSTEM INFORMATION"));
        assert!(details.contains("Default Shell: /bin/zsh"));
        assert!(details.ends_with("</environment_details>"));
        assert!(!details.contains("Files"));
    }

    /// The first request lists the working directory.
    #[tokio::test]
    async fn test_environment_details_with_files() {
        let ws = FakeWorkspace::new("/work")
            .with_file("src/main.rs", "fn main() {}")
            .with_file("Cargo.toml", "[package]");
        let details = environment_details(&info(), &ws, true).await;
        assert!(details.contains("# Current Working Directory (/work) Files\nCargo.toml\nsrc/main.rs"));
    }
}
