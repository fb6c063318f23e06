//! Configuration management for Cadence.
//!
//! Loads configuration from ${CADENCE_HOME}/config.toml with sensible defaults.
//! The configuration is loaded once per session and handed to the task loop by value.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Per-action switches for auto-approval.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoApprovalActions {
    /// Read files and list directories without asking.
    pub read_files: bool,
    /// Write files without asking.
    pub edit_files: bool,
    /// Run shell commands without asking.
    pub execute_commands: bool,
    /// Drive the browser session without asking.
    pub use_browser: bool,
    /// Call tool servers without asking.
    pub use_mcp: bool,
}

/// Auto-approval policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoApprovalConfig {
    pub enabled: bool,
    /// Consecutive auto-approved requests allowed before asking again.
    pub max_requests: u32,
    pub enable_notifications: bool,
    pub actions: AutoApprovalActions,
}

impl Default for AutoApprovalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_requests: Config::DEFAULT_MAX_AUTO_REQUESTS,
            enable_notifications: false,
            actions: AutoApprovalActions::default(),
        }
    }
}

/// Model pricing in USD per million tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    pub input_per_million: f64,
    pub output_per_million: f64,
    pub cache_writes_per_million: f64,
    pub cache_reads_per_million: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            input_per_million: 3.0,
            output_per_million: 15.0,
            cache_writes_per_million: 3.75,
            cache_reads_per_million: 0.3,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter when `RUST_LOG` is unset (e.g. "info", "cadence_core=debug").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    /// Also write a daily rolling log under ${CADENCE_HOME}/logs.
    pub file: bool,
}

pub mod paths {
    //! Path resolution for Cadence configuration and data directories.
    //!
    //! CADENCE_HOME resolution order:
    //! 1. CADENCE_HOME environment variable (if set)
    //! 2. ~/.config/cadence (default)
    //! 3. ./.cadence when no home directory can be determined

    use std::path::PathBuf;

    /// Returns the Cadence home directory.
    pub fn cadence_home() -> PathBuf {
        if let Ok(home) = std::env::var("CADENCE_HOME") {
            return PathBuf::from(home);
        }

        dirs::home_dir().map_or_else(
            || PathBuf::from(".cadence"),
            |h| h.join(".config").join("cadence"),
        )
    }

    /// Returns the path to the config.toml file.
    pub fn config_path() -> PathBuf {
        cadence_home().join("config.toml")
    }

    /// Returns the path to the task history index.
    pub fn task_history_path() -> PathBuf {
        cadence_home().join("task_history.json")
    }

    /// Returns the directory for rolling log files.
    pub fn logs_dir() -> PathBuf {
        cadence_home().join("logs")
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Layout version of this file.
    pub schema_version: u32,
    /// Model identifier passed to the model adapter.
    pub model: String,
    /// Context window of the model, in tokens.
    pub context_window: u64,
    pub pricing: PricingConfig,
    /// Extra instructions appended to the system prompt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_instructions: Option<String>,
    /// Consecutive mistakes before the user is asked for guidance.
    pub mistake_limit: u32,
    /// Lines of command output kept in a tool result.
    pub command_output_max_lines: usize,
    pub auto_approval: AutoApprovalConfig,
    pub log: LogConfig,
}

impl Config {
    pub const SCHEMA_VERSION: u32 = 1;
    pub const DEFAULT_MODEL: &'static str = "claude-3-5-sonnet-20241022";
    pub const DEFAULT_CONTEXT_WINDOW: u64 = 200_000;
    pub const DEFAULT_MISTAKE_LIMIT: u32 = 3;
    pub const DEFAULT_COMMAND_OUTPUT_MAX_LINES: usize = 200;
    pub const DEFAULT_MAX_AUTO_REQUESTS: u32 = 20;

    /// Loads configuration from the default config path.
    /// Returns defaults if the file doesn't exist.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if file doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))?;
            if config.schema_version > Self::SCHEMA_VERSION {
                anyhow::bail!(
                    "Config at {} has schema_version {}, newest supported is {}",
                    path.display(),
                    config.schema_version,
                    Self::SCHEMA_VERSION
                );
            }
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Turns auto-approval on or off in the default config file.
    pub fn save_auto_approval(enabled: bool) -> Result<()> {
        Self::save_auto_approval_to(&paths::config_path(), enabled)
    }

    /// Turns auto-approval on or off in a specific config file.
    ///
    /// Creates the file from the template if it doesn't exist.
    /// Preserves existing fields and comments using toml_edit.
    pub fn save_auto_approval_to(path: &Path, enabled: bool) -> Result<()> {
        use toml_edit::{DocumentMut, value};

        let contents = if path.exists() {
            fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?
        } else {
            default_config_template().to_string()
        };

        let mut doc: DocumentMut = contents
            .parse()
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        doc["auto_approval"]["enabled"] = value(enabled);

        Self::write_config(path, &doc.to_string())
    }

    /// Creates a default config file at the given path.
    /// Returns an error if the file already exists.
    pub fn init(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("Config file already exists at {}", path.display());
        }

        Self::write_config(path, default_config_template())
    }

    /// Generates a fresh config TOML from Rust defaults.
    ///
    /// Used by `xtask update-default-config` to keep `default_config.toml`
    /// in sync with the values in `Config::default()`. Comments in the
    /// template survive; values are overwritten.
    pub fn generate() -> Result<String> {
        use toml_edit::DocumentMut;

        let generated_toml = toml::to_string(&Config::default())
            .context("Failed to serialize default config to TOML")?;

        let mut doc: DocumentMut = default_config_template()
            .parse()
            .context("Failed to parse default config template")?;
        let generated_doc: DocumentMut = generated_toml
            .parse()
            .context("Failed to parse generated config")?;

        merge_items(doc.as_table_mut(), generated_doc.as_table());

        Ok(doc.to_string())
    }

    /// Writes config content to a file, creating parent directories as needed.
    /// Uses atomic write (temp file + rename) to prevent corruption.
    fn write_config(path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let tmp_path = path.with_extension("toml.tmp");
        fs::write(&tmp_path, content)
            .with_context(|| format!("Failed to write config to {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path).with_context(|| {
            format!(
                "Failed to rename {} to {}",
                tmp_path.display(),
                path.display()
            )
        })?;

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            schema_version: Self::SCHEMA_VERSION,
            model: Self::DEFAULT_MODEL.to_string(),
            context_window: Self::DEFAULT_CONTEXT_WINDOW,
            pricing: PricingConfig::default(),
            custom_instructions: None,
            mistake_limit: Self::DEFAULT_MISTAKE_LIMIT,
            command_output_max_lines: Self::DEFAULT_COMMAND_OUTPUT_MAX_LINES,
            auto_approval: AutoApprovalConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// Returns the default config template with comments.
///
/// Embedded from default_config.toml at compile time.
fn default_config_template() -> &'static str {
    include_str!("../default_config.toml")
}

/// Recursively merges items from source table into target table.
fn merge_items(target: &mut toml_edit::Table, source: &toml_edit::Table) {
    use toml_edit::Item;

    for (key, value) in source.iter() {
        match value {
            Item::Value(v) => {
                target[key] = Item::Value(v.clone());
            }
            Item::Table(src_table) => {
                if let Some(Item::Table(target_table)) = target.get_mut(key) {
                    merge_items(target_table, src_table);
                } else {
                    target[key] = Item::Table(src_table.clone());
                }
            }
            Item::ArrayOfTables(src_arr) => {
                target[key] = Item::ArrayOfTables(src_arr.clone());
            }
            Item::None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    /// Config loading: missing file returns defaults.
    #[test]
    fn test_load_missing_file_returns_defaults() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("nonexistent.toml");

        let config = Config::load_from(&config_path).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.mistake_limit, 3);
        assert_eq!(config.auto_approval.max_requests, 20);
    }

    /// Config loading: partial config merges with defaults.
    #[test]
    fn test_load_partial_config_merges_defaults() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.toml");

        fs::write(
            &config_path,
            "model = \"local-model\"\n\n[auto_approval.actions]\nread_files = true\n",
        )
        .unwrap();

        let config = Config::load_from(&config_path).unwrap();
        assert_eq!(config.model, "local-model");
        assert!(config.auto_approval.actions.read_files);
        assert!(!config.auto_approval.actions.edit_files);
        assert_eq!(config.context_window, Config::DEFAULT_CONTEXT_WINDOW);
    }

    /// Config loading: a file from a newer layout is refused.
    #[test]
    fn test_load_rejects_newer_schema() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        fs::write(&config_path, "schema_version = 99\n").unwrap();

        let err = Config::load_from(&config_path).unwrap_err();
        assert!(err.to_string().contains("schema_version 99"));
    }

    /// Config loading: invalid TOML reports the path.
    #[test]
    fn test_load_invalid_toml_reports_path() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        fs::write(&config_path, "model = [").unwrap();

        let err = Config::load_from(&config_path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }

    /// Config init: creates file with defaults, creates parent dirs.
    #[test]
    fn test_init_creates_config_with_defaults() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("subdir").join("config.toml");

        Config::init(&config_path).unwrap();

        assert!(config_path.exists());
        let config = Config::load_from(&config_path).unwrap();
        assert_eq!(config, Config::default());
    }

    /// Config init: refuses to overwrite an existing file.
    #[test]
    fn test_init_fails_if_exists() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        fs::write(&config_path, "# mine").unwrap();

        let err = Config::init(&config_path).unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(fs::read_to_string(&config_path).unwrap(), "# mine");
    }

    /// save_auto_approval: flips the flag and keeps user comments.
    #[test]
    fn test_save_auto_approval_preserves_comments() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        fs::write(
            &config_path,
            "# my notes\nmodel = \"m\"\n\n[auto_approval]\nenabled = false\n",
        )
        .unwrap();

        Config::save_auto_approval_to(&config_path, true).unwrap();

        let contents = fs::read_to_string(&config_path).unwrap();
        assert!(contents.contains("# my notes"));
        let config = Config::load_from(&config_path).unwrap();
        assert!(config.auto_approval.enabled);
        assert_eq!(config.model, "m");
    }

    /// generate: the result parses back to the defaults.
    #[test]
    fn test_generate_round_trips_defaults() {
        let generated = Config::generate().unwrap();
        let parsed: Config = toml::from_str(&generated).unwrap();
        assert_eq!(parsed, Config::default());
        assert!(generated.contains("# "));
    }
}
