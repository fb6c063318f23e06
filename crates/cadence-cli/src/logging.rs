//! Diagnostics via `tracing`.
//!
//! stdout belongs to the console renderer, so diagnostics go to stderr and,
//! when `log.file` is set, to a daily rolling file under
//! `${CADENCE_HOME}/logs`.
//!
//! ```bash
//! RUST_LOG=cadence_core=debug cadence run --task "..." --script turns.json
//! ```

use anyhow::{Context, Result};
use cadence_core::config::{LogConfig, paths};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "warn";

/// Installs the global subscriber.
///
/// `RUST_LOG` wins over `log.level`. The returned guard flushes the file
/// writer on drop and must live as long as the process.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let default = config.level.as_deref().unwrap_or(DEFAULT_FILTER);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let stderr_layer = fmt::layer().with_writer(std::io::stderr).compact();

    if !config.file {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .try_init()
            .context("install tracing subscriber")?;
        return Ok(None);
    }

    let dir = paths::logs_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("create log directory {}", dir.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(
        &dir,
        "cadence.log",
    ));

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .try_init()
        .context("install tracing subscriber")?;
    Ok(Some(guard))
}
