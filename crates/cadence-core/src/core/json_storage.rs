//! JSON array files with corruption recovery and atomic writes.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;

use crate::error::PersistenceError;

const READ_ATTEMPTS: u32 = 3;
const READ_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Reads a JSON array.
///
/// A missing file reads as empty. A file that still fails to read or parse
/// after [`READ_ATTEMPTS`] tries is copied aside to `<name>.corrupt-<ts>.bak`
/// and reset to `[]`.
pub async fn read_json_array<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, PersistenceError> {
    let mut last_error = String::new();
    for attempt in 1..=READ_ATTEMPTS {
        match fs::read_to_string(path).await {
            Ok(contents) => match serde_json::from_str::<Vec<T>>(&contents) {
                Ok(items) => return Ok(items),
                Err(err) => last_error = err.to_string(),
            },
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => last_error = err.to_string(),
        }
        if attempt < READ_ATTEMPTS {
            tokio::time::sleep(READ_RETRY_DELAY).await;
        }
    }

    let backup = backup_path(path);
    tracing::warn!(
        path = %path.display(),
        backup = %backup.display(),
        error = %last_error,
        "unreadable log, backing up and resetting"
    );
    fs::copy(path, &backup)
        .await
        .map_err(|source| PersistenceError::io(&backup, source))?;
    write_atomic(path, b"[]").await?;
    Ok(Vec::new())
}

/// Serializes `value` and replaces `path` atomically.
pub async fn write_json<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
    pretty: bool,
) -> Result<(), PersistenceError> {
    let bytes = if pretty {
        serde_json::to_vec_pretty(value)
    } else {
        serde_json::to_vec(value)
    }
    .map_err(|source| PersistenceError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, &bytes).await
}

/// Writes to a sibling temp file, then renames over the target.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|source| PersistenceError::io(parent, source))?;
    }
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, bytes)
        .await
        .map_err(|source| PersistenceError::io(&tmp_path, source))?;
    fs::rename(&tmp_path, path)
        .await
        .map_err(|source| PersistenceError::io(path, source))
}

fn backup_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%3f");
    path.with_file_name(format!("{name}.corrupt-{stamp}.bak"))
}
