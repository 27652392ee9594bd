//! Crash-safe file replacement.
//!
//! Every persisted document is written to a uniquely named hidden sibling,
//! flushed to disk, renamed over the target and followed by a sync of the
//! parent directory. A reader sees either the previous document or the new
//! one, never a prefix.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::error::Result;

/// Suffix of in-flight temporary files; never treated as documents
pub(crate) const TEMP_SUFFIX: &str = ".tmp";

fn parent_dir(path: &Path) -> &Path {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
}

/// Atomically replace `path` with `bytes`
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = parent_dir(path);
    tokio::fs::create_dir_all(parent).await?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("document");
    let tmp = parent.join(format!(
        ".{file_name}.{}{TEMP_SUFFIX}",
        uuid::Uuid::new_v4().simple()
    ));

    let result = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, path).await?;
        sync_dir(parent).await
    }
    .await;

    if result.is_err() {
        // best effort; a leftover temp file is ignored by every reader
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}

/// Serialize `value` as pretty JSON and atomically replace `path`
pub(crate) async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes).await
}

/// Rename a bad file out of the way as `<name>.<reason>.<millis>`
pub(crate) async fn move_aside(path: &Path, reason: &str) -> Result<PathBuf> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("document");
    let target = path.with_file_name(format!(
        "{file_name}.{reason}.{}",
        Utc::now().timestamp_millis()
    ));
    tokio::fs::rename(path, &target).await?;
    Ok(target)
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> Result<()> {
    let handle = tokio::fs::File::open(dir).await?;
    handle.sync_all().await?;
    Ok(())
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}
