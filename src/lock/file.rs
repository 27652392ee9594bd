//! Filesystem lock backend: one JSON lock file per pair.
//!
//! A lock file is only ever created with `O_EXCL` and removed by its owner,
//! except when its holder is gone (dead local process, unreadable file, stale
//! cleanup). Those removals run under a per-pair `.reclaim` guard file and
//! re-read the lock file first, so a lock created after the stale one was
//! observed is never removed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;

use super::{LockManager, process};
use crate::config::LockConfig;
use crate::error::{LockError, Result};
use crate::state::atomic::move_aside;
use crate::types::{LockRecord, LockToken};

const LOCK_EXTENSION: &str = "lock";
const RECLAIM_EXTENSION: &str = "reclaim";

/// An unreadable lock file younger than this may still be mid-write
const CORRUPT_LOCK_GRACE: Duration = Duration::from_secs(5);

/// A reclaim guard older than this was left by a crashed process
const RECLAIM_GUARD_GRACE: Duration = Duration::from_secs(30);

/// What a lock file currently says
enum Holder {
    Missing,
    Corrupt(String),
    Held(LockRecord),
}

/// Why another holder's lock file may be removed
enum Stale {
    /// The holder with this token is gone
    Token(LockToken),
    /// The file has not parsed for longer than the corrupt grace
    Corrupt,
}

/// Outcome of a reclaim attempt
#[derive(Debug, PartialEq, Eq)]
enum Reclaim {
    /// The stale lock file is gone
    Removed,
    /// The lock file changed since it was observed; nothing was touched
    Changed,
    /// Another process is reclaiming the same pair
    Busy,
}

/// Exclusive right to remove another holder's lock file for one pair
struct ReclaimGuard {
    path: PathBuf,
}

impl ReclaimGuard {
    async fn try_acquire(lock_path: &Path) -> Result<Option<Self>> {
        let path = lock_path.with_extension(format!("{LOCK_EXTENSION}.{RECLAIM_EXTENSION}"));
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(_) => Ok(Some(Self { path })),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if file_age(&path).await.is_some_and(|age| age >= RECLAIM_GUARD_GRACE) {
                    tracing::warn!(path = %path.display(), "Removing abandoned reclaim guard");
                    remove_quietly(&path).await?;
                }
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn release(self) {
        if let Err(e) = remove_quietly(&self.path).await {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove reclaim guard");
        }
    }
}

/// Lock manager backed by `O_EXCL`-created files in a lock directory
///
/// A lock file whose holder ran on this host and is no longer alive is
/// reclaimed by the next `acquire`. Locks still held when the manager is
/// dropped are released.
#[derive(Debug)]
pub struct FileLockManager {
    lock_dir: PathBuf,
    poll_interval: Duration,
    cross_host_stale_hours: u64,
    hostname: String,
    pid: u32,
    /// Tokens issued by this manager and the files they own
    held: tokio::sync::Mutex<HashMap<LockToken, PathBuf>>,
}

impl FileLockManager {
    /// Create a manager storing lock files in `lock_dir`
    pub fn new(lock_dir: impl Into<PathBuf>, config: LockConfig) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            poll_interval: config.poll_interval,
            cross_host_stale_hours: config.cross_host_stale_hours,
            hostname: process::hostname(),
            pid: std::process::id(),
            held: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    fn lock_path(&self, operation: &str, resource: &str) -> PathBuf {
        // '@' is always percent-encoded inside either part, so the name is unambiguous
        self.lock_dir.join(format!(
            "{}@{}.{LOCK_EXTENSION}",
            urlencoding::encode(operation),
            urlencoding::encode(resource)
        ))
    }

    fn holder_is_dead(&self, holder: &LockRecord) -> bool {
        holder.holder_host == self.hostname && !process::is_alive(holder.holder_pid)
    }

    /// Remove the owner's own lock file if it still carries `token`
    ///
    /// Nobody else removes a live owner's file, so the read and the removal
    /// cannot be separated by another holder's create.
    async fn remove_own(&self, path: &Path, token: &LockToken) -> Result<bool> {
        match read_holder(path).await? {
            Holder::Held(record) if record.token == *token => {
                remove_quietly(path).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Remove a lock file whose holder is gone, under the pair's reclaim guard
    async fn reclaim(&self, path: &Path, stale: &Stale) -> Result<Reclaim> {
        let Some(guard) = ReclaimGuard::try_acquire(path).await? else {
            return Ok(Reclaim::Busy);
        };

        let result = remove_if_still_stale(path, stale).await;
        guard.release().await;
        result
    }
}

/// Re-read the lock file and remove it only if it is still the stale one
async fn remove_if_still_stale(path: &Path, stale: &Stale) -> Result<Reclaim> {
    let current = read_holder(path).await?;
    let old_enough = file_age(path)
        .await
        .is_some_and(|age| age >= CORRUPT_LOCK_GRACE);
    match (stale, current) {
        (Stale::Token(token), Holder::Held(record)) if record.token == *token => {
            remove_quietly(path).await?;
            Ok(Reclaim::Removed)
        }
        (Stale::Corrupt, Holder::Corrupt(_)) if old_enough => {
            if let Err(e) = move_aside(path, "corrupt").await {
                tracing::debug!(error = %e, "Corrupt lock file already gone");
            }
            Ok(Reclaim::Removed)
        }
        _ => Ok(Reclaim::Changed),
    }
}

/// Time since the file was last modified; `None` if it is gone or dated in the future
async fn file_age(path: &Path) -> Option<Duration> {
    let modified = tokio::fs::metadata(path).await.ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

async fn read_holder(path: &Path) -> Result<Holder> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Holder::Missing),
        Err(e) => return Err(e.into()),
    };
    Ok(match serde_json::from_slice::<LockRecord>(&bytes) {
        Ok(record) => Holder::Held(record),
        Err(e) => Holder::Corrupt(e.to_string()),
    })
}

async fn remove_quietly(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// Create the lock file exclusively and write the record into it
async fn try_create(path: &Path, record: &LockRecord) -> std::io::Result<()> {
    let bytes = serde_json::to_vec_pretty(record).map_err(std::io::Error::other)?;
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;

    let written = async {
        file.write_all(&bytes).await?;
        file.sync_all().await
    }
    .await;

    if let Err(e) = written {
        let _ = tokio::fs::remove_file(path).await;
        return Err(e);
    }
    Ok(())
}

fn hours_to_seconds(hours: u64) -> i64 {
    i64::try_from(hours.saturating_mul(3600)).unwrap_or(i64::MAX)
}

#[async_trait]
impl LockManager for FileLockManager {
    async fn acquire(&self, operation: &str, resource: &str, timeout: Duration) -> Result<LockToken> {
        tokio::fs::create_dir_all(&self.lock_dir).await?;
        let path = self.lock_path(operation, resource);
        let deadline = Instant::now() + timeout;

        loop {
            let record = LockRecord {
                operation: operation.to_string(),
                resource: resource.to_string(),
                holder_pid: self.pid,
                holder_host: self.hostname.clone(),
                acquired_at: Utc::now(),
                token: LockToken(uuid::Uuid::new_v4().to_string()),
            };

            match try_create(&path, &record).await {
                Ok(()) => {
                    self.held
                        .lock()
                        .await
                        .insert(record.token.clone(), path.clone());
                    tracing::debug!(
                        operation = %operation,
                        resource = %resource,
                        token = %record.token,
                        "Lock acquired"
                    );
                    return Ok(record.token);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            // while the holder is gone or unreadable the wait is not bounded by
            // the deadline: either a reclaim succeeds or the file settles
            let mut settling = false;
            match read_holder(&path).await? {
                Holder::Missing => continue,
                Holder::Corrupt(reason) => {
                    let old = file_age(&path)
                        .await
                        .is_some_and(|age| age >= CORRUPT_LOCK_GRACE);
                    if old {
                        tracing::warn!(
                            path = %path.display(),
                            reason = %reason,
                            "Moving corrupt lock file aside"
                        );
                        if self.reclaim(&path, &Stale::Corrupt).await? != Reclaim::Busy {
                            continue;
                        }
                    }
                    // possibly a holder between creating and writing its file
                    settling = true;
                }
                Holder::Held(holder) => {
                    if self.holder_is_dead(&holder) {
                        tracing::warn!(
                            operation = %operation,
                            resource = %resource,
                            holder_pid = holder.holder_pid,
                            "Reclaiming lock left by a dead process"
                        );
                        if self
                            .reclaim(&path, &Stale::Token(holder.token))
                            .await?
                            != Reclaim::Busy
                        {
                            continue;
                        }
                        settling = true;
                    } else if Instant::now() >= deadline {
                        return Err(LockError::Conflict {
                            operation: holder.operation,
                            resource: holder.resource,
                            holder_pid: holder.holder_pid,
                            holder_host: holder.holder_host,
                            acquired_at: holder.acquired_at.to_rfc3339(),
                        }
                        .into());
                    }
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let wait = if settling || remaining.is_zero() {
                self.poll_interval
            } else {
                self.poll_interval.min(remaining)
            };
            tokio::time::sleep(wait).await;
        }
    }

    async fn release(&self, token: &LockToken) -> Result<()> {
        let path = self
            .held
            .lock()
            .await
            .remove(token)
            .ok_or_else(|| LockError::InvalidToken {
                token: token.to_string(),
            })?;

        if self.remove_own(&path, token).await? {
            tracing::debug!(token = %token, "Lock released");
        } else {
            tracing::warn!(
                token = %token,
                path = %path.display(),
                "Lock was cleared or taken over before release"
            );
        }
        Ok(())
    }

    async fn is_locked(&self, operation: &str, resource: &str) -> Result<bool> {
        Ok(matches!(
            read_holder(&self.lock_path(operation, resource)).await?,
            Holder::Held(_)
        ))
    }

    async fn lock_info(&self, operation: &str, resource: &str) -> Result<Option<LockRecord>> {
        Ok(match read_holder(&self.lock_path(operation, resource)).await? {
            Holder::Held(record) => Some(record),
            Holder::Missing | Holder::Corrupt(_) => None,
        })
    }

    async fn force_release(&self, operation: &str, resource: &str) -> Result<bool> {
        let path = self.lock_path(operation, resource);
        let existed = !matches!(read_holder(&path).await?, Holder::Missing);
        remove_quietly(&path).await?;
        self.held.lock().await.retain(|_, held| *held != path);

        if existed {
            tracing::warn!(operation = %operation, resource = %resource, "Lock force-released");
        }
        Ok(existed)
    }

    async fn cleanup_stale_locks(&self, max_age_hours: u64) -> Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.lock_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let now = Utc::now();
        let min_age = hours_to_seconds(max_age_hours);
        let cross_host_min_age = hours_to_seconds(max_age_hours.max(self.cross_host_stale_hours));
        let mut removed = 0;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOCK_EXTENSION) {
                continue;
            }
            let Holder::Held(holder) = read_holder(&path).await? else {
                continue;
            };

            let age = (now - holder.acquired_at).num_seconds();
            let stale = if holder.holder_host == self.hostname {
                age >= min_age && !process::is_alive(holder.holder_pid)
            } else {
                // no way to probe a remote pid; age is the only evidence
                age >= cross_host_min_age
            };

            let reclaimed = stale
                && self.reclaim(&path, &Stale::Token(holder.token.clone())).await?
                    == Reclaim::Removed;
            if reclaimed {
                tracing::info!(
                    operation = %holder.operation,
                    resource = %holder.resource,
                    holder_pid = holder.holder_pid,
                    holder_host = %holder.holder_host,
                    "Removed stale lock"
                );
                removed += 1;
            }
        }

        Ok(removed)
    }
}

impl Drop for FileLockManager {
    fn drop(&mut self) {
        // no runtime is guaranteed here, so plain blocking I/O
        for (token, path) in self.held.get_mut().drain() {
            let owned = std::fs::read(&path)
                .ok()
                .and_then(|bytes| serde_json::from_slice::<LockRecord>(&bytes).ok())
                .is_some_and(|record| record.token == token);
            if owned {
                if let Err(e) = std::fs::remove_file(&path) {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to release lock on drop");
                } else {
                    tracing::debug!(token = %token, "Lock released on drop");
                }
            }
        }
    }
}
