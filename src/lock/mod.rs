//! Advisory exclusive locks per (operation, resource) pair
//!
//! The orchestrator holds `("download", <collection>)` for the whole of a run so
//! two processes never mutate the same collection's ledger record or cache
//! partition at once. Pairs are independent: different collections, or
//! different operations on the same collection, never contend.

mod file;
mod process;

pub use file::FileLockManager;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{LockRecord, LockToken};

/// Trait for lock backends
///
/// Callers only see opaque [`LockToken`]s. The filesystem backend is
/// [`FileLockManager`]; other backends (a database row, a coordination
/// service) can be plugged into the downloader through this trait.
///
/// # Examples
///
/// ```no_run
/// use etree_dl::lock::{FileLockManager, LockManager};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let locks = FileLockManager::new("./cache/locks", Default::default());
/// let token = locks.acquire("download", "GratefulDead", Duration::ZERO).await?;
/// // ... mutate the collection ...
/// locks.release(&token).await?;
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Acquire the lock for a pair
    ///
    /// With a zero `timeout` a held lock fails immediately with
    /// [`LockError::Conflict`](crate::LockError::Conflict); otherwise the
    /// backend polls until the lock frees up or the timeout elapses.
    async fn acquire(&self, operation: &str, resource: &str, timeout: Duration) -> Result<LockToken>;

    /// Release a lock acquired through this manager
    ///
    /// Unknown tokens fail with [`LockError::InvalidToken`](crate::LockError::InvalidToken).
    async fn release(&self, token: &LockToken) -> Result<()>;

    /// Whether any holder currently has the pair locked
    async fn is_locked(&self, operation: &str, resource: &str) -> Result<bool>;

    /// Current holder of the pair, if any
    async fn lock_info(&self, operation: &str, resource: &str) -> Result<Option<LockRecord>>;

    /// Unconditionally clear the pair, whoever holds it
    ///
    /// Dangerous: the holder keeps running without its lock. Returns whether
    /// a lock was removed.
    async fn force_release(&self, operation: &str, resource: &str) -> Result<bool>;

    /// Remove locks older than `max_age_hours` whose holder is provably gone
    ///
    /// Returns the number of locks removed.
    async fn cleanup_stale_locks(&self, max_age_hours: u64) -> Result<usize>;
}

/// Holds a lock for the duration of a scope
///
/// Call [`LockGuard::release`] on the normal path to observe release errors.
/// A guard dropped without release (early return, panic) releases the lock on
/// a background task.
pub struct LockGuard {
    manager: Arc<dyn LockManager>,
    token: Option<LockToken>,
}

impl LockGuard {
    /// Acquire `(operation, resource)` and wrap the token in a guard
    pub async fn acquire(
        manager: Arc<dyn LockManager>,
        operation: &str,
        resource: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let token = manager.acquire(operation, resource, timeout).await?;
        Ok(Self {
            manager,
            token: Some(token),
        })
    }

    /// Token of the held lock
    pub fn token(&self) -> Option<&LockToken> {
        self.token.as_ref()
    }

    /// Release the lock now
    pub async fn release(mut self) -> Result<()> {
        match self.token.take() {
            Some(token) => self.manager.release(&token).await,
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let manager = self.manager.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = manager.release(&token).await {
                        tracing::warn!(token = %token, error = %e, "Failed to release dropped lock guard");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(token = %token, "Lock guard dropped outside a runtime; left to the manager");
            }
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockConfig;
    use tempfile::TempDir;

    fn manager(temp: &TempDir) -> Arc<dyn LockManager> {
        Arc::new(FileLockManager::new(temp.path(), LockConfig::default()))
    }

    #[tokio::test]
    async fn guard_release_frees_the_pair() {
        let temp = TempDir::new().unwrap();
        let locks = manager(&temp);

        let guard = LockGuard::acquire(locks.clone(), "download", "Phish", Duration::ZERO)
            .await
            .unwrap();
        assert!(guard.token().is_some());
        assert!(locks.is_locked("download", "Phish").await.unwrap());

        guard.release().await.unwrap();
        assert!(!locks.is_locked("download", "Phish").await.unwrap());
    }

    #[tokio::test]
    async fn dropped_guard_releases_in_background() {
        let temp = TempDir::new().unwrap();
        let locks = manager(&temp);

        {
            let _guard = LockGuard::acquire(locks.clone(), "download", "Phish", Duration::ZERO)
                .await
                .unwrap();
        }

        let mut freed = false;
        for _ in 0..50 {
            if !locks.is_locked("download", "Phish").await.unwrap() {
                freed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(freed, "lock should be released after the guard is dropped");
    }
}
