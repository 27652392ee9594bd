//! Shutdown coordination.

use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::error::{Error, Result};

use super::Downloader;

/// How long `shutdown()` waits for in-flight runs to persist and unlock
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Marks a run as active for the lifetime of the value
pub(crate) struct ActiveRun {
    downloader: Downloader,
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.downloader.active_runs.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Downloader {
    /// Register a new run, refusing once shutdown has begun
    pub(crate) fn begin_run(&self) -> Result<ActiveRun> {
        if self.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }
        self.active_runs.fetch_add(1, Ordering::SeqCst);
        Ok(ActiveRun {
            downloader: self.clone(),
        })
    }

    /// Whether `shutdown()` has been called
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Gracefully shut down the downloader
    ///
    /// 1. Stops accepting new runs
    /// 2. Signals active runs to stop after their current fetch group
    /// 3. Waits (up to 30 seconds) for them to persist progress and release
    ///    their locks
    ///
    /// Interrupted runs leave their collection `in_progress`; the next
    /// `download()` resumes from the cache.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown");
        self.shutdown_token.cancel();

        let wait = async {
            while self.active_runs.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, wait).await {
            Ok(()) => tracing::info!("All active runs stopped"),
            Err(_) => tracing::warn!(
                active = self.active_runs.load(Ordering::SeqCst),
                "Timeout waiting for active runs, proceeding with shutdown"
            ),
        }

        Ok(())
    }
}
