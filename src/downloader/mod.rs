//! Download orchestration split into focused submodules.
//!
//! The `Downloader` struct and its methods are organized by concern:
//! - [`orchestration`] - Full and incremental collection downloads
//! - [`retry_failed`] - Re-attempting recorded failures without a search
//! - [`lifecycle`] - Shutdown coordination and in-flight run tracking

mod lifecycle;
mod orchestration;
mod retry_failed;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::archive::{ArchiveApi, HttpArchiveClient};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fetcher::ConcurrentFetcher;
use crate::lock::{FileLockManager, LockGuard, LockManager};
use crate::searcher::CollectionSearcher;
use crate::state::StateStore;
use crate::types::{CollectionProgress, Event, ProgressObserver, ShowMetadata};

/// Lock operation name held for the whole of a download or retry run
pub const DOWNLOAD_OPERATION: &str = "download";

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Resumable, mutually exclusive collection downloader (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct Downloader {
    /// Configuration (wrapped in Arc for sharing across tasks)
    pub(crate) config: Arc<Config>,
    /// Remote archive client (trait object so tests can substitute a fake)
    pub(crate) api: Arc<dyn ArchiveApi>,
    /// Ledger and metadata cache
    pub(crate) store: Arc<StateStore>,
    /// Per-collection mutual exclusion
    pub(crate) locks: Arc<dyn LockManager>,
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: tokio::sync::broadcast::Sender<Event>,
    /// Cancelled by `shutdown()`; runs stop between groups and sub-batches
    pub(crate) shutdown_token: CancellationToken,
    /// Runs currently holding a collection lock
    pub(crate) active_runs: Arc<AtomicUsize>,
}

impl Downloader {
    /// Create a downloader talking to the configured archive over HTTP
    ///
    /// Validates the configuration and creates the cache and lock
    /// directories. Lock files go through a [`FileLockManager`] in
    /// `storage.lock_dir`.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let api = Arc::new(HttpArchiveClient::new(&config.archive)?);
        Self::with_api(config, api).await
    }

    /// Create a downloader over a caller-supplied archive client
    pub async fn with_api(config: Config, api: Arc<dyn ArchiveApi>) -> Result<Self> {
        let locks = Arc::new(FileLockManager::new(
            config.storage.lock_dir.clone(),
            config.lock.clone(),
        ));
        Self::with_components(config, api, locks).await
    }

    /// Create a downloader with a pluggable lock backend
    pub async fn with_components(
        config: Config,
        api: Arc<dyn ArchiveApi>,
        locks: Arc<dyn LockManager>,
    ) -> Result<Self> {
        config.validate()?;

        for (dir, what) in [
            (&config.storage.cache_dir, "cache"),
            (&config.storage.lock_dir, "lock"),
        ] {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!("Failed to create {what} directory '{}': {e}", dir.display()),
                ))
            })?;
        }

        let store = Arc::new(StateStore::new(&config.storage));
        let (event_tx, _rx) = tokio::sync::broadcast::channel(EVENT_CHANNEL_CAPACITY);

        tracing::info!(
            base_url = %config.archive.base_url,
            cache_dir = %config.storage.cache_dir.display(),
            concurrency = config.fetch.concurrency,
            "Downloader initialized"
        );

        Ok(Self {
            config: Arc::new(config),
            api,
            store,
            locks,
            event_tx,
            shutdown_token: CancellationToken::new(),
            active_runs: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Subscribe to progress events
    ///
    /// Each subscriber receives every event independently. A subscriber that
    /// falls more than 1000 events behind receives `RecvError::Lagged`.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Get the current configuration
    pub fn get_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// Lock backend, for inspection and administrative cleanup
    pub fn lock_manager(&self) -> Arc<dyn LockManager> {
        Arc::clone(&self.locks)
    }

    /// Ledger record of a collection
    pub async fn progress(&self, collection: &str) -> Result<Option<CollectionProgress>> {
        self.store.progress(collection).await
    }

    /// Every ledger record
    pub async fn all_progress(&self) -> Result<Vec<CollectionProgress>> {
        self.store.all_progress().await
    }

    /// Cached document for an identifier, `None` if missing or corrupt
    pub async fn cached_metadata(
        &self,
        collection: &str,
        identifier: &str,
    ) -> Result<Option<ShowMetadata>> {
        self.store.load_metadata(collection, identifier).await
    }

    /// Identifiers with a valid cached document
    pub async fn cached_identifiers(&self, collection: &str) -> Result<BTreeSet<String>> {
        self.store.cached_identifiers(collection).await
    }

    /// Forget a collection's progress so the next run starts over
    ///
    /// Takes the collection lock without waiting, so it fails while a run is
    /// active. Cached documents are kept and count as hits on the next run.
    pub async fn reset_progress(&self, collection: &str) -> Result<bool> {
        let guard =
            LockGuard::acquire(self.locks.clone(), DOWNLOAD_OPERATION, collection, Duration::ZERO)
                .await?;
        let result = self.store.reset_progress(collection).await;
        guard.release().await?;
        result
    }

    /// Send an event to the per-call observer and all subscribers
    pub(crate) fn emit_event(&self, observer: Option<&Arc<dyn ProgressObserver>>, event: Event) {
        if let Some(observer) = observer {
            observer.on_event(&event);
        }
        // send() returns Err if there are no receivers, which is fine - we just drop the event
        self.event_tx.send(event).ok();
    }

    pub(crate) fn searcher(&self) -> CollectionSearcher {
        CollectionSearcher::new(
            self.api.clone(),
            self.config.search.clone(),
            self.config.retry.clone(),
        )
    }

    pub(crate) fn fetcher(&self) -> ConcurrentFetcher {
        ConcurrentFetcher::new(
            self.api.clone(),
            self.store.clone(),
            self.config.fetch.clone(),
            self.config.retry.clone(),
        )
    }

    /// Sleep for `duration`, waking early on shutdown
    pub(crate) async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.shutdown_token.cancelled() => {}
        }
    }
}
