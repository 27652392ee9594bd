//! # etree-dl
//!
//! Resumable acquisition of live-performance recording metadata from a
//! rate-limited, archive.org-style service.
//!
//! ## Design Philosophy
//!
//! etree-dl is designed to be:
//! - **Crash-safe** - Every document and ledger write is atomic; an interrupted
//!   run resumes from what is already on disk
//! - **Polite** - Requests are grouped, staggered and cooled down after a 429
//! - **Exclusive** - One run per collection at a time, across processes
//! - **Event-driven** - Consumers observe progress through a callback or a
//!   broadcast channel, no polling required
//!
//! A run searches a collection, keeps the best recording of each performance
//! date (see [`quality`]), and fetches the metadata document of every winner
//! that is not cached yet.
//!
//! ## Quick Start
//!
//! ```no_run
//! use etree_dl::{Config, DownloadOptions, Downloader};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.storage.cache_dir = "data/metadata".into();
//!
//!     let downloader = Downloader::new(config).await?;
//!
//!     // Subscribe to events
//!     let mut events = downloader.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("{event}");
//!         }
//!     });
//!
//!     let summary = downloader
//!         .download("GratefulDead", DownloadOptions::default())
//!         .await?;
//!     println!("{:?}: {} downloaded", summary.outcome, summary.downloaded);
//!
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Remote archive client
pub mod archive;
/// Configuration types
pub mod config;
/// Download orchestration (decomposed into focused submodules)
pub mod downloader;
/// Error types
pub mod error;
/// Bounded-concurrency metadata fetching
pub mod fetcher;
/// Cross-process resource locks
pub mod lock;
/// Recording quality ranking
pub mod quality;
/// Retry logic with exponential backoff
pub mod retry;
/// Paginated collection search
pub mod searcher;
/// Best-version selection per performance date
pub mod selector;
/// Progress ledger and metadata cache
pub mod state;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use downloader::Downloader;
pub use error::{Error, LockError, Result, StateError};
pub use lock::{FileLockManager, LockGuard, LockManager};
pub use state::StateStore;
pub use types::{
    CandidateRecording, CollectionProgress, DownloadOptions, DownloadSummary, Event, LockRecord,
    LockToken, ProgressObserver, ProgressStatus, RunMetrics, RunOutcome, ShowMetadata, Track,
};

/// Run one collection download with graceful signal handling.
///
/// If a termination signal arrives before the run finishes, the downloader's
/// `shutdown()` is called and the interrupted run's summary (outcome
/// [`RunOutcome::Cancelled`]) is returned once its progress is saved.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use etree_dl::{Config, DownloadOptions, Downloader, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let downloader = Downloader::new(Config::default()).await?;
///
///     // Run with automatic signal handling
///     let summary =
///         run_with_shutdown(&downloader, "Phish", DownloadOptions::default()).await?;
///     println!("{:?}", summary.outcome);
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(
    downloader: &Downloader,
    collection: &str,
    options: DownloadOptions,
) -> Result<DownloadSummary> {
    let run = downloader.download(collection, options);
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => result,
        _ = wait_for_signal() => {
            let (result, shutdown) = tokio::join!(run, downloader.shutdown());
            shutdown?;
            result
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
