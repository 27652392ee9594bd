//! Core types for etree-dl

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Current version of [`CollectionProgress`] records written by this crate
pub const PROGRESS_SCHEMA_VERSION: u32 = 3;

/// Date field as the search endpoint returns it: a scalar or a (usually
/// single-element) array
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawDate {
    /// `"date": "1977-05-08T00:00:00Z"`
    One(String),
    /// `"date": ["1977-05-08T00:00:00Z"]`
    Many(Vec<String>),
}

impl RawDate {
    /// First textual value, if any
    pub fn first(&self) -> Option<&str> {
        match self {
            RawDate::One(s) => Some(s.as_str()),
            RawDate::Many(values) => values.first().map(String::as_str),
        }
    }
}

/// One indexed performance returned by search, prior to best-version selection
#[derive(Clone, Debug, PartialEq)]
pub struct CandidateRecording {
    /// Remote archive identifier
    pub identifier: String,
    /// Raw date field
    pub date: Option<RawDate>,
    /// Identifier mentions "sbd" (soundboard source)
    pub soundboard: bool,
    /// Average review rating (0.0 when unrated)
    pub avg_rating: f64,
    /// Number of reviews
    pub num_reviews: u64,
    /// Raw download count
    pub downloads: u64,
}

impl CandidateRecording {
    /// Build a candidate, deriving the soundboard flag from the identifier
    pub fn new(
        identifier: impl Into<String>,
        date: Option<RawDate>,
        avg_rating: f64,
        num_reviews: u64,
        downloads: u64,
    ) -> Self {
        let identifier = identifier.into();
        let soundboard = identifier.to_ascii_lowercase().contains("sbd");
        Self {
            identifier,
            date,
            soundboard,
            avg_rating,
            num_reviews,
            downloads,
        }
    }
}

/// One audio file of a recording
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Track {
    /// File name within the item
    pub name: String,
    /// Display title
    #[serde(default)]
    pub title: Option<String>,
    /// Track number as published (may be "01", "1", "d1t01")
    #[serde(default)]
    pub track: Option<String>,
    /// Duration in seconds
    #[serde(default)]
    pub length: Option<f64>,
    /// Content hash; the stable key downstream consumers use
    #[serde(default)]
    pub md5: Option<String>,
    /// Archive format label (e.g. "Flac", "VBR MP3")
    pub format: String,
    /// "original" or "derivative"
    #[serde(default)]
    pub source: Option<String>,
    /// File size in bytes
    #[serde(default)]
    pub size: Option<u64>,
}

/// Cached metadata for one recording
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ShowMetadata {
    /// Remote archive identifier
    pub identifier: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub year: Option<String>,
    #[serde(default)]
    pub venue: Option<String>,
    #[serde(default)]
    pub creator: Option<String>,
    #[serde(default)]
    pub taper: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub transferer: Option<String>,
    #[serde(default)]
    pub lineage: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    /// First collection tag reported by the archive
    #[serde(default)]
    pub collection: Option<String>,
    /// Every collection the item belongs to, including the one it was fetched for
    #[serde(default)]
    pub collections: Vec<String>,
    /// Storage directory on the mirrors
    #[serde(default)]
    pub dir: Option<String>,
    /// Primary mirror hostname
    #[serde(default)]
    pub d1: Option<String>,
    /// Secondary mirror hostname
    #[serde(default)]
    pub d2: Option<String>,
    /// When the item was made public
    #[serde(default)]
    pub publicdate: Option<String>,
    #[serde(default)]
    pub avg_rating: Option<f64>,
    #[serde(default)]
    pub num_reviews: u64,
    /// Audio files in published order
    #[serde(default)]
    pub tracks: Vec<Track>,
    /// When this document was fetched
    #[serde(default)]
    pub fetched_at: Option<DateTime<Utc>>,
}

impl ShowMetadata {
    /// Structural checks applied after every read
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.identifier.trim().is_empty() {
            return Err("identifier is empty".to_string());
        }
        if self.tracks.iter().any(|t| t.name.is_empty()) {
            return Err("track with empty file name".to_string());
        }
        Ok(())
    }

    /// Whether the document is attributed to `collection`
    pub fn belongs_to(&self, collection: &str) -> bool {
        self.collection.as_deref() == Some(collection)
            || self.collections.iter().any(|c| c == collection)
    }

    /// Record `collection` as one the item belongs to
    pub fn tag_collection(&mut self, collection: &str) {
        if !self.collections.iter().any(|c| c == collection) {
            self.collections.push(collection.to_string());
        }
    }
}

/// Lifecycle of a collection's acquisition
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    /// No run has started
    #[default]
    NotStarted,
    /// A run started and has not finished (or was interrupted)
    InProgress,
    /// Last run finished
    Completed,
    /// Last run finished with nothing downloaded and at least one failure
    Failed,
    /// Rebuilt from the cache tree after the ledger was found corrupt
    Recovered,
}

impl std::fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProgressStatus::NotStarted => "not started",
            ProgressStatus::InProgress => "in progress",
            ProgressStatus::Completed => "completed",
            ProgressStatus::Failed => "failed",
            ProgressStatus::Recovered => "recovered",
        };
        f.write_str(s)
    }
}

/// Per-collection entry of the progress ledger
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CollectionProgress {
    pub collection: String,
    #[serde(default)]
    pub status: ProgressStatus,
    /// Candidates returned by the last search
    #[serde(default)]
    pub total_candidates: u64,
    /// Distinct dates (winners) after selection
    #[serde(default)]
    pub unique_shows: u64,
    /// Winners with a cached document
    #[serde(default)]
    pub downloaded: u64,
    /// Length of `failed_identifiers`
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub failed_identifiers: Vec<String>,
    /// Most recent identifier persisted by a run
    #[serde(default)]
    pub last_processed: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Watermark of the last full sync
    #[serde(default)]
    pub last_full_sync: Option<DateTime<Utc>>,
    /// Watermark of the last incremental sync
    #[serde(default)]
    pub last_incremental_sync: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// Records written before versioning existed are treated as version 1
    #[serde(default = "legacy_schema_version")]
    pub schema_version: u32,
}

fn legacy_schema_version() -> u32 {
    1
}

impl CollectionProgress {
    /// Fresh record for a collection that has never run
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            status: ProgressStatus::NotStarted,
            total_candidates: 0,
            unique_shows: 0,
            downloaded: 0,
            failed: 0,
            failed_identifiers: Vec::new(),
            last_processed: None,
            started_at: None,
            completed_at: None,
            last_full_sync: None,
            last_incremental_sync: None,
            updated_at: None,
            schema_version: PROGRESS_SCHEMA_VERSION,
        }
    }

    /// Newest sync watermark, used as the lower bound of incremental searches
    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        match (self.last_full_sync, self.last_incremental_sync) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// Add an identifier to the failed list once
    pub fn record_failure(&mut self, identifier: &str) {
        if !self.failed_identifiers.iter().any(|id| id == identifier) {
            self.failed_identifiers.push(identifier.to_string());
        }
        self.failed = self.failed_identifiers.len() as u64;
    }

    /// Remove an identifier from the failed list; returns whether it was present
    pub fn clear_failure(&mut self, identifier: &str) -> bool {
        let before = self.failed_identifiers.len();
        self.failed_identifiers.retain(|id| id != identifier);
        self.failed = self.failed_identifiers.len() as u64;
        before != self.failed_identifiers.len()
    }
}

/// Opaque handle returned by a successful lock acquisition
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockToken(pub String);

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persisted description of an active lock
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub operation: String,
    pub resource: String,
    pub holder_pid: u32,
    pub holder_host: String,
    pub acquired_at: DateTime<Utc>,
    pub token: LockToken,
}

/// How a download or retry run ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every scheduled identifier was downloaded (or nothing needed fetching)
    Completed,
    /// Some identifiers failed; the rest succeeded
    CompletedWithFailures,
    /// Nothing succeeded and at least one identifier failed
    Failed,
    /// Prior run had completed; nothing was done
    AlreadyComplete,
    /// Shutdown was requested between items; the run can be resumed
    Cancelled,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunOutcome::Completed => "completed",
            RunOutcome::CompletedWithFailures => "completed with failures",
            RunOutcome::Failed => "failed",
            RunOutcome::AlreadyComplete => "already complete",
            RunOutcome::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Request counters for one run, returned instead of kept in process-wide state
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetrics {
    /// Search pages requested
    pub search_pages: u64,
    /// Metadata requests dispatched (including retries)
    pub metadata_requests: u64,
    /// Identifiers served from the cache
    pub cache_hits: u64,
    /// 429 responses seen by the fetcher
    pub rate_limited: u64,
    /// Extended cooldowns slept
    pub cooldowns: u64,
}

impl RunMetrics {
    /// Accumulate another set of counters
    pub fn absorb(&mut self, other: &RunMetrics) {
        self.search_pages += other.search_pages;
        self.metadata_requests += other.metadata_requests;
        self.cache_hits += other.cache_hits;
        self.rate_limited += other.rate_limited;
        self.cooldowns += other.cooldowns;
    }
}

/// Result of a `download()` or `retry_failed()` call
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadSummary {
    pub collection: String,
    pub outcome: RunOutcome,
    /// Candidates returned by search in this run
    pub candidates_seen: u64,
    /// Winners after best-version selection
    pub unique_shows: u64,
    /// Identifiers fetched and cached in this run
    pub downloaded: u64,
    /// Winners that were already cached when the run started
    pub already_cached: u64,
    /// Identifiers that failed in this run
    pub failed: u64,
    /// Failed identifiers recorded in this run
    pub failed_identifiers: Vec<String>,
    /// Ledger record as persisted at the end of the run
    pub progress: CollectionProgress,
    pub metrics: RunMetrics,
}

impl DownloadSummary {
    /// No identifier failed in this run
    pub fn is_success(&self) -> bool {
        matches!(
            self.outcome,
            RunOutcome::Completed | RunOutcome::AlreadyComplete
        )
    }
}

/// Notable steps of a run
///
/// The `Display` implementation renders the one-line, human-readable status
/// string handed to progress callbacks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// Prior run completed; returning its record
    AlreadyComplete {
        collection: String,
    },
    /// Search finished
    SearchComplete {
        collection: String,
        candidates: u64,
        pages: u64,
    },
    /// Best-version selection finished
    SelectionComplete {
        collection: String,
        unique_shows: u64,
        undated: u64,
    },
    /// To-fetch set computed
    FetchPlanned {
        collection: String,
        to_fetch: u64,
        already_cached: u64,
    },
    /// One identifier fetched and cached
    ItemDownloaded {
        collection: String,
        identifier: String,
        /// Position within this run's to-fetch set (1-based)
        position: u64,
        total: u64,
    },
    /// One identifier failed
    ItemFailed {
        collection: String,
        identifier: String,
        error: String,
        rate_limited: bool,
    },
    /// Sleeping after a rate-limited batch
    Cooldown {
        collection: String,
        millis: u64,
    },
    /// Shutdown requested; remaining identifiers left for the next run
    Cancelled {
        collection: String,
        remaining: u64,
    },
    /// Retry of previously failed identifiers started
    RetryStarted {
        collection: String,
        count: u64,
    },
    /// Run finished
    Finished {
        collection: String,
        outcome: RunOutcome,
        downloaded: u64,
        failed: u64,
    },
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::AlreadyComplete { collection } => {
                write!(f, "{collection}: already complete, nothing to do")
            }
            Event::SearchComplete {
                collection,
                candidates,
                pages,
            } => write!(
                f,
                "{collection}: found {candidates} recordings in {pages} page(s)"
            ),
            Event::SelectionComplete {
                collection,
                unique_shows,
                undated,
            } => {
                write!(f, "{collection}: selected {unique_shows} unique shows")?;
                if *undated > 0 {
                    write!(f, " ({undated} undated recordings skipped)")?;
                }
                Ok(())
            }
            Event::FetchPlanned {
                collection,
                to_fetch,
                already_cached,
            } => write!(
                f,
                "{collection}: {to_fetch} to download, {already_cached} already cached"
            ),
            Event::ItemDownloaded {
                collection,
                identifier,
                position,
                total,
            } => write!(f, "{collection}: [{position}/{total}] downloaded {identifier}"),
            Event::ItemFailed {
                collection,
                identifier,
                error,
                rate_limited,
            } => {
                if *rate_limited {
                    write!(f, "{collection}: rate limited on {identifier}")
                } else {
                    write!(f, "{collection}: failed {identifier}: {error}")
                }
            }
            Event::Cooldown { collection, millis } => write!(
                f,
                "{collection}: rate limited, cooling down for {:.1}s",
                *millis as f64 / 1000.0
            ),
            Event::Cancelled {
                collection,
                remaining,
            } => write!(
                f,
                "{collection}: shutdown requested, {remaining} left for next run"
            ),
            Event::RetryStarted { collection, count } => {
                write!(f, "{collection}: retrying {count} failed recordings")
            }
            Event::Finished {
                collection,
                outcome,
                downloaded,
                failed,
            } => write!(
                f,
                "{collection}: {outcome} ({downloaded} downloaded, {failed} failed)"
            ),
        }
    }
}

/// Receives progress events synchronously from the orchestrator
///
/// Implementations must return quickly; the orchestrator's pacing does not
/// wait on them. Any `Fn(&Event)` closure is an observer.
pub trait ProgressObserver: Send + Sync {
    /// Called once per notable event
    fn on_event(&self, event: &Event);
}

impl<F> ProgressObserver for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_event(&self, event: &Event) {
        self(event)
    }
}

/// Options for a single `download()` call
#[derive(Clone, Default)]
pub struct DownloadOptions {
    /// Fetch at most this many identifiers in this run
    pub limit: Option<usize>,
    /// Re-fetch winners even when cached, replacing the documents
    pub force: bool,
    /// Only search recordings published since the last sync watermark
    pub incremental: bool,
    /// Explicit lower publish-date bound; overrides the watermark
    pub since: Option<chrono::NaiveDate>,
    /// Per-call progress observer
    pub observer: Option<Arc<dyn ProgressObserver>>,
}

impl std::fmt::Debug for DownloadOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadOptions")
            .field("limit", &self.limit)
            .field("force", &self.force)
            .field("incremental", &self.incremental)
            .field("since", &self.since)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}
