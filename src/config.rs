//! Configuration types for etree-dl

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Remote archive endpoint configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Base URL of the archive (default: "https://archive.org")
    ///
    /// Search requests go to `{base_url}/advancedsearch.php`, metadata requests
    /// to `{base_url}/metadata/{identifier}`.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// User-Agent header sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Per-request timeout (default: 30 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            user_agent: default_user_agent(),
            request_timeout: default_request_timeout(),
        }
    }
}

/// Paginated collection search configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Rows requested per page (default: 1000)
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Delay between successive page requests (default: 500 ms)
    #[serde(default = "default_page_delay", with = "duration_ms_serde")]
    pub page_delay: Duration,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            page_delay: default_page_delay(),
        }
    }
}

/// Metadata fetch pacing
///
/// The archive enforces a strict request rate. Requests are dispatched in
/// groups of at most `concurrency`, staggered by `stagger_delay` inside a group,
/// and separated by `group_pause`. A group that saw a 429 is followed by
/// `rate_limit_cooldown` instead of the normal pause.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Maximum requests in flight per group (default: 5)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Delay between successive dispatches within a group (default: 200 ms)
    #[serde(default = "default_stagger_delay", with = "duration_ms_serde")]
    pub stagger_delay: Duration,

    /// Pause between groups (default: 1000 ms)
    #[serde(default = "default_group_pause", with = "duration_ms_serde")]
    pub group_pause: Duration,

    /// Cooldown after a group that was rate limited (default: 10 seconds)
    #[serde(default = "default_rate_limit_cooldown", with = "duration_ms_serde")]
    pub rate_limit_cooldown: Duration,

    /// Identifiers handed to the fetcher per orchestrator step (default: 50)
    #[serde(default = "default_sub_batch_size")]
    pub sub_batch_size: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            stagger_delay: default_stagger_delay(),
            group_pause: default_group_pause(),
            rate_limit_cooldown: default_rate_limit_cooldown(),
            sub_batch_size: default_sub_batch_size(),
        }
    }
}

/// On-disk layout for cached documents, the progress ledger and lock files
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of the metadata cache (default: "./cache/metadata")
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Aggregate progress ledger (default: "./cache/progress.json")
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,

    /// Directory holding lock records (default: "./cache/locks")
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,

    /// Store documents under `cache_dir/<collection>/` (default: true)
    #[serde(default = "default_true")]
    pub partition_by_collection: bool,

    /// Collections to rebuild when the ledger must be recovered from the cache tree
    #[serde(default)]
    pub known_collections: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            ledger_path: default_ledger_path(),
            lock_dir: default_lock_dir(),
            partition_by_collection: true,
            known_collections: Vec::new(),
        }
    }
}

/// Resource lock behaviour
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockConfig {
    /// How long `download()` waits for a busy collection (default: 0 = fail fast)
    #[serde(default, with = "duration_serde")]
    pub acquire_timeout: Duration,

    /// Poll interval while waiting for a busy lock (default: 100 ms)
    #[serde(default = "default_poll_interval", with = "duration_ms_serde")]
    pub poll_interval: Duration,

    /// Minimum age before a lock held on another host is considered stale (default: 24)
    #[serde(default = "default_cross_host_stale_hours")]
    pub cross_host_stale_hours: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::ZERO,
            poll_interval: default_poll_interval(),
            cross_host_stale_hours: default_cross_host_stale_hours(),
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 2000 ms)
    #[serde(default = "default_initial_delay", with = "duration_ms_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60000 ms)
    #[serde(default = "default_max_delay", with = "duration_ms_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Main configuration for [`Downloader`](crate::Downloader)
///
/// Every section has defaults, so `Config::default()` talks to archive.org and
/// keeps its state under `./cache`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Remote archive endpoints
    #[serde(default)]
    pub archive: ArchiveConfig,

    /// Collection search paging
    #[serde(default)]
    pub search: SearchConfig,

    /// Metadata fetch pacing
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Cache, ledger and lock locations
    #[serde(default)]
    pub storage: StorageConfig,

    /// Lock acquisition behaviour
    #[serde(default)]
    pub lock: LockConfig,

    /// Retry policy shared by search and metadata requests
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Config {
    /// Parse a configuration from JSON, filling unset fields with defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json).map_err(|e| Error::Config {
            message: format!("invalid configuration: {e}"),
            key: None,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would stall or break the pipeline
    pub fn validate(&self) -> Result<()> {
        if self.archive.base_url.trim().is_empty() {
            return Err(config_error("base_url must not be empty", "archive.base_url"));
        }
        if self.search.page_size == 0 {
            return Err(config_error(
                "page_size must be at least 1",
                "search.page_size",
            ));
        }
        if self.fetch.concurrency == 0 {
            return Err(config_error(
                "concurrency must be at least 1",
                "fetch.concurrency",
            ));
        }
        if self.fetch.sub_batch_size == 0 {
            return Err(config_error(
                "sub_batch_size must be at least 1",
                "fetch.sub_batch_size",
            ));
        }
        if self.fetch.rate_limit_cooldown < self.fetch.group_pause {
            return Err(config_error(
                "rate_limit_cooldown must not be shorter than group_pause",
                "fetch.rate_limit_cooldown",
            ));
        }
        if self.lock.poll_interval.is_zero() {
            return Err(config_error(
                "poll_interval must be non-zero",
                "lock.poll_interval",
            ));
        }
        Ok(())
    }
}

fn config_error(message: &str, key: &str) -> Error {
    Error::Config {
        message: message.to_string(),
        key: Some(key.to_string()),
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_base_url() -> String {
    "https://archive.org".to_string()
}

fn default_user_agent() -> String {
    format!("etree-dl/{}", env!("CARGO_PKG_VERSION"))
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_page_size() -> usize {
    1000
}

fn default_page_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_concurrency() -> usize {
    5
}

fn default_stagger_delay() -> Duration {
    Duration::from_millis(200)
}

fn default_group_pause() -> Duration {
    Duration::from_millis(1000)
}

fn default_rate_limit_cooldown() -> Duration {
    Duration::from_secs(10)
}

fn default_sub_batch_size() -> usize {
    50
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./cache/metadata")
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("./cache/progress.json")
}

fn default_lock_dir() -> PathBuf {
    PathBuf::from("./cache/locks")
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_cross_host_stale_hours() -> u64 {
    24
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Duration serialization helper (milliseconds), for pacing values below a second
mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
