//! Shared test helpers for creating Downloader instances in tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::{TempDir, tempdir};
use tokio::sync::Notify;

use crate::archive::{ArchiveApi, SearchPage, SearchQuery};
use crate::config::{Config, RetryConfig};
use crate::downloader::Downloader;
use crate::error::{Error, Result};
use crate::types::{CandidateRecording, RawDate, ShowMetadata};

/// In-process archive with scripted search results and per-identifier failures
#[derive(Default)]
pub(crate) struct FakeArchive {
    candidates: Mutex<Vec<CandidateRecording>>,
    rate_limited: Mutex<HashSet<String>>,
    unavailable: Mutex<HashSet<String>>,
    fetches: Mutex<HashMap<String, usize>>,
    queries: Mutex<Vec<SearchQuery>>,
    /// When set, every metadata fetch waits for `release_gate`
    gated: AtomicBool,
    /// Identifiers whose fetch waits for `release_gate`
    stalled: Mutex<HashSet<String>>,
    gate: Notify,
    /// Signalled when a gated fetch starts waiting
    pub(crate) gate_reached: Notify,
}

impl FakeArchive {
    pub(crate) fn new(candidates: Vec<CandidateRecording>) -> Self {
        Self {
            candidates: Mutex::new(candidates),
            ..Default::default()
        }
    }

    pub(crate) fn set_candidates(&self, candidates: Vec<CandidateRecording>) {
        *self.candidates.lock().unwrap() = candidates;
    }

    pub(crate) fn rate_limit(&self, identifier: &str) {
        self.rate_limited
            .lock()
            .unwrap()
            .insert(identifier.to_string());
    }

    pub(crate) fn fail(&self, identifier: &str) {
        self.unavailable
            .lock()
            .unwrap()
            .insert(identifier.to_string());
    }

    /// Let every identifier succeed from now on
    pub(crate) fn heal(&self) {
        self.rate_limited.lock().unwrap().clear();
        self.unavailable.lock().unwrap().clear();
    }

    pub(crate) fn hold_fetches(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    /// Hold only the fetch of `identifier` until `release_gate`
    pub(crate) fn stall(&self, identifier: &str) {
        self.stalled.lock().unwrap().insert(identifier.to_string());
    }

    pub(crate) fn release_gate(&self) {
        self.gated.store(false, Ordering::SeqCst);
        self.stalled.lock().unwrap().clear();
        self.gate.notify_waiters();
    }

    pub(crate) fn fetches_of(&self, identifier: &str) -> usize {
        self.fetches
            .lock()
            .unwrap()
            .get(identifier)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn total_fetches(&self) -> usize {
        self.fetches.lock().unwrap().values().sum()
    }

    pub(crate) fn queries(&self) -> Vec<SearchQuery> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArchiveApi for FakeArchive {
    async fn search_page(&self, query: &SearchQuery) -> Result<SearchPage> {
        self.queries.lock().unwrap().push(query.clone());
        let all = self.candidates.lock().unwrap().clone();
        let start = (query.page as usize - 1) * query.rows;
        let candidates = all.iter().skip(start).take(query.rows).cloned().collect();
        Ok(SearchPage {
            total: all.len() as u64,
            candidates,
        })
    }

    async fn fetch_metadata(&self, identifier: &str) -> Result<ShowMetadata> {
        *self
            .fetches
            .lock()
            .unwrap()
            .entry(identifier.to_string())
            .or_default() += 1;

        let released = self.gate.notified();
        let held = self.gated.load(Ordering::SeqCst)
            || self.stalled.lock().unwrap().contains(identifier);
        if held {
            self.gate_reached.notify_one();
            released.await;
        }

        if self.rate_limited.lock().unwrap().contains(identifier) {
            return Err(Error::RateLimited {
                url: format!("/metadata/{identifier}"),
            });
        }
        if self.unavailable.lock().unwrap().contains(identifier) {
            return Err(Error::Http {
                status: 503,
                url: format!("/metadata/{identifier}"),
            });
        }
        Ok(ShowMetadata {
            identifier: identifier.to_string(),
            title: Some(format!("Show {identifier}")),
            // the archive lists the parent collection first
            collection: Some("etree".to_string()),
            ..Default::default()
        })
    }
}

/// Candidate dated `date` with the given soundboard marker and rating
pub(crate) fn candidate(identifier: &str, date: &str, rating: f64) -> CandidateRecording {
    CandidateRecording::new(
        identifier,
        Some(RawDate::One(format!("{date}T00:00:00Z"))),
        rating,
        10,
        100,
    )
}

/// Fast configuration rooted in `dir`
pub(crate) fn test_config(dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.storage.cache_dir = dir.join("metadata");
    config.storage.ledger_path = dir.join("progress.json");
    config.storage.lock_dir = dir.join("locks");
    config.search.page_size = 2;
    config.search.page_delay = Duration::ZERO;
    config.fetch.concurrency = 2;
    config.fetch.stagger_delay = Duration::from_millis(1);
    config.fetch.group_pause = Duration::from_millis(1);
    config.fetch.rate_limit_cooldown = Duration::from_millis(5);
    config.fetch.sub_batch_size = 4;
    config.lock.acquire_timeout = Duration::ZERO;
    config.lock.poll_interval = Duration::from_millis(5);
    config.retry = RetryConfig {
        max_attempts: 2,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
        backoff_multiplier: 2.0,
        jitter: false,
    };
    config
}

/// Helper to create a test Downloader over a fake archive.
/// Returns the downloader, the fake and the tempdir (which must be kept alive).
pub(crate) async fn create_test_downloader(
    candidates: Vec<CandidateRecording>,
) -> (Downloader, Arc<FakeArchive>, TempDir) {
    let temp_dir = tempdir().unwrap();
    let api = Arc::new(FakeArchive::new(candidates));
    let downloader = Downloader::with_api(test_config(temp_dir.path()), api.clone())
        .await
        .unwrap();
    (downloader, api, temp_dir)
}

/// Five dated shows, two of which have a competing lower-ranked version
pub(crate) fn sample_collection() -> Vec<CandidateRecording> {
    vec![
        candidate("gd1977-05-08.sbd.hicks", "1977-05-08", 4.8),
        candidate("gd1977-05-08.aud.miller", "1977-05-08", 4.9),
        candidate("gd1977-05-09.sbd.miller", "1977-05-09", 4.5),
        candidate("gd1977-05-11.sbd.hicks", "1977-05-11", 4.2),
        candidate("gd1977-05-12.aud.vernon", "1977-05-12", 3.9),
        candidate("gd1977-05-12.aud.other", "1977-05-12", 3.1),
        candidate("gd1977-05-13.sbd.clugston", "1977-05-13", 4.0),
    ]
}

/// Winners of [`sample_collection`] in date order
pub(crate) fn sample_winners() -> Vec<&'static str> {
    vec![
        "gd1977-05-08.sbd.hicks",
        "gd1977-05-09.sbd.miller",
        "gd1977-05-11.sbd.hicks",
        "gd1977-05-12.aud.vernon",
        "gd1977-05-13.sbd.clugston",
    ]
}
