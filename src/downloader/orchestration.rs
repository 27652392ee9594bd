//! Full and incremental collection downloads.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::fetcher::{FetchOutcome, FetchProgress, ItemResult};
use crate::lock::LockGuard;
use crate::selector::select_best_versions;
use crate::state::validate_name;
use crate::types::{
    CollectionProgress, DownloadOptions, DownloadSummary, Event, ProgressObserver,
    ProgressStatus, RunMetrics, RunOutcome,
};

use super::{DOWNLOAD_OPERATION, Downloader};

/// Settled items buffered between the fetcher and the ledger writer
const PROGRESS_BUFFER: usize = 64;

/// Counters accumulated while driving the fetcher
#[derive(Default)]
pub(crate) struct RunTally {
    pub(crate) downloaded: u64,
    pub(crate) failed_identifiers: Vec<String>,
    pub(crate) processed: u64,
    pub(crate) cancelled: bool,
}

impl RunTally {
    /// Outcome of a run that was not cancelled
    pub(crate) fn outcome(&self) -> RunOutcome {
        if self.failed_identifiers.is_empty() {
            RunOutcome::Completed
        } else if self.downloaded == 0 {
            RunOutcome::Failed
        } else {
            RunOutcome::CompletedWithFailures
        }
    }
}

impl Downloader {
    /// Download the best recording of every show in a collection
    ///
    /// Holds the `("download", collection)` lock for the whole run; with the
    /// default `lock.acquire_timeout` of zero a concurrent run fails at once
    /// with a lock conflict. A collection whose previous run completed is not
    /// searched again unless `force` or incremental mode is requested.
    ///
    /// Per-identifier failures never abort the run: they are recorded in the
    /// collection's failed list and reported in the summary. Lock and search
    /// failures abort before anything is fetched.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use etree_dl::{Config, DownloadOptions, Downloader};
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let downloader = Downloader::new(Config::default()).await?;
    /// let summary = downloader
    ///     .download("GratefulDead", DownloadOptions::default())
    ///     .await?;
    /// println!("{} new, {} failed", summary.downloaded, summary.failed);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn download(
        &self,
        collection: &str,
        options: DownloadOptions,
    ) -> Result<DownloadSummary> {
        let _active = self.begin_run()?;
        validate_name(collection)?;

        let guard = LockGuard::acquire(
            self.locks.clone(),
            DOWNLOAD_OPERATION,
            collection,
            self.config.lock.acquire_timeout,
        )
        .await?;

        let result = self.run_download(collection, &options).await;
        let released = guard.release().await;
        if let Err(e) = &released {
            tracing::warn!(collection = %collection, error = %e, "Failed to release collection lock");
        }

        let summary = result?;
        released?;
        Ok(summary)
    }

    async fn run_download(
        &self,
        collection: &str,
        options: &DownloadOptions,
    ) -> Result<DownloadSummary> {
        let observer = options.observer.as_ref();
        let incremental = options.incremental || options.since.is_some();
        let prior = self.store.progress(collection).await?;

        if let Some(prior) = &prior
            && prior.status == ProgressStatus::Completed
            && !options.force
            && !incremental
        {
            tracing::info!(collection = %collection, "Collection already complete");
            self.emit_event(
                observer,
                Event::AlreadyComplete {
                    collection: collection.to_string(),
                },
            );
            return Ok(DownloadSummary {
                collection: collection.to_string(),
                outcome: RunOutcome::AlreadyComplete,
                candidates_seen: 0,
                unique_shows: prior.unique_shows,
                downloaded: 0,
                already_cached: prior.downloaded,
                failed: 0,
                failed_identifiers: Vec::new(),
                progress: prior.clone(),
                metrics: RunMetrics::default(),
            });
        }

        let started_at = Utc::now();
        let since = resolve_since(options, incremental, prior.as_ref());
        if incremental && since.is_none() {
            tracing::info!(collection = %collection, "No sync watermark yet, running a full sync");
        }
        let full_sync = since.is_none();
        let mut metrics = RunMetrics::default();

        tracing::info!(
            collection = %collection,
            since = ?since,
            force = options.force,
            limit = ?options.limit,
            "Starting collection download"
        );

        // 1. Search
        let search = self.searcher().search(collection, since).await?;
        metrics.search_pages = search.pages;
        let candidates_seen = search.candidates.len() as u64;
        self.emit_event(
            observer,
            Event::SearchComplete {
                collection: collection.to_string(),
                candidates: candidates_seen,
                pages: search.pages,
            },
        );

        // 2. Select one winner per date
        let selection = select_best_versions(&search.candidates);
        let unique_shows = selection.winners.len() as u64;
        if selection.undated > 0 {
            tracing::warn!(
                collection = %collection,
                undated = selection.undated,
                "Recordings without a parseable date were not considered"
            );
        }
        self.emit_event(
            observer,
            Event::SelectionComplete {
                collection: collection.to_string(),
                unique_shows,
                undated: selection.undated as u64,
            },
        );

        // 3. Diff against the cache
        let mut previously_cached = HashSet::new();
        let mut to_fetch = Vec::new();
        for winner in &selection.winners {
            let cached = self.store.is_cached(collection, &winner.identifier).await;
            if cached {
                previously_cached.insert(winner.identifier.clone());
            }
            if options.force || !cached {
                to_fetch.push(winner.identifier.clone());
            }
        }
        // winners beyond the limit keep the collection in progress
        let mut deferred = 0;
        if let Some(limit) = options.limit
            && to_fetch.len() > limit
        {
            deferred = to_fetch.len() - limit;
            to_fetch.truncate(limit);
        }
        let already_cached = if options.force {
            0
        } else {
            previously_cached.len() as u64
        };
        let total = to_fetch.len() as u64;
        self.emit_event(
            observer,
            Event::FetchPlanned {
                collection: collection.to_string(),
                to_fetch: total,
                already_cached,
            },
        );

        // 4. Mark the run in progress with reconciled counters
        self.store
            .update_progress(collection, |p| {
                p.status = ProgressStatus::InProgress;
                p.started_at = Some(started_at);
                p.completed_at = None;
                if full_sync {
                    p.total_candidates = candidates_seen;
                    p.unique_shows = unique_shows;
                    p.downloaded = already_cached;
                } else {
                    p.total_candidates = p.total_candidates.max(candidates_seen);
                    p.unique_shows = p.unique_shows.max(unique_shows);
                }
                for identifier in &previously_cached {
                    p.clear_failure(identifier);
                }
            })
            .await?;

        // 5. Fetch in sub-batches, persisting after every item
        let mut tally = RunTally::default();
        let fetcher = self.fetcher();
        let mut previous_rate_limited = false;

        for (batch_index, batch) in to_fetch
            .chunks(self.config.fetch.sub_batch_size.max(1))
            .enumerate()
        {
            if batch_index > 0 {
                if previous_rate_limited {
                    self.cool_down(collection, observer, &mut metrics).await;
                } else {
                    self.pause(self.config.fetch.group_pause).await;
                }
            }
            if self.is_shutting_down() {
                tally.cancelled = true;
                break;
            }

            // the ledger is written as each item settles, not at the group barrier
            let (tx, mut rx) = mpsc::channel(PROGRESS_BUFFER);
            let cancel = self.shutdown_token.child_token();
            let fetching = fetcher.fetch(collection, batch, options.force, &cancel, Some(tx));
            let recording = async {
                while let Some(progress) = rx.recv().await {
                    let recorded = match progress {
                        FetchProgress::Item(item) => {
                            let counts =
                                full_sync || !previously_cached.contains(&item.identifier);
                            self.record_item(collection, item, counts, total, &mut tally, observer)
                                .await
                        }
                        FetchProgress::Cooldown(cooldown) => {
                            self.emit_event(
                                observer,
                                Event::Cooldown {
                                    collection: collection.to_string(),
                                    millis: cooldown.as_millis() as u64,
                                },
                            );
                            Ok(())
                        }
                    };
                    if let Err(e) = recorded {
                        // stop dispatching; the group in flight still settles
                        cancel.cancel();
                        rx.close();
                        return Err(e);
                    }
                }
                Ok(())
            };
            let (report, recorded) = tokio::join!(fetching, recording);
            metrics.absorb(&report.metrics);
            recorded?;
            previous_rate_limited = report.ended_rate_limited;
            if report.skipped() > 0 {
                tally.cancelled = true;
            }

            if tally.cancelled {
                break;
            }
        }

        // 6. Finish
        let progress = if tally.cancelled {
            let remaining = total - tally.processed;
            tracing::info!(
                collection = %collection,
                remaining,
                "Download interrupted by shutdown; progress saved"
            );
            self.emit_event(
                observer,
                Event::Cancelled {
                    collection: collection.to_string(),
                    remaining,
                },
            );
            self.store.update_progress(collection, |_| {}).await?
        } else if deferred > 0 {
            tracing::info!(
                collection = %collection,
                deferred,
                "Fetch limit reached; remaining shows are left for the next run"
            );
            self.store.update_progress(collection, |_| {}).await?
        } else {
            let status = if tally.outcome() == RunOutcome::Failed {
                ProgressStatus::Failed
            } else {
                ProgressStatus::Completed
            };
            let finished_at = Utc::now();
            self.store
                .update_progress(collection, |p| {
                    p.status = status;
                    p.completed_at = Some(finished_at);
                    if full_sync {
                        p.last_full_sync = Some(started_at);
                    } else {
                        p.last_incremental_sync = Some(started_at);
                    }
                })
                .await?
        };

        let outcome = if tally.cancelled {
            RunOutcome::Cancelled
        } else {
            tally.outcome()
        };
        self.finish(collection, outcome, &tally, observer);

        Ok(DownloadSummary {
            collection: collection.to_string(),
            outcome,
            candidates_seen,
            unique_shows,
            downloaded: tally.downloaded,
            already_cached,
            failed: tally.failed_identifiers.len() as u64,
            failed_identifiers: tally.failed_identifiers,
            progress,
            metrics,
        })
    }

    /// Persist the bookkeeping of one settled identifier and report it
    ///
    /// `counts` is false for a document that was already counted by an
    /// earlier run (an incremental refetch).
    async fn record_item(
        &self,
        collection: &str,
        item: ItemResult,
        counts: bool,
        total: u64,
        tally: &mut RunTally,
        observer: Option<&Arc<dyn ProgressObserver>>,
    ) -> Result<()> {
        let identifier = item.identifier;
        match item.outcome {
            FetchOutcome::Cached | FetchOutcome::Fetched => {
                self.store
                    .update_progress(collection, |p| {
                        if counts {
                            p.downloaded += 1;
                        }
                        p.last_processed = Some(identifier.clone());
                        p.clear_failure(&identifier);
                    })
                    .await?;
                tally.downloaded += 1;
                tally.processed += 1;
                self.emit_event(
                    observer,
                    Event::ItemDownloaded {
                        collection: collection.to_string(),
                        identifier,
                        position: tally.processed,
                        total,
                    },
                );
            }
            FetchOutcome::RateLimited => {
                self.record_item_failure(
                    collection,
                    &identifier,
                    "rate limited by remote archive",
                    true,
                    observer,
                )
                .await?;
                tally.failed_identifiers.push(identifier);
                tally.processed += 1;
            }
            FetchOutcome::Failed(error) => {
                self.record_item_failure(collection, &identifier, &error, false, observer)
                    .await?;
                tally.failed_identifiers.push(identifier);
                tally.processed += 1;
            }
            FetchOutcome::Skipped => tally.cancelled = true,
        }
        Ok(())
    }

    /// Persist one failed identifier and report it
    pub(crate) async fn record_item_failure(
        &self,
        collection: &str,
        identifier: &str,
        error: &str,
        rate_limited: bool,
        observer: Option<&Arc<dyn ProgressObserver>>,
    ) -> Result<()> {
        self.store
            .update_progress(collection, |p| p.record_failure(identifier))
            .await?;
        self.emit_event(
            observer,
            Event::ItemFailed {
                collection: collection.to_string(),
                identifier: identifier.to_string(),
                error: error.to_string(),
                rate_limited,
            },
        );
        Ok(())
    }

    /// Sleep the rate-limit cooldown, reporting it
    pub(crate) async fn cool_down(
        &self,
        collection: &str,
        observer: Option<&Arc<dyn ProgressObserver>>,
        metrics: &mut RunMetrics,
    ) {
        let cooldown = self.config.fetch.rate_limit_cooldown;
        metrics.cooldowns += 1;
        tracing::info!(
            collection = %collection,
            cooldown_ms = cooldown.as_millis() as u64,
            "Rate limited, cooling down"
        );
        self.emit_event(
            observer,
            Event::Cooldown {
                collection: collection.to_string(),
                millis: cooldown.as_millis() as u64,
            },
        );
        self.pause(cooldown).await;
    }

    /// Log and emit the end of a run
    pub(crate) fn finish(
        &self,
        collection: &str,
        outcome: RunOutcome,
        tally: &RunTally,
        observer: Option<&Arc<dyn ProgressObserver>>,
    ) {
        tracing::info!(
            collection = %collection,
            outcome = %outcome,
            downloaded = tally.downloaded,
            failed = tally.failed_identifiers.len(),
            "Run finished"
        );
        self.emit_event(
            observer,
            Event::Finished {
                collection: collection.to_string(),
                outcome,
                downloaded: tally.downloaded,
                failed: tally.failed_identifiers.len() as u64,
            },
        );
    }
}

/// Lower publish-date bound: explicit date, else the newest watermark in
/// incremental mode
fn resolve_since(
    options: &DownloadOptions,
    incremental: bool,
    prior: Option<&CollectionProgress>,
) -> Option<NaiveDate> {
    options.since.or_else(|| {
        if incremental {
            prior
                .and_then(CollectionProgress::watermark)
                .map(|watermark| watermark.date_naive())
        } else {
            None
        }
    })
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn explicit_since_wins_over_watermark() {
        let mut prior = CollectionProgress::new("Phish");
        prior.last_full_sync = Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        let explicit = NaiveDate::from_ymd_opt(2020, 1, 1);
        let options = DownloadOptions {
            since: explicit,
            ..Default::default()
        };

        assert_eq!(resolve_since(&options, true, Some(&prior)), explicit);
        assert_eq!(
            resolve_since(&DownloadOptions::default(), true, Some(&prior)),
            NaiveDate::from_ymd_opt(2024, 5, 1)
        );
        assert_eq!(resolve_since(&DownloadOptions::default(), false, Some(&prior)), None);
        assert_eq!(resolve_since(&DownloadOptions::default(), true, None), None);
    }

    #[test]
    fn tally_outcome_distinguishes_partial_failure() {
        let mut tally = RunTally::default();
        assert_eq!(tally.outcome(), RunOutcome::Completed);

        tally.failed_identifiers.push("x".to_string());
        assert_eq!(tally.outcome(), RunOutcome::Failed);

        tally.downloaded = 1;
        assert_eq!(tally.outcome(), RunOutcome::CompletedWithFailures);
    }
}
