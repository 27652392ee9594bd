//! Re-attempting recorded failures.

use std::sync::Arc;

use chrono::Utc;

use crate::error::Result;
use crate::lock::LockGuard;
use crate::state::validate_name;
use crate::types::{
    CollectionProgress, DownloadSummary, Event, ProgressObserver, ProgressStatus, RunMetrics,
    RunOutcome,
};

use super::orchestration::RunTally;
use super::{DOWNLOAD_OPERATION, Downloader};

impl Downloader {
    /// Re-attempt every identifier in the collection's failed list
    ///
    /// No search or selection happens: the failed list is read from the ledger
    /// and each identifier is fetched one at a time, with the failed list and
    /// download count persisted after every item. A 429 is followed by the
    /// rate-limit cooldown before the next item.
    ///
    /// Takes the same lock as [`download`](Self::download), so the two never
    /// run concurrently for one collection.
    pub async fn retry_failed(
        &self,
        collection: &str,
        observer: Option<Arc<dyn ProgressObserver>>,
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

        let result = self.run_retry_failed(collection, observer.as_ref()).await;
        let released = guard.release().await;
        if let Err(e) = &released {
            tracing::warn!(collection = %collection, error = %e, "Failed to release collection lock");
        }

        let summary = result?;
        released?;
        Ok(summary)
    }

    async fn run_retry_failed(
        &self,
        collection: &str,
        observer: Option<&Arc<dyn ProgressObserver>>,
    ) -> Result<DownloadSummary> {
        let prior = self
            .store
            .progress(collection)
            .await?
            .unwrap_or_else(|| CollectionProgress::new(collection));
        let to_retry = prior.failed_identifiers.clone();
        let total = to_retry.len() as u64;
        let mut metrics = RunMetrics::default();
        let mut tally = RunTally::default();

        if to_retry.is_empty() {
            tracing::info!(collection = %collection, "No failed recordings to retry");
            self.finish(collection, RunOutcome::Completed, &tally, observer);
            return Ok(summary(collection, RunOutcome::Completed, tally, prior, metrics));
        }

        tracing::info!(collection = %collection, count = total, "Retrying failed recordings");
        self.emit_event(
            observer,
            Event::RetryStarted {
                collection: collection.to_string(),
                count: total,
            },
        );

        let fetcher = self.fetcher();
        let mut previous_rate_limited = false;

        for (index, identifier) in to_retry.iter().enumerate() {
            if index > 0 {
                if previous_rate_limited {
                    self.cool_down(collection, observer, &mut metrics).await;
                } else {
                    self.pause(self.config.fetch.stagger_delay).await;
                }
            }
            if self.is_shutting_down() {
                tally.cancelled = true;
                break;
            }

            tally.processed += 1;
            match fetcher.fetch_one(collection, identifier, &mut metrics).await {
                Ok(_) => {
                    previous_rate_limited = false;
                    self.store
                        .update_progress(collection, |p| {
                            if p.clear_failure(identifier) {
                                p.downloaded += 1;
                            }
                            p.last_processed = Some(identifier.clone());
                        })
                        .await?;
                    tally.downloaded += 1;
                    self.emit_event(
                        observer,
                        Event::ItemDownloaded {
                            collection: collection.to_string(),
                            identifier: identifier.clone(),
                            position: tally.processed,
                            total,
                        },
                    );
                }
                Err(e) => {
                    previous_rate_limited = e.is_rate_limited();
                    self.record_item_failure(
                        collection,
                        identifier,
                        &e.to_string(),
                        previous_rate_limited,
                        observer,
                    )
                    .await?;
                    tally.failed_identifiers.push(identifier.clone());
                }
            }
        }

        let outcome = if tally.cancelled {
            let remaining = total - tally.processed;
            self.emit_event(
                observer,
                Event::Cancelled {
                    collection: collection.to_string(),
                    remaining,
                },
            );
            RunOutcome::Cancelled
        } else {
            tally.outcome()
        };

        // An interrupted or recovered download keeps its status: only a
        // finished run's verdict is revised by a retry.
        let revise = !tally.cancelled
            && matches!(
                prior.status,
                ProgressStatus::Completed | ProgressStatus::Failed
            );
        let finished_at = Utc::now();
        let progress = self
            .store
            .update_progress(collection, |p| {
                if revise {
                    p.status = if outcome == RunOutcome::Failed {
                        ProgressStatus::Failed
                    } else {
                        ProgressStatus::Completed
                    };
                    p.completed_at = Some(finished_at);
                }
            })
            .await?;

        self.finish(collection, outcome, &tally, observer);
        Ok(summary(collection, outcome, tally, progress, metrics))
    }
}

fn summary(
    collection: &str,
    outcome: RunOutcome,
    tally: RunTally,
    progress: CollectionProgress,
    metrics: RunMetrics,
) -> DownloadSummary {
    DownloadSummary {
        collection: collection.to_string(),
        outcome,
        candidates_seen: 0,
        unique_shows: progress.unique_shows,
        downloaded: tally.downloaded,
        already_cached: 0,
        failed: tally.failed_identifiers.len() as u64,
        failed_identifiers: tally.failed_identifiers,
        progress,
        metrics,
    }
}
