//! Rate-limited, bounded-concurrency metadata fetching.
//!
//! Identifiers that still need a network call are dispatched in groups of at
//! most `concurrency`. Inside a group the n-th request starts `n * stagger_delay`
//! after the first, and the whole group is awaited as a barrier before the
//! next one starts. Groups are separated by `group_pause`, or by the longer
//! `rate_limit_cooldown` when the previous group saw a 429.
//!
//! Callers that persist bookkeeping pass a channel to [`ConcurrentFetcher::fetch`]
//! and receive each settled identifier as soon as its request finishes, without
//! waiting for the group barrier.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::archive::ArchiveApi;
use crate::config::{FetchConfig, RetryConfig};
use crate::error::{Error, Result};
use crate::retry::{IsRetryable, retry_if};
use crate::state::StateStore;
use crate::types::{RunMetrics, ShowMetadata};

/// What happened to one identifier
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    /// A valid document was already cached; no request was made
    Cached,
    /// Fetched, parsed and cached
    Fetched,
    /// The archive answered 429; nothing cached
    RateLimited,
    /// Any other failure after retries; nothing cached
    Failed(String),
    /// Not dispatched because shutdown was requested
    Skipped,
}

impl FetchOutcome {
    /// A document for the identifier is now in the cache
    pub fn is_success(&self) -> bool {
        matches!(self, FetchOutcome::Cached | FetchOutcome::Fetched)
    }

    /// The identifier was attempted and failed
    pub fn is_failure(&self) -> bool {
        matches!(self, FetchOutcome::RateLimited | FetchOutcome::Failed(_))
    }
}

/// Outcome of one identifier
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemResult {
    pub identifier: String,
    pub outcome: FetchOutcome,
}

/// Streamed to the caller while a fetch is running
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchProgress {
    /// One identifier settled: a cache hit, a fresh document or a failure
    Item(ItemResult),
    /// The next group waits out the rate-limit cooldown first
    Cooldown(Duration),
}

async fn notify(progress: Option<&mpsc::Sender<FetchProgress>>, event: FetchProgress) {
    if let Some(tx) = progress {
        // a receiver that went away only stops listening
        tx.send(event).await.ok();
    }
}

/// Everything a [`ConcurrentFetcher::fetch`] call produced
#[derive(Clone, Debug, Default)]
pub struct FetchReport {
    /// One entry per input identifier, in input order
    pub items: Vec<ItemResult>,
    /// Documents for cache hits and fresh fetches; `None` for failures
    pub results: HashMap<String, Option<ShowMetadata>>,
    /// At least one request in the call was rate limited
    pub rate_limited: bool,
    /// The last group dispatched saw a 429; no cooldown has followed it yet
    pub ended_rate_limited: bool,
    /// Request counters for the call
    pub metrics: RunMetrics,
}

impl FetchReport {
    /// Identifiers that were not dispatched because of shutdown
    pub fn skipped(&self) -> usize {
        self.items
            .iter()
            .filter(|item| item.outcome == FetchOutcome::Skipped)
            .count()
    }
}

/// Fetches and caches metadata documents under the archive's rate limits
pub struct ConcurrentFetcher {
    api: Arc<dyn ArchiveApi>,
    store: Arc<StateStore>,
    fetch: FetchConfig,
    retry: RetryConfig,
}

impl ConcurrentFetcher {
    pub fn new(
        api: Arc<dyn ArchiveApi>,
        store: Arc<StateStore>,
        fetch: FetchConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            api,
            store,
            fetch,
            retry,
        }
    }

    /// Fetch every identifier not already cached (all of them when `force`)
    ///
    /// Never fails as a whole: per-identifier errors are reported in
    /// [`FetchReport::items`]. `cancel` is checked before each group is
    /// dispatched; a group in flight always runs to completion.
    ///
    /// When `progress` is given, every settled identifier is sent the moment
    /// its request returns, and every cooldown before it starts. Skipped
    /// identifiers are only reported in the returned [`FetchReport`].
    pub async fn fetch(
        &self,
        collection: &str,
        identifiers: &[String],
        force: bool,
        cancel: &CancellationToken,
        progress: Option<mpsc::Sender<FetchProgress>>,
    ) -> FetchReport {
        let progress = progress.as_ref();
        let mut report = FetchReport::default();
        let mut outcomes: Vec<Option<FetchOutcome>> = vec![None; identifiers.len()];
        let mut pending: Vec<usize> = Vec::new();

        for (index, identifier) in identifiers.iter().enumerate() {
            if !force {
                match self.store.load_metadata(collection, identifier).await {
                    Ok(Some(document)) => {
                        tracing::debug!(identifier = %identifier, "Cache hit, skipping request");
                        report.metrics.cache_hits += 1;
                        report.results.insert(identifier.clone(), Some(document));
                        outcomes[index] = Some(FetchOutcome::Cached);
                        notify(
                            progress,
                            FetchProgress::Item(ItemResult {
                                identifier: identifier.clone(),
                                outcome: FetchOutcome::Cached,
                            }),
                        )
                        .await;
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(identifier = %identifier, error = %e, "Cache lookup failed");
                    }
                }
            }
            pending.push(index);
        }

        let concurrency = self.fetch.concurrency.max(1);
        let mut previous_rate_limited = false;

        for (group_index, group) in pending.chunks(concurrency).enumerate() {
            if group_index > 0 {
                let pause = if previous_rate_limited {
                    report.metrics.cooldowns += 1;
                    tracing::info!(
                        collection = %collection,
                        cooldown_ms = self.fetch.rate_limit_cooldown.as_millis() as u64,
                        "Rate limited, cooling down before next group"
                    );
                    notify(
                        progress,
                        FetchProgress::Cooldown(self.fetch.rate_limit_cooldown),
                    )
                    .await;
                    self.fetch.rate_limit_cooldown
                } else {
                    self.fetch.group_pause
                };
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = cancel.cancelled() => {}
                }
            }

            if cancel.is_cancelled() {
                tracing::info!(
                    collection = %collection,
                    skipped = pending.len() - group_index * concurrency,
                    "Shutdown requested, leaving remaining identifiers for the next run"
                );
                break;
            }

            let requests = group.iter().enumerate().map(|(position, &index)| {
                let identifier = identifiers[index].as_str();
                async move {
                    if position > 0 {
                        tokio::time::sleep(self.fetch.stagger_delay * position as u32).await;
                    }
                    let (result, attempts) = self.fetch_item(collection, identifier).await;
                    let (outcome, document) = match result {
                        Ok(document) => (FetchOutcome::Fetched, Some(document)),
                        Err(e) if e.is_rate_limited() => (FetchOutcome::RateLimited, None),
                        Err(e) => (FetchOutcome::Failed(e.to_string()), None),
                    };
                    notify(
                        progress,
                        FetchProgress::Item(ItemResult {
                            identifier: identifier.to_string(),
                            outcome: outcome.clone(),
                        }),
                    )
                    .await;
                    (index, outcome, document, attempts)
                }
            });

            previous_rate_limited = false;
            for (index, outcome, document, attempts) in join_all(requests).await {
                report.metrics.metadata_requests += attempts;
                if outcome == FetchOutcome::RateLimited {
                    previous_rate_limited = true;
                    report.rate_limited = true;
                    report.metrics.rate_limited += 1;
                }
                report.results.insert(identifiers[index].clone(), document);
                outcomes[index] = Some(outcome);
            }
        }

        report.ended_rate_limited = previous_rate_limited;
        report.items = identifiers
            .iter()
            .zip(outcomes)
            .map(|(identifier, outcome)| ItemResult {
                identifier: identifier.clone(),
                outcome: outcome.unwrap_or(FetchOutcome::Skipped),
            })
            .collect();
        report
    }

    /// Fetch and cache one identifier without group pacing
    ///
    /// Always goes to the network; used to re-attempt recorded failures.
    pub async fn fetch_one(
        &self,
        collection: &str,
        identifier: &str,
        metrics: &mut RunMetrics,
    ) -> Result<ShowMetadata> {
        let (result, attempts) = self.fetch_item(collection, identifier).await;
        metrics.metadata_requests += attempts;
        if matches!(&result, Err(e) if e.is_rate_limited()) {
            metrics.rate_limited += 1;
        }
        result
    }

    /// Request, parse and persist one document; returns the number of requests made
    ///
    /// Transient failures other than 429 are retried; a 429 is reported at once
    /// so the caller can pace the whole batch.
    async fn fetch_item(&self, collection: &str, identifier: &str) -> (Result<ShowMetadata>, u64) {
        let mut attempts = 0u64;
        let fetched = retry_if(
            &self.retry,
            |e: &Error| e.is_retryable() && !e.is_rate_limited(),
            || {
                attempts += 1;
                self.api.fetch_metadata(identifier)
            },
        )
        .await;

        let result = match fetched {
            Ok(mut document) => {
                if document.identifier != identifier {
                    tracing::debug!(
                        requested = %identifier,
                        reported = %document.identifier,
                        "Archive reported a different identifier; storing under the requested one"
                    );
                    document.identifier = identifier.to_string();
                }
                // the archive's first tag is often a parent collection
                document.tag_collection(collection);
                self.store
                    .save_metadata(collection, &document)
                    .await
                    .map(|_| document)
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            tracing::warn!(
                collection = %collection,
                identifier = %identifier,
                error = %e,
                "Metadata fetch failed"
            );
        }
        (result, attempts)
    }
}
