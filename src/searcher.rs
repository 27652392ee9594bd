//! Paginated collection search.

use std::sync::Arc;

use chrono::NaiveDate;

use crate::archive::{ArchiveApi, SearchQuery};
use crate::config::{RetryConfig, SearchConfig};
use crate::error::{Error, Result};
use crate::retry::with_retry;
use crate::types::CandidateRecording;

/// Everything a search returned
#[derive(Clone, Debug, Default)]
pub struct SearchResults {
    /// Candidates across all pages, in server order
    pub candidates: Vec<CandidateRecording>,
    /// Pages requested
    pub pages: u64,
    /// Total reported by the server on the first page
    pub reported_total: u64,
}

/// Collects every candidate recording of a collection
pub struct CollectionSearcher {
    api: Arc<dyn ArchiveApi>,
    search: SearchConfig,
    retry: RetryConfig,
}

impl CollectionSearcher {
    /// Create a searcher over the given archive client
    pub fn new(api: Arc<dyn ArchiveApi>, search: SearchConfig, retry: RetryConfig) -> Self {
        Self { api, search, retry }
    }

    /// Page through the collection until the reported total is reached or a
    /// page comes back empty
    ///
    /// Every page goes through the retry policy, 429 included. When retries
    /// are exhausted the whole search fails with [`Error::Search`].
    pub async fn search(&self, collection: &str, since: Option<NaiveDate>) -> Result<SearchResults> {
        let mut results = SearchResults::default();
        let mut page = 1u32;

        loop {
            let query = SearchQuery {
                collection: collection.to_string(),
                since,
                page,
                rows: self.search.page_size,
            };

            let response = with_retry(&self.retry, || self.api.search_page(&query))
                .await
                .map_err(|e| Error::Search {
                    collection: collection.to_string(),
                    source: Box::new(e),
                })?;
            results.pages += 1;

            if page == 1 {
                results.reported_total = response.total;
            }
            let received = response.candidates.len();
            results.candidates.extend(response.candidates);

            tracing::debug!(
                collection = %collection,
                page,
                received,
                accumulated = results.candidates.len(),
                total = results.reported_total,
                "Search page received"
            );

            if received == 0 || results.candidates.len() as u64 >= results.reported_total {
                break;
            }

            page += 1;
            tokio::time::sleep(self.search.page_delay).await;
        }

        tracing::info!(
            collection = %collection,
            candidates = results.candidates.len(),
            pages = results.pages,
            since = ?since,
            "Collection search complete"
        );

        Ok(results)
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::SearchPage;
    use crate::types::{RawDate, ShowMetadata};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Serves a fixed result set, optionally failing the first N calls
    struct PagedArchive {
        items: Vec<CandidateRecording>,
        failures: Mutex<Vec<Error>>,
        queries: Mutex<Vec<SearchQuery>>,
    }

    impl PagedArchive {
        fn with_items(n: usize) -> Self {
            let items = (0..n)
                .map(|i| {
                    CandidateRecording::new(
                        format!("item{i}"),
                        Some(RawDate::One(format!("2000-01-{:02}", i % 28 + 1))),
                        0.0,
                        0,
                        0,
                    )
                })
                .collect();
            Self {
                items,
                failures: Mutex::new(Vec::new()),
                queries: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ArchiveApi for PagedArchive {
        async fn search_page(&self, query: &SearchQuery) -> Result<SearchPage> {
            self.queries.lock().unwrap().push(query.clone());
            if let Some(err) = self.failures.lock().unwrap().pop() {
                return Err(err);
            }
            let start = (query.page as usize - 1) * query.rows;
            let candidates = self
                .items
                .iter()
                .skip(start)
                .take(query.rows)
                .cloned()
                .collect();
            Ok(SearchPage {
                total: self.items.len() as u64,
                candidates,
            })
        }

        async fn fetch_metadata(&self, identifier: &str) -> Result<ShowMetadata> {
            Err(Error::Other(format!("unexpected fetch of {identifier}")))
        }
    }

    fn searcher(api: Arc<PagedArchive>, page_size: usize) -> CollectionSearcher {
        CollectionSearcher::new(
            api,
            SearchConfig {
                page_size,
                page_delay: Duration::from_millis(1),
            },
            RetryConfig {
                max_attempts: 2,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                backoff_multiplier: 2.0,
                jitter: false,
            },
        )
    }

    #[tokio::test]
    async fn collects_all_pages_until_total() {
        let api = Arc::new(PagedArchive::with_items(25));
        let results = searcher(api.clone(), 10).search("Phish", None).await.unwrap();

        assert_eq!(results.candidates.len(), 25);
        assert_eq!(results.pages, 3);
        assert_eq!(results.reported_total, 25);

        let pages: Vec<u32> = api.queries.lock().unwrap().iter().map(|q| q.page).collect();
        assert_eq!(pages, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn empty_collection_takes_one_request() {
        let api = Arc::new(PagedArchive::with_items(0));
        let results = searcher(api.clone(), 10).search("Nobody", None).await.unwrap();

        assert!(results.candidates.is_empty());
        assert_eq!(api.queries.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn since_is_forwarded_on_every_page() {
        let api = Arc::new(PagedArchive::with_items(4));
        let since = NaiveDate::from_ymd_opt(2024, 1, 15);
        searcher(api.clone(), 2).search("Phish", since).await.unwrap();

        assert!(api.queries.lock().unwrap().iter().all(|q| q.since == since));
    }

    #[tokio::test]
    async fn rate_limited_page_is_retried() {
        let api = Arc::new(PagedArchive::with_items(3));
        api.failures.lock().unwrap().push(Error::RateLimited {
            url: "search".to_string(),
        });

        let results = searcher(api.clone(), 10).search("Phish", None).await.unwrap();

        assert_eq!(results.candidates.len(), 3);
        assert_eq!(api.queries.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_search() {
        let api = Arc::new(PagedArchive::with_items(3));
        for _ in 0..3 {
            api.failures.lock().unwrap().push(Error::Http {
                status: 503,
                url: "search".to_string(),
            });
        }

        let err = searcher(api, 10).search("Phish", None).await.unwrap_err();

        match err {
            Error::Search { collection, source } => {
                assert_eq!(collection, "Phish");
                assert!(matches!(*source, Error::Http { status: 503, .. }));
            }
            other => panic!("expected search error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_retryable_failure_is_not_retried() {
        let api = Arc::new(PagedArchive::with_items(3));
        api.failures.lock().unwrap().push(Error::Parse {
            context: "search".to_string(),
            reason: "bad json".to_string(),
        });

        let err = searcher(api.clone(), 10).search("Phish", None).await.unwrap_err();

        assert!(matches!(err, Error::Search { .. }));
        assert_eq!(api.queries.lock().unwrap().len(), 1);
    }
}
