//! Remote archive access.
//!
//! The pipeline talks to the archive through the [`ArchiveApi`] trait so the
//! searcher, fetcher and orchestrator can be exercised against in-process fakes.
//! [`HttpArchiveClient`] is the production implementation.
//!
//! - [`http`] - `reqwest` client for the search and metadata endpoints
//! - [`parse`] - Metadata document parsing

mod http;
pub mod parse;

pub use http::HttpArchiveClient;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::Result;
use crate::types::{CandidateRecording, ShowMetadata};

/// One page request against the search endpoint
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchQuery {
    /// Collection to search
    pub collection: String,
    /// Lower publish-date bound (incremental mode)
    pub since: Option<NaiveDate>,
    /// 1-based page number
    pub page: u32,
    /// Rows per page
    pub rows: usize,
}

/// One page of search results
#[derive(Clone, Debug, Default)]
pub struct SearchPage {
    /// Total matches reported by the server
    pub total: u64,
    /// Candidates on this page
    pub candidates: Vec<CandidateRecording>,
}

/// Remote archive operations used by the pipeline
///
/// Implementations map a 429 response to [`Error::RateLimited`](crate::Error::RateLimited)
/// and other non-success statuses to [`Error::Http`](crate::Error::Http).
#[async_trait]
pub trait ArchiveApi: Send + Sync {
    /// Fetch one page of a collection search
    async fn search_page(&self, query: &SearchQuery) -> Result<SearchPage>;

    /// Fetch and parse the metadata document of one identifier
    async fn fetch_metadata(&self, identifier: &str) -> Result<ShowMetadata>;
}
