//! `reqwest` implementation of [`ArchiveApi`].

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;

use super::parse::{parse_metadata, value_f64, value_u64};
use super::{ArchiveApi, SearchPage, SearchQuery};
use crate::config::ArchiveConfig;
use crate::error::{Error, Result};
use crate::types::{CandidateRecording, RawDate, ShowMetadata};

/// Fields requested from the search endpoint
const SEARCH_FIELDS: [&str; 5] = ["identifier", "date", "avg_rating", "num_reviews", "downloads"];

/// HTTP client for an Internet-Archive-style service
#[derive(Clone, Debug)]
pub struct HttpArchiveClient {
    client: Client,
    base_url: String,
}

impl HttpArchiveClient {
    /// Build a client with the configured user agent and request timeout
    pub fn new(config: &ArchiveConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn search_url(&self) -> String {
        format!("{}/advancedsearch.php", self.base_url)
    }

    fn metadata_url(&self, identifier: &str) -> String {
        format!(
            "{}/metadata/{}",
            self.base_url,
            urlencoding::encode(identifier)
        )
    }
}

/// Search query string for a collection, optionally bounded by publish date
pub(crate) fn build_search_q(query: &SearchQuery) -> String {
    let mut q = format!("collection:({})", query.collection);
    if let Some(since) = query.since {
        q.push_str(&format!(" AND publicdate:[{} TO null]", since.format("%Y-%m-%d")));
    }
    q
}

/// Map 429 and other failures to the crate's error taxonomy
fn check_status(response: Response, url: &str) -> Result<Response> {
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        tracing::warn!(url = %url, "Remote archive rate limit exceeded");
        return Err(Error::RateLimited {
            url: url.to_string(),
        });
    }
    if !status.is_success() {
        return Err(Error::Http {
            status: status.as_u16(),
            url: url.to_string(),
        });
    }
    Ok(response)
}

#[derive(Deserialize)]
struct SearchEnvelope {
    response: SearchResponse,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(rename = "numFound", default)]
    num_found: u64,
    #[serde(default)]
    docs: Vec<SearchDoc>,
}

#[derive(Deserialize)]
struct SearchDoc {
    identifier: String,
    #[serde(default)]
    date: Option<RawDate>,
    #[serde(default)]
    avg_rating: Option<Value>,
    #[serde(default)]
    num_reviews: Option<Value>,
    #[serde(default)]
    downloads: Option<Value>,
}

impl From<SearchDoc> for CandidateRecording {
    fn from(doc: SearchDoc) -> Self {
        CandidateRecording::new(
            doc.identifier,
            doc.date,
            doc.avg_rating.as_ref().and_then(value_f64).unwrap_or(0.0),
            doc.num_reviews.as_ref().and_then(value_u64).unwrap_or(0),
            doc.downloads.as_ref().and_then(value_u64).unwrap_or(0),
        )
    }
}

/// Parse a search endpoint body
pub(crate) fn parse_search_page(body: &str, collection: &str) -> Result<SearchPage> {
    let envelope: SearchEnvelope = serde_json::from_str(body).map_err(|e| Error::Parse {
        context: format!("search results for {collection}"),
        reason: e.to_string(),
    })?;

    Ok(SearchPage {
        total: envelope.response.num_found,
        candidates: envelope
            .response
            .docs
            .into_iter()
            .map(CandidateRecording::from)
            .collect(),
    })
}

#[async_trait]
impl ArchiveApi for HttpArchiveClient {
    async fn search_page(&self, query: &SearchQuery) -> Result<SearchPage> {
        let url = self.search_url();
        let mut params: Vec<(&str, String)> = vec![("q", build_search_q(query))];
        params.extend(SEARCH_FIELDS.iter().map(|f| ("fl[]", (*f).to_string())));
        params.push(("sort[]", "date asc".to_string()));
        params.push(("rows", query.rows.to_string()));
        params.push(("page", query.page.to_string()));
        params.push(("output", "json".to_string()));

        tracing::debug!(
            collection = %query.collection,
            page = query.page,
            rows = query.rows,
            "Requesting search page"
        );

        let response = self.client.get(&url).query(&params).send().await?;
        let response = check_status(response, &url)?;
        let body = response.text().await?;
        parse_search_page(&body, &query.collection)
    }

    async fn fetch_metadata(&self, identifier: &str) -> Result<ShowMetadata> {
        let url = self.metadata_url(identifier);
        let response = self.client.get(&url).send().await?;
        let response = check_status(response, &url)?;
        let body = response.text().await?;
        parse_metadata(identifier, &body)
    }
}
