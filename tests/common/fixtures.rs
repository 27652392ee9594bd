//! Mock archive server and response bodies

use std::path::Path;
use std::time::Duration;

use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use etree_dl::Config;
use etree_dl::config::RetryConfig;

/// Collection served by the mock archive
pub const COLLECTION: &str = "GratefulDead";

/// One search document
pub fn search_doc(identifier: &str, date: &str, rating: &str, reviews: u64) -> Value {
    json!({
        "identifier": identifier,
        "date": format!("{date}T00:00:00Z"),
        "avg_rating": rating,
        "num_reviews": reviews,
        "downloads": 1000,
    })
}

/// Single-page search body
pub fn search_body(docs: Vec<Value>) -> Value {
    json!({
        "responseHeader": { "status": 0 },
        "response": { "numFound": docs.len(), "start": 0, "docs": docs }
    })
}

/// Metadata document with two audio tracks and a checksum file
pub fn metadata_body(identifier: &str, date: &str) -> Value {
    json!({
        "metadata": {
            "identifier": identifier,
            "title": format!("Grateful Dead Live at Barton Hall on {date}"),
            "date": date,
            "venue": "Barton Hall, Cornell University",
            "coverage": "Ithaca, NY",
            "collection": [COLLECTION, "etree"],
            "source": "SBD > Reel > DAT",
            "lineage": "DAT > CD-R > EAC > FLAC",
            "publicdate": "2004-03-01 12:00:00"
        },
        "files": [
            { "name": "gd77-05-08d1t01.flac", "format": "Flac", "title": "New Minglewood Blues", "track": "1", "length": "312.4" },
            { "name": "gd77-05-08d1t02.flac", "format": "Flac", "title": "Loser", "track": "2", "length": "7:45" },
            { "name": "gd77-05-08.ffp", "format": "Flac FingerPrint" }
        ],
        "reviews": [ { "stars": "5" }, { "stars": "4" } ],
        "dir": format!("/1/items/{identifier}"),
        "d1": "ia800100.us.archive.org",
        "d2": "ia600100.us.archive.org"
    })
}

/// Serve `docs` from the search endpoint
pub async fn mount_search(server: &MockServer, docs: Vec<Value>) {
    Mock::given(method("GET"))
        .and(path("/advancedsearch.php"))
        .respond_with(ResponseTemplate::new(200).set_body_json(search_body(docs)))
        .mount(server)
        .await;
}

/// Serve a metadata document for `identifier`
pub async fn mount_metadata(server: &MockServer, identifier: &str, date: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/metadata/{identifier}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(metadata_body(identifier, date)))
        .mount(server)
        .await;
}

/// Answer every metadata request for `identifier` with `status`
pub async fn mount_status(server: &MockServer, identifier: &str, status: u16) {
    Mock::given(method("GET"))
        .and(path(format!("/metadata/{identifier}")))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}

/// Fast configuration pointing at `base_url` with storage under `dir`
pub fn test_config(base_url: &str, dir: &Path) -> Config {
    let mut config = Config::default();
    config.archive.base_url = base_url.to_string();
    config.archive.request_timeout = Duration::from_secs(5);
    config.storage.cache_dir = dir.join("metadata");
    config.storage.ledger_path = dir.join("progress.json");
    config.storage.lock_dir = dir.join("locks");
    config.search.page_delay = Duration::ZERO;
    config.fetch.stagger_delay = Duration::from_millis(1);
    config.fetch.group_pause = Duration::from_millis(1);
    config.fetch.rate_limit_cooldown = Duration::from_millis(10);
    config.retry = RetryConfig {
        max_attempts: 1,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
        backoff_multiplier: 2.0,
        jitter: false,
    };
    config
}
