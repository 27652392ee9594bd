//! End-to-end runs against a mock archive over HTTP
//!
//! These tests drive `Downloader::new` (the production `reqwest` client)
//! against a wiremock server, covering search, selection, fetch, caching,
//! the progress ledger and lock files on disk.

mod common;

use std::time::Duration;

use common::{
    COLLECTION, metadata_body, mount_metadata, mount_search, mount_status, search_doc,
    test_config,
};
use etree_dl::config::LockConfig;
use etree_dl::{
    DownloadOptions, Downloader, Error, FileLockManager, LockError, LockManager, ProgressStatus,
    RunOutcome,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_collection_download_end_to_end() {
    let server = MockServer::start().await;
    let temp = tempfile::tempdir().unwrap();

    mount_search(
        &server,
        vec![
            search_doc("gd1977-05-08.sbd.hicks", "1977-05-08", "4.8", 40),
            search_doc("gd1977-05-08.aud.miller", "1977-05-08", "4.9", 60),
            search_doc("gd1977-05-09.aud.vernon", "1977-05-09", "4.1", 5),
        ],
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/metadata/gd1977-05-08.sbd.hicks"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(metadata_body("gd1977-05-08.sbd.hicks", "1977-05-08")),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/metadata/gd1977-05-09.aud.vernon"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(metadata_body("gd1977-05-09.aud.vernon", "1977-05-09")),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/metadata/gd1977-05-08.aud.miller"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let downloader = Downloader::new(test_config(&server.uri(), temp.path()))
        .await
        .unwrap();

    let summary = downloader
        .download(COLLECTION, DownloadOptions::default())
        .await
        .unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.candidates_seen, 3);
    assert_eq!(summary.unique_shows, 2);
    assert_eq!(summary.downloaded, 2);

    // Documents land in the per-collection cache with parsed fields
    let document = temp
        .path()
        .join("metadata")
        .join(COLLECTION)
        .join("gd1977-05-08.sbd.hicks.json");
    assert!(document.exists());
    let show = downloader
        .cached_metadata(COLLECTION, "gd1977-05-08.sbd.hicks")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(show.collection.as_deref(), Some(COLLECTION));
    assert_eq!(show.d1.as_deref(), Some("ia800100.us.archive.org"));
    assert_eq!(show.tracks.len(), 2);
    assert_eq!(show.tracks[1].length, Some(465.0));
    assert_eq!(show.avg_rating, Some(4.5));
    assert_eq!(show.num_reviews, 2);

    // The ledger is plain JSON with a versioned record
    let ledger: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(temp.path().join("progress.json")).unwrap())
            .unwrap();
    let record = &ledger["collections"][COLLECTION];
    assert_eq!(record["status"], "completed");
    assert_eq!(record["downloaded"], 2);
    assert_eq!(record["schema_version"], 3);

    // No lock file or temp file left behind
    assert_eq!(std::fs::read_dir(temp.path().join("locks")).unwrap().count(), 0);
    let leftovers: Vec<_> = std::fs::read_dir(temp.path().join("metadata").join(COLLECTION))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());

    // Idempotent: no further metadata requests
    let again = downloader
        .download(COLLECTION, DownloadOptions::default())
        .await
        .unwrap();
    assert_eq!(again.outcome, RunOutcome::AlreadyComplete);
}

#[tokio::test]
async fn test_rate_limited_item_is_recovered_by_retry_failed() {
    let server = MockServer::start().await;
    let temp = tempfile::tempdir().unwrap();

    mount_search(
        &server,
        vec![
            search_doc("gd1977-05-08.sbd.hicks", "1977-05-08", "4.8", 40),
            search_doc("gd1977-05-09.sbd.miller", "1977-05-09", "4.6", 12),
        ],
    )
    .await;
    mount_metadata(&server, "gd1977-05-08.sbd.hicks", "1977-05-08").await;
    // First request is throttled, later ones succeed
    Mock::given(method("GET"))
        .and(path("/metadata/gd1977-05-09.sbd.miller"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_metadata(&server, "gd1977-05-09.sbd.miller", "1977-05-09").await;

    let downloader = Downloader::new(test_config(&server.uri(), temp.path()))
        .await
        .unwrap();

    let summary = downloader
        .download(COLLECTION, DownloadOptions::default())
        .await
        .unwrap();
    assert_eq!(summary.outcome, RunOutcome::CompletedWithFailures);
    assert_eq!(summary.failed_identifiers, vec!["gd1977-05-09.sbd.miller"]);
    assert_eq!(summary.metrics.rate_limited, 1);

    let retried = downloader.retry_failed(COLLECTION, None).await.unwrap();
    assert_eq!(retried.outcome, RunOutcome::Completed);
    assert_eq!(retried.downloaded, 1);

    let progress = downloader.progress(COLLECTION).await.unwrap().unwrap();
    assert_eq!(progress.status, ProgressStatus::Completed);
    assert_eq!(progress.downloaded, 2);
    assert!(progress.failed_identifiers.is_empty());
}

#[tokio::test]
async fn test_search_failure_aborts_before_any_fetch() {
    let server = MockServer::start().await;
    let temp = tempfile::tempdir().unwrap();

    Mock::given(method("GET"))
        .and(path("/advancedsearch.php"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let downloader = Downloader::new(test_config(&server.uri(), temp.path()))
        .await
        .unwrap();

    let err = downloader
        .download(COLLECTION, DownloadOptions::default())
        .await
        .unwrap_err();
    match err {
        Error::Search { collection, source } => {
            assert_eq!(collection, COLLECTION);
            assert!(matches!(*source, Error::Http { status: 500, .. }));
        }
        other => panic!("expected search error, got {other}"),
    }

    assert!(downloader.progress(COLLECTION).await.unwrap().is_none());
    assert!(
        !downloader
            .lock_manager()
            .is_locked("download", COLLECTION)
            .await
            .unwrap(),
        "lock released on the error path"
    );
}

#[tokio::test]
async fn test_unparseable_and_missing_documents_are_recorded_as_failures() {
    let server = MockServer::start().await;
    let temp = tempfile::tempdir().unwrap();

    mount_search(
        &server,
        vec![
            search_doc("gd1977-05-08.sbd.hicks", "1977-05-08", "4.8", 40),
            search_doc("gd1977-05-09.sbd.dark", "1977-05-09", "4.6", 12),
            search_doc("gd1977-05-10.sbd.gone", "1977-05-10", "4.0", 3),
        ],
    )
    .await;
    mount_metadata(&server, "gd1977-05-08.sbd.hicks", "1977-05-08").await;
    mount_status(&server, "gd1977-05-10.sbd.gone", 404).await;
    // Dark items answer with an empty object
    Mock::given(method("GET"))
        .and(path("/metadata/gd1977-05-09.sbd.dark"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .mount(&server)
        .await;

    let downloader = Downloader::new(test_config(&server.uri(), temp.path()))
        .await
        .unwrap();
    let summary = downloader
        .download(COLLECTION, DownloadOptions::default())
        .await
        .unwrap();

    assert_eq!(summary.outcome, RunOutcome::CompletedWithFailures);
    assert_eq!(summary.downloaded, 1);
    assert_eq!(
        summary.failed_identifiers,
        vec!["gd1977-05-09.sbd.dark", "gd1977-05-10.sbd.gone"]
    );
    assert!(
        downloader
            .cached_metadata(COLLECTION, "gd1977-05-09.sbd.dark")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_lock_held_by_another_owner_blocks_download() {
    let server = MockServer::start().await;
    let temp = tempfile::tempdir().unwrap();
    mount_search(&server, Vec::new()).await;

    let config = test_config(&server.uri(), temp.path());
    let other = FileLockManager::new(config.storage.lock_dir.clone(), LockConfig::default());
    let downloader = Downloader::new(config).await.unwrap();

    let token = other
        .acquire("download", COLLECTION, Duration::ZERO)
        .await
        .unwrap();

    let err = downloader
        .download(COLLECTION, DownloadOptions::default())
        .await
        .unwrap_err();
    match err {
        Error::Lock(LockError::Conflict {
            operation,
            resource,
            holder_pid,
            ..
        }) => {
            assert_eq!(operation, "download");
            assert_eq!(resource, COLLECTION);
            assert_eq!(holder_pid, std::process::id());
        }
        other => panic!("expected lock conflict, got {other}"),
    }

    other.release(&token).await.unwrap();
    let summary = downloader
        .download(COLLECTION, DownloadOptions::default())
        .await
        .unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.unique_shows, 0);
}
