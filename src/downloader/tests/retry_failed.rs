use super::*;
use crate::downloader::test_helpers::{candidate, create_test_downloader, sample_collection};
use crate::types::{DownloadOptions, ProgressStatus, RunOutcome};

const COLLECTION: &str = "GratefulDead";

#[tokio::test]
async fn test_retry_failed_clears_recovered_identifiers() {
    let (downloader, api, _temp) = create_test_downloader(sample_collection()).await;
    api.fail("gd1977-05-09.sbd.miller");
    api.fail("gd1977-05-11.sbd.hicks");
    api.rate_limit("gd1977-05-12.aud.vernon");

    let first = downloader
        .download(COLLECTION, DownloadOptions::default())
        .await
        .unwrap();
    assert_eq!(first.failed, 3);
    assert_eq!(first.progress.downloaded, 2);
    let searches = api.queries().len();

    // Two of the three recover
    api.heal();
    api.rate_limit("gd1977-05-12.aud.vernon");

    let events = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = events.clone();
    let observer: Arc<dyn ProgressObserver> =
        Arc::new(move |event: &Event| sink.lock().unwrap().push(event.clone()));

    let summary = downloader
        .retry_failed(COLLECTION, Some(observer))
        .await
        .unwrap();

    assert_eq!(summary.outcome, RunOutcome::CompletedWithFailures);
    assert_eq!(summary.downloaded, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failed_identifiers, vec!["gd1977-05-12.aud.vernon"]);
    assert_eq!(api.queries().len(), searches, "retry does not search");

    let progress = downloader.progress(COLLECTION).await.unwrap().unwrap();
    assert_eq!(progress.failed_identifiers, vec!["gd1977-05-12.aud.vernon"]);
    assert_eq!(progress.failed, 1);
    assert_eq!(progress.downloaded, 4);
    assert_eq!(progress.status, ProgressStatus::Completed);
    assert!(
        downloader
            .store
            .is_cached(COLLECTION, "gd1977-05-09.sbd.miller")
            .await
    );

    let events = events.lock().unwrap();
    assert_eq!(
        events[0],
        Event::RetryStarted {
            collection: COLLECTION.to_string(),
            count: 3,
        }
    );
    assert_eq!(
        events.last().unwrap(),
        &Event::Finished {
            collection: COLLECTION.to_string(),
            outcome: RunOutcome::CompletedWithFailures,
            downloaded: 2,
            failed: 1,
        }
    );
}

#[tokio::test]
async fn test_retry_failed_cools_down_after_rate_limit() {
    let (downloader, api, _temp) = create_test_downloader(vec![
        candidate("gd1970-01-01.sbd.a", "1970-01-01", 4.0),
        candidate("gd1970-01-02.sbd.b", "1970-01-02", 4.0),
    ])
    .await;
    api.rate_limit("gd1970-01-01.sbd.a");
    api.fail("gd1970-01-02.sbd.b");
    downloader
        .download(COLLECTION, DownloadOptions::default())
        .await
        .unwrap();

    api.heal();
    api.rate_limit("gd1970-01-01.sbd.a");
    let mut rx = downloader.subscribe();
    let summary = downloader.retry_failed(COLLECTION, None).await.unwrap();

    assert_eq!(summary.downloaded, 1);
    assert_eq!(summary.metrics.cooldowns, 1);

    let mut saw_cooldown = false;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, Event::Cooldown { .. }) {
            saw_cooldown = true;
        }
    }
    assert!(saw_cooldown);
}

#[tokio::test]
async fn test_retry_failed_revives_failed_collection() {
    let (downloader, api, _temp) = create_test_downloader(vec![
        candidate("gd1970-01-01.sbd.a", "1970-01-01", 4.0),
        candidate("gd1970-01-02.sbd.b", "1970-01-02", 4.0),
    ])
    .await;
    api.fail("gd1970-01-01.sbd.a");
    api.fail("gd1970-01-02.sbd.b");
    downloader
        .download(COLLECTION, DownloadOptions::default())
        .await
        .unwrap();
    assert_eq!(
        downloader.progress(COLLECTION).await.unwrap().unwrap().status,
        ProgressStatus::Failed
    );

    api.heal();
    let summary = downloader.retry_failed(COLLECTION, None).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.downloaded, 2);
    let progress = downloader.progress(COLLECTION).await.unwrap().unwrap();
    assert_eq!(progress.status, ProgressStatus::Completed);
    assert_eq!(progress.downloaded, 2);
    assert!(progress.failed_identifiers.is_empty());
}

#[tokio::test]
async fn test_retry_failed_keeps_interrupted_status() {
    let (downloader, api, _temp) = create_test_downloader(sample_collection()).await;
    downloader
        .store
        .update_progress(COLLECTION, |p| {
            p.status = ProgressStatus::InProgress;
            p.record_failure("gd1977-05-09.sbd.miller");
        })
        .await
        .unwrap();

    let summary = downloader.retry_failed(COLLECTION, None).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(api.fetches_of("gd1977-05-09.sbd.miller"), 1);
    let progress = downloader.progress(COLLECTION).await.unwrap().unwrap();
    assert_eq!(progress.status, ProgressStatus::InProgress);
    assert!(progress.completed_at.is_none());
    assert!(progress.failed_identifiers.is_empty());
}

#[tokio::test]
async fn test_retry_failed_with_nothing_to_retry() {
    let (downloader, api, _temp) = create_test_downloader(sample_collection()).await;

    let summary = downloader.retry_failed(COLLECTION, None).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.downloaded, 0);
    assert_eq!(summary.failed, 0);
    assert_eq!(api.total_fetches(), 0);
    assert!(
        !downloader
            .lock_manager()
            .is_locked(DOWNLOAD_OPERATION, COLLECTION)
            .await
            .unwrap()
    );
}
