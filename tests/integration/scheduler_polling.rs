//! Integration tests for the poll scheduler driving real ingestions.

use std::sync::Arc;
use std::time::Duration;

use backend_monitor::{
    actors::SchedulerHandle,
    storage::{MemoryBackend, StorageBackend},
};
use tokio::time::{Instant, sleep};
use tokio_test::{assert_err, assert_ok};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

/// Wait until `target_id` has a stored snapshot or `limit` passes.
async fn wait_for_snapshot(storage: &dyn StorageBackend, target_id: i64, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if storage.latest_snapshot(target_id).await.unwrap().is_some() {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_never_seen_target_is_polled_on_first_tick() {
    let agent = MockServer::start().await;
    serve_metrics(&agent, metrics_json(20.0, 30.0)).await;

    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let target = add_target(storage.as_ref(), "alpha", &agent.uri()).await;

    let scheduler = SchedulerHandle::spawn(
        Arc::new(ingestor(Arc::clone(&storage))),
        Duration::from_secs(1),
    );

    assert!(wait_for_snapshot(storage.as_ref(), target.id, Duration::from_secs(5)).await);

    let statuses = scheduler.status().await.unwrap();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].target_id, target.id);
    assert_eq!(statuses[0].effective_interval_seconds, 60);

    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_successful_poll_is_not_repeated_within_interval() {
    let agent = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/metrics"))
        .respond_with(ResponseTemplate::new(200).set_body_json(metrics_json(20.0, 30.0)))
        .expect(1)
        .mount(&agent)
        .await;

    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let target = add_target(storage.as_ref(), "alpha", &agent.uri()).await;

    let scheduler = SchedulerHandle::spawn(
        Arc::new(ingestor(Arc::clone(&storage))),
        Duration::from_secs(1),
    );

    assert!(wait_for_snapshot(storage.as_ref(), target.id, Duration::from_secs(5)).await);
    // Several more ticks; the next poll is a minute away
    sleep(Duration::from_millis(2500)).await;

    let statuses = scheduler.status().await.unwrap();
    assert_eq!(statuses[0].last_success, Some(true));
    assert_eq!(statuses[0].consecutive_failures, 0);
    assert!(!statuses[0].in_flight);

    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failing_target_does_not_block_others() {
    let healthy = MockServer::start().await;
    serve_metrics(&healthy, metrics_json(20.0, 30.0)).await;

    let broken = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/metrics"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&broken)
        .await;

    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let bad = add_target(storage.as_ref(), "broken", &broken.uri()).await;
    let good = add_target(storage.as_ref(), "healthy", &healthy.uri()).await;

    let scheduler = SchedulerHandle::spawn(
        Arc::new(ingestor(Arc::clone(&storage))),
        Duration::from_secs(1),
    );

    assert!(wait_for_snapshot(storage.as_ref(), good.id, Duration::from_secs(5)).await);
    sleep(Duration::from_millis(500)).await;

    let statuses = scheduler.status().await.unwrap();
    let failed = statuses
        .iter()
        .find(|status| status.target_id == bad.id)
        .expect("broken target is scheduled");
    assert_eq!(failed.last_success, Some(false));
    assert!(failed.consecutive_failures >= 1);
    assert!(storage.latest_snapshot(bad.id).await.unwrap().is_none());

    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_handle_errors_after_shutdown() {
    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let scheduler = SchedulerHandle::spawn(
        Arc::new(ingestor(Arc::clone(&storage))),
        Duration::from_secs(1),
    );

    assert_ok!(scheduler.shutdown().await);
    sleep(Duration::from_millis(50)).await;

    assert_err!(scheduler.status().await);
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_ingestion() {
    let agent = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/metrics"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(metrics_json(20.0, 30.0))
                .set_delay(Duration::from_millis(1000)),
        )
        .mount(&agent)
        .await;

    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let target = add_target(storage.as_ref(), "slow", &agent.uri()).await;

    let scheduler = SchedulerHandle::spawn(
        Arc::new(ingestor(Arc::clone(&storage))),
        Duration::from_secs(1),
    );

    let deadline = Instant::now() + Duration::from_secs(5);
    while agent.received_requests().await.unwrap_or_default().is_empty() {
        assert!(Instant::now() < deadline, "agent was never polled");
        sleep(Duration::from_millis(20)).await;
    }

    let statuses = scheduler.status().await.unwrap();
    assert!(statuses[0].in_flight);
    assert!(storage.latest_snapshot(target.id).await.unwrap().is_none());

    assert_ok!(scheduler.shutdown().await);

    let stored = storage.latest_snapshot(target.id).await.unwrap();
    assert_eq!(stored.and_then(|snapshot| snapshot.ram_used_percent), Some(20.0));
}

#[tokio::test]
async fn test_failed_poll_retries_within_a_minute() {
    let agent = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/metrics"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&agent)
        .await;

    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let mut upsert = target_upsert("flaky", &agent.uri(), 0);
    upsert.poll_interval_seconds = 600;
    let target = storage.upsert_target(upsert).await.unwrap();

    let scheduler = SchedulerHandle::spawn(
        Arc::new(ingestor(Arc::clone(&storage))),
        Duration::from_secs(1),
    );

    let deadline = Instant::now() + Duration::from_secs(5);
    let failed = loop {
        let statuses = scheduler.status().await.unwrap();
        if let Some(status) = statuses
            .into_iter()
            .find(|status| status.target_id == target.id && status.last_success == Some(false))
        {
            break status;
        }
        assert!(Instant::now() < deadline, "poll never failed");
        sleep(Duration::from_millis(50)).await;
    };

    assert_eq!(failed.effective_interval_seconds, 600);
    let wait = failed.next_due_at - chrono::Utc::now();
    assert!(wait <= chrono::Duration::seconds(60), "retry due in {wait}");
    assert!(wait > chrono::Duration::seconds(50), "retry due in {wait}");

    scheduler.shutdown().await.unwrap();
}
