//! Integration tests for one poll of one target: fetch, evaluate, persist
//! and notify.

use std::sync::Arc;
use std::time::Duration;

use backend_monitor::{
    ingest::{AgentClient, Ingestor},
    storage::{MemoryBackend, Retention, StorageBackend},
};
use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

#[tokio::test]
async fn test_warning_notifies_only_on_entering_warning_state() {
    let agent = MockServer::start().await;
    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let target = add_target(storage.as_ref(), "alpha", &agent.uri()).await;

    let notifier = Arc::new(RecordingNotifier::default());
    let ingestor = ingestor(Arc::clone(&storage)).with_notifier(notifier.clone());

    // warn, warn, ok, warn
    let readings = [(95.0, 1), (96.0, 1), (40.0, 1), (97.0, 2)];
    for (ram, expected_calls) in readings {
        serve_metrics(&agent, metrics_json(ram, 50.0)).await;
        let stored = ingestor.ingest_safely(target.id).await;
        assert!(stored.is_some(), "poll with ram {ram} should be stored");
        assert_eq!(notifier.calls(), expected_calls, "after ram {ram}");
    }

    let summaries = notifier.last_summaries().await;
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].name, "alpha");
    assert_eq!(summaries[0].warnings, vec!["High RAM usage 97.0%".to_string()]);
}

#[tokio::test]
async fn test_successful_poll_updates_target() {
    let agent = MockServer::start().await;
    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let target = add_target(storage.as_ref(), "alpha", &agent.uri()).await;
    serve_metrics(&agent, metrics_json(40.0, 95.0)).await;

    let ingestor = ingestor(Arc::clone(&storage));
    let stored = ingestor
        .ingest_safely(target.id)
        .await
        .expect("poll should be stored");

    assert_eq!(stored.target_id, target.id);
    assert_eq!(stored.warnings, vec!["/data usage critical at 95.0%".to_string()]);
    assert_eq!(stored.raw_payload["hostname"], json!("test-host"));

    let reloaded = storage.get_target(target.id).await.unwrap().unwrap();
    assert!(reloaded.last_seen_at.is_some());
    assert_eq!(
        reloaded.last_warning.as_deref(),
        Some("/data usage critical at 95.0%")
    );
}

#[tokio::test]
async fn test_agent_receives_bearer_token() {
    let agent = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/metrics"))
        .and(header("Authorization", format!("Bearer {AGENT_TOKEN}").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(metrics_json(10.0, 10.0)))
        .expect(1)
        .mount(&agent)
        .await;

    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let target = add_target(storage.as_ref(), "alpha", &agent.uri()).await;

    assert!(ingestor(storage).ingest_safely(target.id).await.is_some());
}

#[tokio::test]
async fn test_failed_poll_leaves_no_trace() {
    let agent = MockServer::start().await;
    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let target = add_target(storage.as_ref(), "alpha", &agent.uri()).await;
    let ingestor = ingestor(Arc::clone(&storage));

    Mock::given(method("GET"))
        .and(path("/metrics"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&agent)
        .await;
    assert!(ingestor.ingest_safely(target.id).await.is_none());

    serve_metrics(&agent, json!({"status": "ok"})).await;
    assert!(ingestor.ingest_safely(target.id).await.is_none());

    assert!(storage.latest_snapshot(target.id).await.unwrap().is_none());
    let reloaded = storage.get_target(target.id).await.unwrap().unwrap();
    assert!(reloaded.last_seen_at.is_none());
}

#[tokio::test]
async fn test_unreachable_agent_is_absorbed() {
    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let target = add_target(storage.as_ref(), "alpha", "http://127.0.0.1:1").await;

    let client = AgentClient::new(Duration::from_millis(500)).unwrap();
    let ingestor = Ingestor::new(client, Arc::clone(&storage), Retention::default());

    assert!(ingestor.ingest_safely(target.id).await.is_none());
}

#[tokio::test]
async fn test_inactive_and_unknown_targets_are_skipped() {
    let agent = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/metrics"))
        .respond_with(ResponseTemplate::new(200).set_body_json(metrics_json(10.0, 10.0)))
        .expect(0)
        .mount(&agent)
        .await;

    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let target = add_target(storage.as_ref(), "alpha", &agent.uri()).await;
    storage.set_target_active(target.id, false).await.unwrap();

    let ingestor = ingestor(Arc::clone(&storage));
    assert!(ingestor.ingest_safely(target.id).await.is_none());
    assert!(ingestor.ingest_safely(target.id + 100).await.is_none());
}

#[tokio::test]
async fn test_retention_caps_snapshots_per_target() {
    let agent = MockServer::start().await;
    serve_metrics(&agent, metrics_json(10.0, 10.0)).await;

    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let target = add_target(storage.as_ref(), "alpha", &agent.uri()).await;

    let client = AgentClient::new(Duration::from_secs(2)).unwrap();
    let retention = Retention::new(chrono::Duration::hours(1), Some(2));
    let ingestor = Ingestor::new(client, Arc::clone(&storage), retention);

    for _ in 0..4 {
        assert!(ingestor.ingest_safely(target.id).await.is_some());
    }

    assert_eq!(storage.snapshots(target.id, 10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_threshold_update_rewrites_latest_warnings() {
    let agent = MockServer::start().await;
    serve_metrics(&agent, metrics_json(85.0, 10.0)).await;

    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let target = add_target(storage.as_ref(), "alpha", &agent.uri()).await;
    let ingestor = ingestor(Arc::clone(&storage));

    let stored = ingestor.ingest_safely(target.id).await.unwrap();
    assert!(stored.warnings.is_empty());

    let thresholds = backend_monitor::thresholds::Thresholds {
        ram_used_percent: Some(80.0),
        ..Default::default()
    };
    let rewritten = ingestor.update_thresholds(thresholds).await.unwrap();
    assert_eq!(rewritten, 1);

    let latest = storage.latest_snapshot(target.id).await.unwrap().unwrap();
    assert_eq!(latest.warnings, vec!["High RAM usage 85.0%".to_string()]);
    let reloaded = storage.get_target(target.id).await.unwrap().unwrap();
    assert!(reloaded.has_active_warning());
}
