//! Integration tests for the SQLite backend underneath the pipeline.

use std::sync::Arc;

use backend_monitor::{
    config::parse_config,
    storage::{StorageBackend, sqlite::SqliteBackend},
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use wiremock::MockServer;

use crate::helpers::*;

async fn open(dir: &TempDir) -> SqliteBackend {
    SqliteBackend::new(dir.path().join("monitor.db"))
        .await
        .expect("database should open")
}

#[tokio::test]
async fn test_ingestion_repairs_dropped_column() {
    let dir = tempfile::tempdir().unwrap();
    let backend = open(&dir).await;
    sqlx::query("ALTER TABLE metric_snapshots DROP COLUMN backend_version")
        .execute(backend.pool())
        .await
        .unwrap();

    let agent = MockServer::start().await;
    serve_metrics(&agent, metrics_json(30.0, 40.0)).await;

    let storage: Arc<dyn StorageBackend> = Arc::new(backend);
    let target = add_target(storage.as_ref(), "alpha", &agent.uri()).await;

    let stored = ingestor(Arc::clone(&storage))
        .ingest_safely(target.id)
        .await
        .expect("ingestion should succeed after repair");

    assert_eq!(stored.backend_version.as_deref(), Some("0.3.0"));
    assert!(storage.repair_schema().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_snapshots_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let agent = MockServer::start().await;
    serve_metrics(&agent, metrics_json(91.0, 40.0)).await;

    let target_id = {
        let storage: Arc<dyn StorageBackend> = Arc::new(open(&dir).await);
        let target = add_target(storage.as_ref(), "alpha", &agent.uri()).await;
        ingestor(Arc::clone(&storage))
            .ingest_safely(target.id)
            .await
            .expect("ingestion should succeed");
        storage.close().await.unwrap();
        target.id
    };

    let reopened = open(&dir).await;
    let target = reopened.get_target(target_id).await.unwrap().unwrap();
    assert!(target.last_seen_at.is_some());
    assert_eq!(target.last_warning.as_deref(), Some("High RAM usage 91.0%"));

    let latest = reopened.latest_snapshot(target_id).await.unwrap().unwrap();
    assert_eq!(latest.ram_used_percent, Some(91.0));
    assert_eq!(latest.mounted_usage[0].mount_point.as_deref(), Some("/data"));
    assert_eq!(latest.cpu_load.and_then(|load| load.five), Some(0.4));
}

#[tokio::test]
async fn test_config_sync_keeps_ids_and_deactivates_removed_targets() {
    let dir = tempfile::tempdir().unwrap();
    let backend = open(&dir).await;

    let first = parse_config(
        r#"{
            "targets": [
                {"name": "alpha", "url": "http://alpha:8080", "token": "a"},
                {"name": "beta", "url": "http://beta:8080", "token": "b", "interval_seconds": 120}
            ]
        }"#,
    )
    .unwrap();
    let ids = first.sync_targets(&backend).await.unwrap();
    assert_eq!(ids.len(), 2);

    let second = parse_config(
        r#"{"targets": [{"name": "alpha", "url": "http://alpha:9090", "token": "a"}]}"#,
    )
    .unwrap();
    let ids_again = second.sync_targets(&backend).await.unwrap();
    assert_eq!(ids_again["alpha"], ids["alpha"]);

    let alpha = backend.get_target(ids["alpha"]).await.unwrap().unwrap();
    assert_eq!(alpha.base_url, "http://alpha:9090");
    let beta = backend.get_target(ids["beta"]).await.unwrap().unwrap();
    assert!(!beta.is_active);

    let scheduled: Vec<i64> = backend
        .list_active_schedules()
        .await
        .unwrap()
        .into_iter()
        .map(|schedule| schedule.id)
        .collect();
    assert_eq!(scheduled, vec![ids["alpha"]]);
}
