//! Integration tests for the read-only HTTP API
//!
//! Requests go straight into the router, no socket is bound.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header::AUTHORIZATION},
};
use backend_monitor::{
    actors::SchedulerHandle,
    api::{ApiState, router},
    storage::{MemoryBackend, StorageBackend, Target},
    tiles::{LivenessCache, LivenessProbe, MetricSelector, TileDefinition, TileEngine},
};
use pretty_assertions::assert_eq;
use serde_json::Value;
use tower::ServiceExt;
use wiremock::MockServer;

use crate::helpers::*;

struct TestApi {
    app: Router,
    storage: Arc<dyn StorageBackend>,
    scheduler: SchedulerHandle,
    target: Target,
    _agent: MockServer,
}

async fn setup(token: Option<&str>) -> TestApi {
    let agent = MockServer::start().await;
    serve_metrics(&agent, metrics_json(93.0, 40.0)).await;

    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let target = add_target(storage.as_ref(), "alpha", &agent.uri()).await;

    let ingestor = Arc::new(ingestor(Arc::clone(&storage)));
    let scheduler = SchedulerHandle::spawn(Arc::clone(&ingestor), Duration::from_secs(30));

    let probe: Arc<dyn LivenessProbe> = Arc::new(ScriptedProbe::reachable(Duration::from_millis(2)));
    let liveness = Arc::new(LivenessCache::new(probe, Duration::from_secs(1)));
    let tiles = Arc::new(TileEngine::new(Arc::clone(&storage), liveness));

    let definitions = vec![
        TileDefinition {
            id: "ram".to_string(),
            target_id: target.id,
            label: "RAM".to_string(),
            selector: MetricSelector::RamUsedPercent,
            mount_path: None,
            warning_threshold: Some(80.0),
            critical_threshold: Some(90.0),
            ping_endpoint: None,
            ping_interval_seconds: 60,
            display_order: 2,
        }
        .validate()
        .unwrap(),
        TileDefinition {
            id: "latency".to_string(),
            target_id: target.id,
            label: "Latency".to_string(),
            selector: MetricSelector::PingDelayMs,
            mount_path: None,
            warning_threshold: Some(100.0),
            critical_threshold: Some(500.0),
            ping_endpoint: Some("10.0.0.1".to_string()),
            ping_interval_seconds: 60,
            display_order: 1,
        }
        .validate()
        .unwrap(),
    ];

    let state = ApiState::new(Arc::clone(&storage), scheduler.clone(), tiles, definitions);
    let app = router(state, token.map(str::to_string));

    // Poll once up front so the snapshot exists whatever the scheduler timing
    ingestor.ingest_safely(target.id).await;

    TestApi {
        app,
        storage,
        scheduler,
        target,
        _agent: agent,
    }
}

async fn get(app: &Router, uri: &str, token: Option<&str>) -> (StatusCode, Value) {
    let mut request = Request::builder().uri(uri);
    if let Some(token) = token {
        request = request.header(AUTHORIZATION, format!("Bearer {token}"));
    }
    let response = app
        .clone()
        .oneshot(request.body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn test_health_reports_storage() {
    let api = setup(None).await;

    let (status, body) = get(&api.app, "/api/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(body["storage"].is_object());

    api.scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_targets_never_expose_token() {
    let api = setup(None).await;

    let (status, body) = get(&api.app, "/api/v1/targets", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);

    let target = &body["targets"][0];
    assert_eq!(target["name"], "alpha");
    assert_eq!(target["last_warning"], "High RAM usage 93.0%");
    assert!(target.get("api_token").is_none());
    assert!(!body.to_string().contains(AGENT_TOKEN));

    api.scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_targets_listed_when_scheduler_is_stopped() {
    let api = setup(None).await;
    api.scheduler.shutdown().await.unwrap();

    let (status, body) = get(&api.app, "/api/v1/targets", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert!(body["targets"][0].get("schedule").is_none());
}

#[tokio::test]
async fn test_latest_snapshot() {
    let api = setup(None).await;

    let uri = format!("/api/v1/targets/{}/latest", api.target.id);
    let (status, body) = get(&api.app, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["target_id"], api.target.id);
    assert_eq!(body["snapshot"]["ram_used_percent"], 93.0);

    let (status, body) = get(&api.app, "/api/v1/targets/9999/latest", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());

    api.scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_latest_snapshot_missing_for_new_target() {
    let api = setup(None).await;
    let fresh = add_target(api.storage.as_ref(), "beta", "http://127.0.0.1:1").await;

    let uri = format!("/api/v1/targets/{}/latest", fresh.id);
    let (status, _) = get(&api.app, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    api.scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_tiles_in_display_order() {
    let api = setup(None).await;

    let (status, body) = get(&api.app, "/api/v1/tiles", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);

    let tiles = body["tiles"].as_array().unwrap();
    assert_eq!(tiles[0]["id"], "latency");
    assert_eq!(tiles[0]["status"], "ok");
    assert_eq!(tiles[1]["id"], "ram");
    assert_eq!(tiles[1]["display_value"], "93%");
    assert_eq!(tiles[1]["status"], "critical");

    api.scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_bearer_token_required_when_configured() {
    let api = setup(Some("hub-secret")).await;

    let (status, _) = get(&api.app, "/api/v1/health", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = get(&api.app, "/api/v1/health", Some("wrong")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = get(&api.app, "/api/v1/health", Some("hub-secret")).await;
    assert_eq!(status, StatusCode::OK);

    api.scheduler.shutdown().await.unwrap();
}
