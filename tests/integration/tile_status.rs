//! Integration tests for tile views built from ingested snapshots and
//! liveness checks.

use std::sync::Arc;
use std::time::Duration;

use backend_monitor::{
    config::parse_config,
    storage::{MemoryBackend, StorageBackend},
    tiles::{LivenessCache, LivenessProbe, MetricSelector, TileEngine, TileStatus},
};
use pretty_assertions::assert_eq;
use wiremock::MockServer;

use crate::helpers::*;

const CONFIG: &str = r#"{
    "targets": [{"name": "alpha", "url": "AGENT_URL", "token": "agent-token"}],
    "tiles": [
        {"id": "data", "target": "alpha", "label": "Data volume", "selector": "mount_used_percent",
         "mount_path": "/data", "warning_threshold": 85, "critical_threshold": 95, "display_order": 2},
        {"id": "ram", "target": "alpha", "label": "RAM", "selector": "ram_used_percent",
         "warning_threshold": 80, "critical_threshold": 90, "display_order": 1},
        {"id": "uptime", "target": "alpha", "label": "Up since", "selector": "last_restart",
         "warning_threshold": 1, "critical_threshold": 0.5, "display_order": 3},
        {"id": "gateway", "target": "alpha", "label": "Gateway", "selector": "ping_result",
         "ping_endpoint": "10.0.0.1", "ping_interval_seconds": 60, "display_order": 4}
    ]
}"#;

#[tokio::test]
async fn test_tiles_reflect_latest_snapshot() {
    let agent = MockServer::start().await;
    serve_metrics(&agent, metrics_json(50.0, 92.0)).await;

    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let config = parse_config(&CONFIG.replace("AGENT_URL", &agent.uri())).unwrap();
    let ids = config.sync_targets(storage.as_ref()).await.unwrap();
    let definitions = config.tile_definitions(&ids).unwrap();

    ingestor(Arc::clone(&storage))
        .ingest_safely(ids["alpha"])
        .await
        .expect("ingestion should succeed");

    let probe = Arc::new(ScriptedProbe::reachable(Duration::from_millis(3)));
    let dyn_probe: Arc<dyn LivenessProbe> = probe.clone();
    let liveness = Arc::new(LivenessCache::new(dyn_probe, Duration::from_secs(1)));
    let engine = TileEngine::new(Arc::clone(&storage), liveness);

    let tiles = engine.build_tiles(&definitions).await.unwrap();
    let ids: Vec<&str> = tiles.iter().map(|tile| tile.id.as_str()).collect();
    assert_eq!(ids, vec!["data", "ram", "uptime", "gateway"]);

    assert_eq!(tiles[0].display_value, "92%");
    assert_eq!(tiles[0].status, TileStatus::Warn);
    assert_eq!(tiles[0].target_name, "alpha");

    assert_eq!(tiles[1].display_value, "50%");
    assert_eq!(tiles[1].status, TileStatus::Ok);

    // 93600 s of uptime
    assert_eq!(tiles[2].selector, MetricSelector::LastRestart);
    assert_eq!(tiles[2].display_value, "1d 2h");
    assert_eq!(tiles[2].status, TileStatus::Ok);

    assert_eq!(tiles[3].display_value, "OK");
    assert_eq!(tiles[3].status, TileStatus::Ok);

    // A second request inside the ping interval reuses the cached result
    engine.build_tiles(&definitions).await.unwrap();
    assert_eq!(probe.probes(), 1);
}

#[tokio::test]
async fn test_tiles_without_data_are_unknown() {
    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let config = parse_config(&CONFIG.replace("AGENT_URL", "http://127.0.0.1:1")).unwrap();
    let ids = config.sync_targets(storage.as_ref()).await.unwrap();
    let definitions = config.tile_definitions(&ids).unwrap();

    let probe: Arc<dyn LivenessProbe> = Arc::new(ScriptedProbe::unreachable());
    let liveness = Arc::new(LivenessCache::new(probe, Duration::from_secs(1)));
    let engine = TileEngine::new(Arc::clone(&storage), liveness);

    let tiles = engine.build_tiles(&definitions).await.unwrap();
    for tile in &tiles[..3] {
        assert_eq!(tile.status, TileStatus::Unknown, "tile {}", tile.id);
        assert_eq!(tile.display_value, "—");
        assert!(tile.reported_at.is_none());
    }

    assert_eq!(tiles[3].display_value, "NOK");
    assert_eq!(tiles[3].status, TileStatus::Critical);
}
