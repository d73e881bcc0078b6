//! Shared fixtures: targets, mock agents, a recording notifier and a
//! scripted liveness probe.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use backend_monitor::{
    alerts::{Notifier, NotifyError, TargetSummary},
    ingest::{AgentClient, Ingestor},
    storage::{Retention, StorageBackend, Target, TargetUpsert},
    tiles::{LivenessProbe, ProbeError},
};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const AGENT_TOKEN: &str = "agent-token";

pub fn target_upsert(name: &str, base_url: &str, display_order: i64) -> TargetUpsert {
    TargetUpsert {
        name: name.to_string(),
        base_url: base_url.to_string(),
        api_token: AGENT_TOKEN.to_string(),
        is_active: true,
        poll_interval_seconds: 60,
        display_order,
    }
}

pub async fn add_target(storage: &dyn StorageBackend, name: &str, base_url: &str) -> Target {
    storage
        .upsert_target(target_upsert(name, base_url, 0))
        .await
        .expect("target upsert should succeed")
}

/// Agent response body with the given RAM usage and one `/data` mount.
pub fn metrics_json(ram_used_percent: f64, data_used_percent: f64) -> Value {
    json!({
        "metrics": {
            "hostname": "test-host",
            "backend_version": "0.3.0",
            "cpu_temperature_c": 45.5,
            "ram_used_percent": ram_used_percent,
            "total_ram_gb": 16.0,
            "disk_usage_percent": 40.0,
            "mounted_usage": [
                {"mount_point": "/data", "total_gb": 500.0, "used_percent": data_used_percent}
            ],
            "cpu_load": {"one": 0.5, "five": 0.4, "fifteen": 0.3},
            "uptime_seconds": 93600
        }
    })
}

/// Replace whatever the agent currently answers on `GET /metrics`.
pub async fn serve_metrics(server: &MockServer, body: Value) {
    server.reset().await;
    Mock::given(method("GET"))
        .and(path("/metrics"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

pub fn ingestor(storage: Arc<dyn StorageBackend>) -> Ingestor {
    let client = AgentClient::new(Duration::from_secs(2)).expect("client should build");
    Ingestor::new(client, storage, Retention::default())
}

/// Notifier that only counts and remembers what it was asked to send.
#[derive(Default)]
pub struct RecordingNotifier {
    calls: AtomicUsize,
    last: Mutex<Vec<TargetSummary>>,
}

impl RecordingNotifier {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn last_summaries(&self) -> Vec<TargetSummary> {
        self.last.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_warning_summary(&self, summaries: &[TargetSummary]) -> Result<(), NotifyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().await = summaries.to_vec();
        Ok(())
    }
}

/// Probe with a fixed answer that counts how often it ran.
pub struct ScriptedProbe {
    latency: Option<Duration>,
    probes: AtomicUsize,
}

impl ScriptedProbe {
    pub fn reachable(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            probes: AtomicUsize::new(0),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            latency: None,
            probes: AtomicUsize::new(0),
        }
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LivenessProbe for ScriptedProbe {
    async fn probe(&self, endpoint: &str, _timeout: Duration) -> Result<Duration, ProbeError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.latency
            .ok_or_else(|| ProbeError::Unreachable(endpoint.to_string()))
    }
}
