pub mod actors;
pub mod alerts;
#[cfg(feature = "api")]
pub mod api;
pub mod config;
pub mod discord;
pub mod ingest;
pub mod lenient;
pub mod monitors;
pub mod reboot;
pub mod storage;
pub mod thresholds;
pub mod tiles;
pub mod util;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Envelope returned by an agent's `GET /metrics` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricResponse {
    pub metrics: MetricsPayload,
}

/// One metrics reading as reported by an agent.
///
/// Numeric fields are decoded leniently: a value of the wrong JSON type is
/// treated as absent instead of rejecting the whole payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsPayload {
    #[serde(default = "Utc::now")]
    pub reported_at: DateTime<Utc>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub backend_version: Option<String>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub cpu_temperature_c: Option<f64>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub ram_used_percent: Option<f64>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub total_ram_gb: Option<f64>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub disk_usage_percent: Option<f64>,
    #[serde(default, deserialize_with = "lenient::list")]
    pub mounted_usage: Vec<MountedVolume>,
    #[serde(default, deserialize_with = "lenient::object")]
    pub cpu_load: Option<CpuLoad>,
    #[serde(default, deserialize_with = "lenient::list")]
    pub network_counters: Vec<NetworkCounter>,
    #[serde(default, deserialize_with = "lenient::list")]
    pub disk_temperatures: Vec<DiskTemperature>,
    #[serde(default)]
    pub os_version: Option<String>,
    #[serde(default, deserialize_with = "lenient::unsigned")]
    pub uptime_seconds: Option<u64>,
    #[serde(default, deserialize_with = "lenient::list")]
    pub warnings: Vec<String>,
    #[serde(default, deserialize_with = "lenient::list")]
    pub configured_mounts: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MountedVolume {
    #[serde(default)]
    pub mount_point: Option<String>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub total_gb: Option<f64>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub used_percent: Option<f64>,
}

/// Load averages over 1, 5 and 15 minutes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuLoad {
    #[serde(default, deserialize_with = "lenient::number")]
    pub one: Option<f64>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub five: Option<f64>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub fifteen: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkCounter {
    pub interface: String,
    #[serde(default, deserialize_with = "lenient::number")]
    pub bytes_sent: Option<f64>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub bytes_recv: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskTemperature {
    pub device: String,
    #[serde(default, deserialize_with = "lenient::number")]
    pub temperature_c: Option<f64>,
}

/// Read access to the fields of a metrics snapshot.
///
/// Implemented once per concrete representation (the agent payload and the
/// stored row) so the evaluator and the tile engine never care which one
/// they were handed.
pub trait SnapshotView {
    fn reported_at(&self) -> DateTime<Utc>;
    fn cpu_temperature_c(&self) -> Option<f64>;
    fn ram_used_percent(&self) -> Option<f64>;
    fn disk_usage_percent(&self) -> Option<f64>;
    fn mounted_usage(&self) -> &[MountedVolume];
    fn cpu_load(&self) -> Option<&CpuLoad>;
    fn uptime_seconds(&self) -> Option<u64>;

    /// Used percentage of the mount whose path matches `mount_path` exactly.
    fn mount_used_percent(&self, mount_path: &str) -> Option<f64> {
        self.mounted_usage()
            .iter()
            .find(|volume| volume.mount_point.as_deref() == Some(mount_path))
            .and_then(|volume| volume.used_percent)
    }
}

impl SnapshotView for MetricsPayload {
    fn reported_at(&self) -> DateTime<Utc> {
        self.reported_at
    }

    fn cpu_temperature_c(&self) -> Option<f64> {
        self.cpu_temperature_c
    }

    fn ram_used_percent(&self) -> Option<f64> {
        self.ram_used_percent
    }

    fn disk_usage_percent(&self) -> Option<f64> {
        self.disk_usage_percent
    }

    fn mounted_usage(&self) -> &[MountedVolume] {
        &self.mounted_usage
    }

    fn cpu_load(&self) -> Option<&CpuLoad> {
        self.cpu_load.as_ref()
    }

    fn uptime_seconds(&self) -> Option<u64> {
        self.uptime_seconds
    }
}
