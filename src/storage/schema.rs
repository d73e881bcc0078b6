//! Stored records: targets, snapshot rows and retention policy
//!
//! ## Snapshot layout
//!
//! A `SnapshotRow` flattens the agent payload into typed columns for the
//! values the evaluator and the tile engine read, keeps list-shaped values
//! (mounts, network counters, disk temperatures) as JSON, and carries the
//! untouched agent body in `raw_payload`.
//!
//! Rows are immutable once written except for `warnings`, which a threshold
//! change may rewrite on the newest row of each target.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{CpuLoad, DiskTemperature, MetricsPayload, MountedVolume, NetworkCounter, SnapshotView};

/// Floor applied to every poll interval.
pub const MIN_POLL_INTERVAL_SECONDS: u64 = 30;

pub const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 60;

/// One year.
pub const MAX_POLL_INTERVAL_SECONDS: u64 = 365 * 24 * 60 * 60;

pub const DEFAULT_RETENTION_DAYS: i64 = 7;
pub const MAX_RETENTION_DAYS: i64 = 90;

/// A monitored agent as persisted by the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub id: i64,
    pub name: String,
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_token: String,
    pub is_active: bool,
    pub poll_interval_seconds: u64,
    pub display_order: i64,
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Current warnings joined with `"; "`, or `None` when healthy.
    pub last_warning: Option<String>,
}

impl Target {
    pub fn has_active_warning(&self) -> bool {
        self.last_warning
            .as_deref()
            .is_some_and(|warning| !warning.trim().is_empty())
    }

    pub fn schedule(&self) -> TargetSchedule {
        TargetSchedule {
            id: self.id,
            poll_interval_seconds: self.poll_interval_seconds,
            last_seen_at: self.last_seen_at,
        }
    }
}

/// Configuration-owned fields of a target, used to create or update one.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetUpsert {
    pub name: String,
    pub base_url: String,
    pub api_token: String,
    pub is_active: bool,
    pub poll_interval_seconds: u64,
    pub display_order: i64,
}

/// The part of a target the scheduler needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetSchedule {
    pub id: i64,
    pub poll_interval_seconds: u64,
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// One persisted metrics reading of one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRow {
    /// Assigned by the backend on insert; `0` before that.
    pub id: i64,
    pub target_id: i64,
    pub reported_at: DateTime<Utc>,
    pub cpu_temperature_c: Option<f64>,
    pub ram_used_percent: Option<f64>,
    pub total_ram_gb: Option<f64>,
    pub disk_usage_percent: Option<f64>,
    pub mounted_usage: Vec<MountedVolume>,
    pub cpu_load: Option<CpuLoad>,
    pub network_counters: Vec<NetworkCounter>,
    pub disk_temperatures: Vec<DiskTemperature>,
    pub backend_version: Option<String>,
    pub os_version: Option<String>,
    pub uptime_seconds: Option<u64>,
    pub warnings: Vec<String>,
    pub raw_payload: Value,
}

impl SnapshotRow {
    /// Build an unsaved row from a decoded agent payload.
    pub fn from_payload(
        target_id: i64,
        payload: &MetricsPayload,
        warnings: Vec<String>,
        raw_payload: Value,
    ) -> Self {
        Self {
            id: 0,
            target_id,
            reported_at: payload.reported_at,
            cpu_temperature_c: payload.cpu_temperature_c,
            ram_used_percent: payload.ram_used_percent,
            total_ram_gb: payload.total_ram_gb,
            disk_usage_percent: payload.disk_usage_percent,
            mounted_usage: payload.mounted_usage.clone(),
            cpu_load: payload.cpu_load,
            network_counters: payload.network_counters.clone(),
            disk_temperatures: payload.disk_temperatures.clone(),
            backend_version: payload.backend_version.clone(),
            os_version: payload.os_version.clone(),
            uptime_seconds: payload.uptime_seconds,
            warnings,
            raw_payload,
        }
    }
}

impl SnapshotView for SnapshotRow {
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

/// Everything a successful poll writes, committed as one unit.
#[derive(Debug, Clone)]
pub struct IngestionRecord {
    pub snapshot: SnapshotRow,
    pub seen_at: DateTime<Utc>,
    pub last_warning: Option<String>,
    pub retention: Retention,
}

/// How much snapshot history to keep per target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub max_age: Duration,
    pub max_count: Option<usize>,
}

impl Retention {
    pub fn new(max_age: Duration, max_count: Option<usize>) -> Self {
        Self { max_age, max_count }
    }

    /// Day based retention, clamped to `1..=90` days.
    pub fn from_days(days: i64, max_count: Option<usize>) -> Self {
        Self::new(
            Duration::days(days.clamp(1, MAX_RETENTION_DAYS)),
            max_count,
        )
    }

    /// Entries reported before this instant are expired.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.max_age
    }
}

impl Default for Retention {
    fn default() -> Self {
        Self::from_days(DEFAULT_RETENTION_DAYS, None)
    }
}

/// Join warnings into the single-line summary stored on a target.
pub fn warning_summary(warnings: &[String]) -> Option<String> {
    if warnings.is_empty() {
        None
    } else {
        Some(warnings.join("; "))
    }
}
