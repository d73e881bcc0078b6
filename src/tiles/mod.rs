//! Status tiles
//!
//! A tile condenses one metric of one target into a value, a short display
//! string and a status. Metric tiles read the target's newest snapshot;
//! liveness tiles (`ping_result`, `ping_delay_ms`) ignore snapshots and use
//! the `LivenessCache` instead.

pub mod liveness;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{instrument, trace};

use crate::SnapshotView;
use crate::storage::{SnapshotRow, StorageBackend, StorageResult};

pub use liveness::{
    LivenessCache, LivenessProbe, LivenessResult, PingProbe, ProbeError, TcpConnectProbe,
};

pub const DEFAULT_PING_INTERVAL_SECONDS: u64 = 60;
pub const MIN_PING_INTERVAL_SECONDS: u64 = 5;
pub const MAX_PING_INTERVAL_SECONDS: u64 = 86_400;
pub const MAX_LABEL_CHARS: usize = 120;

/// Shown when a tile has no value.
pub const NO_VALUE: &str = "—";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricSelector {
    DiskUsagePercent,
    RamUsedPercent,
    CpuTemperatureC,
    CpuLoadOne,
    CpuLoadFive,
    CpuLoadFifteen,
    MountUsedPercent,
    /// Hours since the last restart
    LastRestart,
    PingResult,
    PingDelayMs,
}

impl MetricSelector {
    pub fn is_liveness(self) -> bool {
        matches!(self, Self::PingResult | Self::PingDelayMs)
    }

    /// Small values are bad, large values are fine.
    pub fn lower_is_worse(self) -> bool {
        matches!(self, Self::LastRestart)
    }

    fn is_percentage(self) -> bool {
        matches!(
            self,
            Self::DiskUsagePercent | Self::RamUsedPercent | Self::MountUsedPercent
        )
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum TileConfigError {
    #[error("label must have between 1 and 120 characters")]
    InvalidLabel,

    #[error("thresholds must not be negative")]
    NegativeThreshold,

    #[error("warning and critical thresholds are required")]
    MissingThreshold,

    #[error("warning threshold must be {expected} than the critical threshold")]
    ThresholdOrder { expected: &'static str },

    #[error("ping_endpoint is required for ping tiles")]
    MissingPingEndpoint,

    #[error("ping interval {0}s is outside 5..=86400")]
    PingIntervalOutOfRange(u64),

    #[error("mount_path is required for mounted usage tiles")]
    MissingMountPath,
}

/// A validated tile.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TileDefinition {
    pub id: String,
    pub target_id: i64,
    pub label: String,
    pub selector: MetricSelector,
    pub mount_path: Option<String>,
    pub warning_threshold: Option<f64>,
    pub critical_threshold: Option<f64>,
    pub ping_endpoint: Option<String>,
    pub ping_interval_seconds: u64,
    pub display_order: i64,
}

fn blank(value: &Option<String>) -> bool {
    value.as_deref().is_none_or(|v| v.trim().is_empty())
}

impl TileDefinition {
    /// Check the definition and normalize fields that do not apply to its
    /// selector.
    pub fn validate(mut self) -> Result<Self, TileConfigError> {
        let label_chars = self.label.trim().chars().count();
        if label_chars == 0 || label_chars > MAX_LABEL_CHARS {
            return Err(TileConfigError::InvalidLabel);
        }

        if self.selector.is_liveness() {
            if blank(&self.ping_endpoint) {
                return Err(TileConfigError::MissingPingEndpoint);
            }
            if !(MIN_PING_INTERVAL_SECONDS..=MAX_PING_INTERVAL_SECONDS)
                .contains(&self.ping_interval_seconds)
            {
                return Err(TileConfigError::PingIntervalOutOfRange(
                    self.ping_interval_seconds,
                ));
            }
        } else {
            self.ping_endpoint = None;
            self.ping_interval_seconds = DEFAULT_PING_INTERVAL_SECONDS;
        }

        if self.selector == MetricSelector::MountUsedPercent {
            if blank(&self.mount_path) {
                return Err(TileConfigError::MissingMountPath);
            }
        } else {
            self.mount_path = None;
        }

        if [self.warning_threshold, self.critical_threshold]
            .iter()
            .flatten()
            .any(|threshold| *threshold < 0.0)
        {
            return Err(TileConfigError::NegativeThreshold);
        }

        if self.selector != MetricSelector::PingResult {
            let (Some(warning), Some(critical)) = (self.warning_threshold, self.critical_threshold)
            else {
                return Err(TileConfigError::MissingThreshold);
            };

            if self.selector.lower_is_worse() {
                if warning <= critical {
                    return Err(TileConfigError::ThresholdOrder { expected: "greater" });
                }
            } else if warning >= critical {
                return Err(TileConfigError::ThresholdOrder { expected: "less" });
            }
        }

        Ok(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TileStatus {
    Ok,
    Warn,
    Critical,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TileView {
    pub id: String,
    pub target_id: i64,
    pub target_name: String,
    pub label: String,
    pub selector: MetricSelector,
    pub value: Option<f64>,
    pub display_value: String,
    pub status: TileStatus,
    pub reported_at: Option<DateTime<Utc>>,
}

/// Value of `selector` in `snapshot`. Liveness selectors have none.
pub fn metric_value<S: SnapshotView + ?Sized>(
    snapshot: &S,
    selector: MetricSelector,
    mount_path: Option<&str>,
) -> Option<f64> {
    match selector {
        MetricSelector::DiskUsagePercent => snapshot.disk_usage_percent(),
        MetricSelector::RamUsedPercent => snapshot.ram_used_percent(),
        MetricSelector::CpuTemperatureC => snapshot.cpu_temperature_c(),
        MetricSelector::CpuLoadOne => snapshot.cpu_load().and_then(|load| load.one),
        MetricSelector::CpuLoadFive => snapshot.cpu_load().and_then(|load| load.five),
        MetricSelector::CpuLoadFifteen => snapshot.cpu_load().and_then(|load| load.fifteen),
        MetricSelector::MountUsedPercent => {
            mount_path.and_then(|path| snapshot.mount_used_percent(path))
        }
        MetricSelector::LastRestart => snapshot
            .uptime_seconds()
            .map(|seconds| seconds as f64 / 3600.0),
        MetricSelector::PingResult | MetricSelector::PingDelayMs => None,
    }
}

pub fn format_value(selector: MetricSelector, value: Option<f64>) -> String {
    let Some(value) = value else {
        return NO_VALUE.to_string();
    };

    match selector {
        s if s.is_percentage() => format!("{value:.0}%"),
        MetricSelector::CpuTemperatureC => format!("{value:.1}C"),
        MetricSelector::LastRestart => format_uptime_hours(value),
        MetricSelector::PingDelayMs => format!("{value:.0}ms"),
        _ => format!("{value:.2}"),
    }
}

/// Compact duration: `Xd Yh`, `Yh Zm`, `Yh` or `Zm`.
pub fn format_uptime_hours(hours: f64) -> String {
    let total_minutes = (hours * 60.0).round().max(0.0) as u64;
    let days = total_minutes / 1440;
    let hours = (total_minutes % 1440) / 60;
    let minutes = total_minutes % 60;

    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 && minutes > 0 {
        format!("{hours}h {minutes}m")
    } else if hours > 0 {
        format!("{hours}h")
    } else {
        format!("{minutes}m")
    }
}

pub fn resolve_status(
    selector: MetricSelector,
    value: Option<f64>,
    warning: Option<f64>,
    critical: Option<f64>,
) -> TileStatus {
    let Some(value) = value else {
        return TileStatus::Unknown;
    };

    let reached = |threshold: Option<f64>| {
        threshold.is_some_and(|threshold| {
            if selector.lower_is_worse() {
                value <= threshold
            } else {
                value >= threshold
            }
        })
    };

    if reached(critical) {
        TileStatus::Critical
    } else if reached(warning) {
        TileStatus::Warn
    } else {
        TileStatus::Ok
    }
}

/// Builds tile views from stored snapshots and liveness checks.
pub struct TileEngine {
    storage: Arc<dyn StorageBackend>,
    liveness: Arc<LivenessCache>,
}

impl TileEngine {
    pub fn new(storage: Arc<dyn StorageBackend>, liveness: Arc<LivenessCache>) -> Self {
        Self { storage, liveness }
    }

    /// One view per definition, in definition order.
    #[instrument(skip(self, definitions), fields(tiles = definitions.len()))]
    pub async fn build_tiles(&self, definitions: &[TileDefinition]) -> StorageResult<Vec<TileView>> {
        if definitions.is_empty() {
            return Ok(Vec::new());
        }

        let mut target_ids: Vec<i64> = definitions
            .iter()
            .filter(|definition| !definition.selector.is_liveness())
            .map(|definition| definition.target_id)
            .collect();
        target_ids.sort_unstable();
        target_ids.dedup();

        let snapshots = if target_ids.is_empty() {
            HashMap::new()
        } else {
            self.storage.latest_snapshots(&target_ids).await?
        };
        let names: HashMap<i64, String> = self
            .storage
            .list_targets()
            .await?
            .into_iter()
            .map(|target| (target.id, target.name))
            .collect();

        trace!("{} snapshots for {} targets", snapshots.len(), target_ids.len());

        let now = Utc::now();
        let views = definitions.iter().map(|definition| {
            let target_name = names
                .get(&definition.target_id)
                .cloned()
                .unwrap_or_else(|| "Unknown".to_string());
            self.build_tile(
                definition,
                target_name,
                snapshots.get(&definition.target_id),
                now,
            )
        });

        Ok(join_all(views).await)
    }

    async fn build_tile(
        &self,
        definition: &TileDefinition,
        target_name: String,
        snapshot: Option<&SnapshotRow>,
        now: DateTime<Utc>,
    ) -> TileView {
        let mut view = TileView {
            id: definition.id.clone(),
            target_id: definition.target_id,
            target_name,
            label: definition.label.clone(),
            selector: definition.selector,
            value: None,
            display_value: NO_VALUE.to_string(),
            status: TileStatus::Unknown,
            reported_at: None,
        };

        if definition.selector.is_liveness() {
            if let Some(result) = self.liveness.check(definition, now).await {
                apply_liveness(&mut view, definition, &result);
            }
            return view;
        }

        if let Some(snapshot) = snapshot {
            view.value = metric_value(snapshot, definition.selector, definition.mount_path.as_deref());
            view.reported_at = Some(snapshot.reported_at);
        }
        view.display_value = format_value(definition.selector, view.value);
        view.status = resolve_status(
            definition.selector,
            view.value,
            definition.warning_threshold,
            definition.critical_threshold,
        );
        view
    }
}

fn apply_liveness(view: &mut TileView, definition: &TileDefinition, result: &LivenessResult) {
    view.reported_at = Some(result.checked_at);

    match definition.selector {
        MetricSelector::PingResult if result.success => {
            view.value = Some(1.0);
            view.display_value = "OK".to_string();
            view.status = TileStatus::Ok;
        }
        MetricSelector::PingResult => {
            view.value = Some(0.0);
            view.display_value = "NOK".to_string();
            view.status = TileStatus::Critical;
        }
        _ => match result.latency_ms.filter(|_| result.success) {
            Some(latency) => {
                view.value = Some(latency);
                view.display_value = format_value(definition.selector, view.value);
                view.status = resolve_status(
                    definition.selector,
                    view.value,
                    definition.warning_threshold,
                    definition.critical_threshold,
                );
            }
            None => {
                view.value = None;
                view.display_value = "timeout".to_string();
                view.status = TileStatus::Critical;
            }
        },
    }
}
