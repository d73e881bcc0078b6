//! Threshold evaluation
//!
//! Turns one snapshot into the ordered list of human readable warnings the
//! hub stores, summarises on the target, and forwards to notifiers.
//!
//! Order is fixed: CPU temperature, RAM, root disk, then one entry per
//! mounted volume in the order the agent reported them.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::SnapshotView;
use crate::config::ConfigError;
use crate::storage::{StorageBackend, StorageResult, warning_summary};

pub const DEFAULT_CPU_TEMPERATURE_C: f64 = 80.0;
pub const DEFAULT_RAM_USED_PERCENT: f64 = 90.0;
pub const DEFAULT_DISK_USAGE_PERCENT: f64 = 90.0;

/// Alert limits. Unset limits fall back to the defaults above; an unset
/// mount limit falls back to the resolved disk limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(default)]
    pub cpu_temperature_c: Option<f64>,
    #[serde(default)]
    pub ram_used_percent: Option<f64>,
    #[serde(default)]
    pub disk_usage_percent: Option<f64>,
    #[serde(default)]
    pub mounted_usage_percent: Option<f64>,
}

impl Thresholds {
    pub fn cpu_limit(&self) -> f64 {
        self.cpu_temperature_c.unwrap_or(DEFAULT_CPU_TEMPERATURE_C)
    }

    pub fn ram_limit(&self) -> f64 {
        self.ram_used_percent.unwrap_or(DEFAULT_RAM_USED_PERCENT)
    }

    pub fn disk_limit(&self) -> f64 {
        self.disk_usage_percent.unwrap_or(DEFAULT_DISK_USAGE_PERCENT)
    }

    pub fn mount_limit(&self) -> f64 {
        self.mounted_usage_percent.unwrap_or_else(|| self.disk_limit())
    }

    /// CPU temperature must lie in `0..=150`, percentages in `0..=100`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("cpu_temperature_c", self.cpu_temperature_c, 150.0),
            ("ram_used_percent", self.ram_used_percent, 100.0),
            ("disk_usage_percent", self.disk_usage_percent, 100.0),
            ("mounted_usage_percent", self.mounted_usage_percent, 100.0),
        ];

        for (name, value, max) in checks {
            if let Some(value) = value.filter(|v| !(0.0..=max).contains(v)) {
                return Err(ConfigError::ThresholdOutOfRange {
                    name: name.to_string(),
                    value,
                    max,
                });
            }
        }
        Ok(())
    }
}

/// Warnings for one snapshot, in evaluation order. Missing values are skipped.
pub fn evaluate<S: SnapshotView + ?Sized>(snapshot: &S, thresholds: &Thresholds) -> Vec<String> {
    let mut warnings = Vec::new();

    let cpu_limit = thresholds.cpu_limit();
    if let Some(temperature) = snapshot.cpu_temperature_c().filter(|t| *t >= cpu_limit) {
        warnings.push(format!("High CPU temperature {temperature:.1}°C"));
    }

    let ram_limit = thresholds.ram_limit();
    if let Some(ram) = snapshot.ram_used_percent().filter(|r| *r >= ram_limit) {
        warnings.push(format!("High RAM usage {ram:.1}%"));
    }

    let disk_limit = thresholds.disk_limit();
    if let Some(disk) = snapshot.disk_usage_percent().filter(|d| *d >= disk_limit) {
        warnings.push(format!("Disk usage critical at {disk:.1}%"));
    }

    let mount_limit = thresholds.mount_limit();
    for volume in snapshot.mounted_usage() {
        if let Some(used) = volume.used_percent.filter(|u| *u >= mount_limit) {
            let label = volume.mount_point.as_deref().unwrap_or("mount");
            warnings.push(format!("{label} usage critical at {used:.1}%"));
        }
    }

    warnings
}

/// Re-evaluate the newest snapshot of every target against `thresholds`.
///
/// Rewrites the snapshot's warnings and the target's summary. Older
/// snapshots keep the warnings they were stored with. Returns the number of
/// snapshots rewritten.
pub async fn recalculate_latest_warnings(
    storage: &dyn StorageBackend,
    thresholds: &Thresholds,
) -> StorageResult<usize> {
    let targets = storage.list_targets().await?;
    let ids: Vec<i64> = targets.iter().map(|target| target.id).collect();
    let latest = storage.latest_snapshots(&ids).await?;

    let mut rewritten = 0;
    for target in &targets {
        let Some(snapshot) = latest.get(&target.id) else {
            continue;
        };

        let warnings = evaluate(snapshot, thresholds);
        storage
            .update_snapshot_warnings(snapshot.id, &warnings)
            .await?;
        storage
            .update_target_warning(target.id, warning_summary(&warnings).as_deref())
            .await?;

        debug!(
            "target {} now has {} warnings after recalculation",
            target.name,
            warnings.len()
        );
        rewritten += 1;
    }

    info!("recalculated warnings for {} targets", rewritten);
    Ok(rewritten)
}
