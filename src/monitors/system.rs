//! Local metrics collection for the agent, backed by `sysinfo`.
//!
//! When the agent runs in a container the host filesystem is usually mounted
//! under a host root (e.g. `/hostfs`). Mount points below that root are
//! reported with the prefix removed, so `/hostfs/data` shows up as `/data`.

use std::path::Path;

use chrono::Utc;
use sysinfo::{Components, Disks, Networks, System};
use tracing::{instrument, trace};

use crate::thresholds::{Thresholds, evaluate};
use crate::{CpuLoad, DiskTemperature, MetricsPayload, MountedVolume, NetworkCounter};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Sensor labels that belong to the CPU package.
const CPU_SENSORS: [&str; 5] = ["coretemp", "k10temp", "cpu", "soc", "package"];

/// Sensor labels that belong to drives.
const DRIVE_SENSORS: [&str; 4] = ["nvme", "drivetemp", "sata", "disk"];

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn normalize_mount_path(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.is_empty() || trimmed == "/" {
        return "/".to_string();
    }
    let stripped = trimmed.trim_end_matches('/');
    if stripped.is_empty() {
        "/".to_string()
    } else {
        stripped.to_string()
    }
}

/// Mount point as seen from the host.
pub fn translate_mount(mount: &str, host_root: &Path) -> String {
    let mount = normalize_mount_path(mount);
    let root = normalize_mount_path(&host_root.to_string_lossy());
    if root == "/" {
        return mount;
    }

    match mount.strip_prefix(&root) {
        Some("") => "/".to_string(),
        Some(rest) if rest.starts_with('/') => normalize_mount_path(rest),
        _ => mount,
    }
}

fn average(values: impl Iterator<Item = f32>) -> Option<f64> {
    let (sum, count) = values
        .filter(|value| value.is_finite())
        .fold((0.0_f64, 0_usize), |(sum, count), value| (sum + value as f64, count + 1));
    (count > 0).then(|| sum / count as f64)
}

fn label_matches(label: &str, hints: &[&str]) -> bool {
    let label = label.to_lowercase();
    hints.iter().any(|hint| label.contains(hint))
}

fn cpu_temperature(components: &Components) -> Option<f64> {
    let cpu = average(
        components
            .iter()
            .filter(|component| label_matches(component.label(), &CPU_SENSORS))
            .filter_map(|component| component.temperature()),
    );
    cpu.or_else(|| average(components.iter().filter_map(|component| component.temperature())))
}

fn disk_temperatures(components: &Components) -> Vec<DiskTemperature> {
    components
        .iter()
        .filter(|component| label_matches(component.label(), &DRIVE_SENSORS))
        .map(|component| DiskTemperature {
            device: component.label().to_string(),
            temperature_c: component.temperature().map(|t| round2(t as f64)),
        })
        .collect()
}

fn mounted_usage(disks: &Disks, host_root: &Path) -> Vec<MountedVolume> {
    let mut volumes: Vec<MountedVolume> = Vec::new();

    for disk in disks.list() {
        let total = disk.total_space();
        if total == 0 {
            continue;
        }
        let mount = translate_mount(&disk.mount_point().to_string_lossy(), host_root);
        if volumes
            .iter()
            .any(|volume| volume.mount_point.as_deref() == Some(mount.as_str()))
        {
            continue;
        }

        let used = total.saturating_sub(disk.available_space());
        volumes.push(MountedVolume {
            mount_point: Some(mount),
            total_gb: Some(round2(total as f64 / GIB)),
            used_percent: Some(round2(used as f64 / total as f64 * 100.0)),
        });
    }

    volumes
}

fn network_counters(networks: &Networks) -> Vec<NetworkCounter> {
    let mut counters: Vec<NetworkCounter> = networks
        .iter()
        .map(|(name, data)| NetworkCounter {
            interface: name.clone(),
            bytes_sent: Some(data.total_transmitted() as f64),
            bytes_recv: Some(data.total_received() as f64),
        })
        .collect();
    counters.sort_by(|a, b| a.interface.cmp(&b.interface));
    counters
}

/// Read the local system once. Blocks for the sysinfo refresh interval.
#[instrument]
pub fn collect_metrics(host_root: &Path) -> MetricsPayload {
    let mut sys = System::new_all();
    sys.refresh_all();

    let components = Components::new_with_refreshed_list();
    let disks = Disks::new_with_refreshed_list();
    let networks = Networks::new_with_refreshed_list();

    let total_memory = sys.total_memory();
    let ram_used_percent = (total_memory > 0)
        .then(|| round2(sys.used_memory() as f64 / total_memory as f64 * 100.0));

    let mounted_usage = mounted_usage(&disks, host_root);
    let disk_usage_percent = mounted_usage
        .iter()
        .find(|volume| volume.mount_point.as_deref() == Some("/"))
        .and_then(|volume| volume.used_percent);
    let configured_mounts = mounted_usage
        .iter()
        .filter_map(|volume| volume.mount_point.clone())
        .collect();

    let load = System::load_average();

    let mut payload = MetricsPayload {
        reported_at: Utc::now(),
        hostname: System::host_name(),
        backend_version: Some(env!("CARGO_PKG_VERSION").to_string()),
        cpu_temperature_c: cpu_temperature(&components).map(round2),
        ram_used_percent,
        total_ram_gb: Some(round2(total_memory as f64 / GIB)),
        disk_usage_percent,
        mounted_usage,
        cpu_load: Some(CpuLoad {
            one: Some(load.one),
            five: Some(load.five),
            fifteen: Some(load.fifteen),
        }),
        network_counters: network_counters(&networks),
        disk_temperatures: disk_temperatures(&components),
        os_version: System::long_os_version(),
        uptime_seconds: Some(System::uptime()),
        warnings: Vec::new(),
        configured_mounts,
    };
    payload.warnings = evaluate(&payload, &Thresholds::default());

    trace!("collected metrics with {} warnings", payload.warnings.len());
    payload
}
