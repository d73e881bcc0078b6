use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{info, trace};

use crate::storage::schema::{
    DEFAULT_POLL_INTERVAL_SECONDS, DEFAULT_RETENTION_DAYS, MAX_POLL_INTERVAL_SECONDS, Retention,
    TargetUpsert,
};
use crate::storage::{StorageBackend, StorageResult};
use crate::thresholds::Thresholds;
use crate::tiles::{MetricSelector, TileConfigError, TileDefinition, DEFAULT_PING_INTERVAL_SECONDS};

pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 10;
pub const DEFAULT_TICK_SECONDS: u64 = 5;
pub const MAX_TICK_SECONDS: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("threshold {name} = {value} is outside 0..={max}")]
    ThresholdOutOfRange { name: String, value: f64, max: f64 },

    #[error("target {name}: poll interval {seconds}s exceeds {max}s")]
    IntervalOutOfRange { name: String, seconds: u64, max: u64 },

    #[error("target {0} is configured more than once")]
    DuplicateTarget(String),

    #[error("tile {tile} refers to unknown target {target}")]
    UnknownTileTarget { tile: String, target: String },

    #[error("tile {tile}: {source}")]
    InvalidTile {
        tile: String,
        #[source]
        source: TileConfigError,
    },
}

/// Hub configuration file.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub targets: Vec<TargetConfig>,

    #[serde(default)]
    pub thresholds: Thresholds,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    pub alert: Option<Alert>,

    #[serde(default)]
    pub liveness: LivenessConfig,

    #[serde(default)]
    pub tiles: Vec<TileConfig>,

    #[serde(default)]
    pub api: ApiConfig,
}

impl Config {
    /// Per-request timeout for agent fetches and liveness probes, at least 1 s.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds.max(1))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.thresholds.validate()?;

        let mut names = HashSet::new();
        for target in &self.targets {
            if !names.insert(target.name.as_str()) {
                return Err(ConfigError::DuplicateTarget(target.name.clone()));
            }
            if target.interval_seconds > MAX_POLL_INTERVAL_SECONDS {
                return Err(ConfigError::IntervalOutOfRange {
                    name: target.name.clone(),
                    seconds: target.interval_seconds,
                    max: MAX_POLL_INTERVAL_SECONDS,
                });
            }
        }

        for tile in &self.tiles {
            if !names.contains(tile.target.as_str()) {
                return Err(ConfigError::UnknownTileTarget {
                    tile: tile.id.clone(),
                    target: tile.target.clone(),
                });
            }
            tile.clone().into_definition(0)?;
        }

        Ok(())
    }

    /// Store every configured target and deactivate stored targets that are
    /// no longer configured. Returns the target ids by name.
    pub async fn sync_targets(
        &self,
        storage: &dyn StorageBackend,
    ) -> StorageResult<HashMap<String, i64>> {
        let mut ids = HashMap::new();
        for (position, target) in self.targets.iter().enumerate() {
            let stored = storage.upsert_target(target.to_upsert(position)).await?;
            ids.insert(stored.name, stored.id);
        }

        for stored in storage.list_targets().await? {
            if stored.is_active && !ids.contains_key(&stored.name) {
                info!("deactivating target {} missing from configuration", stored.name);
                storage.set_target_active(stored.id, false).await?;
            }
        }

        Ok(ids)
    }

    /// Tile definitions with target names resolved to stored ids.
    pub fn tile_definitions(
        &self,
        target_ids: &HashMap<String, i64>,
    ) -> Result<Vec<TileDefinition>, ConfigError> {
        self.tiles
            .iter()
            .map(|tile| {
                let target_id = *target_ids.get(&tile.target).ok_or_else(|| {
                    ConfigError::UnknownTileTarget {
                        tile: tile.id.clone(),
                        target: tile.target.clone(),
                    }
                })?;
                tile.clone().into_definition(target_id)
            })
            .collect()
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct TargetConfig {
    pub name: String,
    pub url: String,
    pub token: Option<String>,
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_active")]
    pub active: bool,
    pub display_order: Option<i64>,
}

impl TargetConfig {
    /// Storage upsert for this target; `position` orders targets without an
    /// explicit display order.
    pub fn to_upsert(&self, position: usize) -> TargetUpsert {
        TargetUpsert {
            name: self.name.clone(),
            base_url: self.url.clone(),
            api_token: self.token.clone().unwrap_or_default(),
            is_active: self.active,
            poll_interval_seconds: self.interval_seconds,
            display_order: self.display_order.unwrap_or(position as i64),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// In-memory storage (no persistence)
    None,
    #[default]
    Sqlite,
}

/// Storage backend configuration
#[derive(Debug, Clone, serde::Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageKind,

    /// Path to the SQLite database file
    #[serde(default = "default_sqlite_path")]
    pub path: PathBuf,

    /// Snapshots older than this are deleted. Clamped to 1..=90.
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,

    pub max_snapshots_per_target: Option<usize>,
}

impl StorageConfig {
    pub fn retention(&self) -> Retention {
        Retention::from_days(self.retention_days, self.max_snapshots_per_target)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageKind::default(),
            path: default_sqlite_path(),
            retention_days: default_retention_days(),
            max_snapshots_per_target: None,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,
}

impl SchedulerConfig {
    /// Tick period clamped to `1..=30` seconds so every target is looked at
    /// at least once per minimum poll interval.
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_seconds.clamp(1, MAX_TICK_SECONDS))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_seconds: DEFAULT_TICK_SECONDS,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Alert {
    Discord(Discord),
    Webhook(Webhook),
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Webhook {
    pub url: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Discord {
    pub url: String,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LivenessMethod {
    /// System `ping` binary
    #[default]
    Icmp,
    /// TCP connect to `host:port`
    Tcp,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct LivenessConfig {
    #[serde(default)]
    pub method: LivenessMethod,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    #[serde(default = "default_api_bind")]
    pub bind: SocketAddr,
    /// Bearer token required on every request when set.
    pub token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            bind: default_api_bind(),
            token: None,
        }
    }
}

/// A status tile as written in the configuration file. Targets are
/// referenced by name and resolved to ids once they are stored.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct TileConfig {
    pub id: String,
    pub target: String,
    pub label: String,
    pub selector: MetricSelector,
    pub mount_path: Option<String>,
    pub warning_threshold: Option<f64>,
    pub critical_threshold: Option<f64>,
    pub ping_endpoint: Option<String>,
    pub ping_interval_seconds: Option<u64>,
    #[serde(default)]
    pub display_order: i64,
}

impl TileConfig {
    pub fn into_definition(self, target_id: i64) -> Result<TileDefinition, ConfigError> {
        let tile = self.id.clone();
        TileDefinition {
            id: self.id,
            target_id,
            label: self.label,
            selector: self.selector,
            mount_path: self.mount_path,
            warning_threshold: self.warning_threshold,
            critical_threshold: self.critical_threshold,
            ping_endpoint: self.ping_endpoint,
            ping_interval_seconds: self
                .ping_interval_seconds
                .unwrap_or(DEFAULT_PING_INTERVAL_SECONDS),
            display_order: self.display_order,
        }
        .validate()
        .map_err(|source| ConfigError::InvalidTile { tile, source })
    }
}

fn default_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECONDS
}

fn default_active() -> bool {
    true
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./monitor.db")
}

fn default_retention_days() -> i64 {
    DEFAULT_RETENTION_DAYS
}

fn default_tick_seconds() -> u64 {
    DEFAULT_TICK_SECONDS
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECONDS
}

fn default_api_enabled() -> bool {
    true
}

fn default_api_bind() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 8080))
}

pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_json::from_str(content)?;
    config.validate()?;
    Ok(config)
}

pub fn read_config_file(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let file_content = std::fs::read_to_string(path)?;
    parse_config(&file_content).inspect(|config| trace!("loaded config: {config:?}"))
}
