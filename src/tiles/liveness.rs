//! Reachability probes and their per-tile cache

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, instrument, trace};

use super::TileDefinition;

/// Results younger than this are always reused.
pub const MIN_REUSE_SECONDS: u64 = 5;

const DEFAULT_TCP_PORT: u16 = 80;

static PING_TIME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"time[=<]\s*([\d.]+)\s*ms").ok());

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("could not run probe: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("{0} is unreachable")]
    Unreachable(String),

    #[error("probe timed out")]
    Timeout,

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Outcome of one reachability check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LivenessResult {
    pub checked_at: DateTime<Utc>,
    pub success: bool,
    pub latency_ms: Option<f64>,
}

#[async_trait]
pub trait LivenessProbe: Send + Sync {
    /// Check `endpoint` once and return the round trip time.
    async fn probe(&self, endpoint: &str, timeout: Duration) -> Result<Duration, ProbeError>;
}

/// ICMP echo through the system `ping` binary.
#[derive(Debug, Default, Clone)]
pub struct PingProbe;

#[async_trait]
impl LivenessProbe for PingProbe {
    async fn probe(&self, endpoint: &str, timeout: Duration) -> Result<Duration, ProbeError> {
        if endpoint.starts_with('-') || endpoint.trim().is_empty() {
            return Err(ProbeError::InvalidEndpoint(endpoint.to_string()));
        }

        let start = Instant::now();
        let output = Command::new("ping")
            .arg("-c")
            .arg("1")
            .arg("-W")
            .arg(timeout.as_secs().max(1).to_string())
            .arg(endpoint)
            .kill_on_drop(true)
            .output()
            .await?;
        let elapsed = start.elapsed();

        if !output.status.success() {
            return Err(ProbeError::Unreachable(endpoint.to_string()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_ping_latency(&stdout).unwrap_or(elapsed))
    }
}

/// Round trip time reported by `ping`, if the output contains one.
pub fn parse_ping_latency(output: &str) -> Option<Duration> {
    PING_TIME
        .as_ref()?
        .captures(output)
        .and_then(|captures| captures[1].parse::<f64>().ok())
        .filter(|ms| ms.is_finite() && *ms >= 0.0)
        .map(|ms| Duration::from_secs_f64(ms / 1000.0))
}

/// TCP connect time to `host:port`; endpoints without a port use 80.
///
/// IPv6 literals are accepted bare (`::1`) or bracketed (`[::1]`, `[::1]:22`).
#[derive(Debug, Default, Clone)]
pub struct TcpConnectProbe;

impl TcpConnectProbe {
    fn address(endpoint: &str) -> String {
        if let Ok(socket) = endpoint.parse::<SocketAddr>() {
            return socket.to_string();
        }
        let bare = endpoint
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .unwrap_or(endpoint);
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return SocketAddr::new(ip, DEFAULT_TCP_PORT).to_string();
        }
        match endpoint.rsplit_once(':') {
            Some((_, port)) if port.parse::<u16>().is_ok() => endpoint.to_string(),
            _ => format!("{endpoint}:{DEFAULT_TCP_PORT}"),
        }
    }
}

#[async_trait]
impl LivenessProbe for TcpConnectProbe {
    async fn probe(&self, endpoint: &str, timeout: Duration) -> Result<Duration, ProbeError> {
        if endpoint.trim().is_empty() {
            return Err(ProbeError::InvalidEndpoint(endpoint.to_string()));
        }

        let start = Instant::now();
        match tokio::time::timeout(timeout, TcpStream::connect(Self::address(endpoint))).await {
            Ok(Ok(_stream)) => Ok(start.elapsed()),
            Ok(Err(e)) => {
                trace!("connect to {} failed: {}", endpoint, e);
                Err(ProbeError::Unreachable(endpoint.to_string()))
            }
            Err(_) => Err(ProbeError::Timeout),
        }
    }
}

type Slot = Arc<Mutex<Option<LivenessResult>>>;

/// Rate-limited liveness results keyed by tile id.
///
/// The map lock is only held to find a tile's slot. The slot lock is held
/// across check, probe and write, so one tile is never probed twice at the
/// same time while different tiles probe in parallel.
pub struct LivenessCache {
    probe: Arc<dyn LivenessProbe>,
    timeout: Duration,
    entries: Mutex<HashMap<String, Slot>>,
}

impl LivenessCache {
    pub fn new(probe: Arc<dyn LivenessProbe>, timeout: Duration) -> Self {
        Self {
            probe,
            timeout: timeout.max(Duration::from_secs(1)),
            entries: Mutex::new(HashMap::new()),
        }
    }

    async fn slot(&self, tile_id: &str) -> Slot {
        let mut entries = self.entries.lock().await;
        Arc::clone(entries.entry(tile_id.to_string()).or_default())
    }

    /// Cached or fresh result for `tile`, `None` when it has no endpoint.
    #[instrument(skip(self, tile), fields(tile = %tile.id))]
    pub async fn check(&self, tile: &TileDefinition, now: DateTime<Utc>) -> Option<LivenessResult> {
        let endpoint = tile.ping_endpoint.as_deref().map(str::trim).filter(|e| !e.is_empty())?;
        let reuse_for = chrono::Duration::seconds(tile.ping_interval_seconds.max(MIN_REUSE_SECONDS) as i64);

        let slot = self.slot(&tile.id).await;
        let mut cached = slot.lock().await;

        if let Some(result) = (*cached).filter(|result| now - result.checked_at < reuse_for) {
            trace!("reusing liveness result from {}", result.checked_at);
            return Some(result);
        }

        let outcome = match tokio::time::timeout(self.timeout, self.probe.probe(endpoint, self.timeout)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ProbeError::Timeout),
        };

        let result = match outcome {
            Ok(latency) => LivenessResult {
                checked_at: now,
                success: true,
                latency_ms: Some(latency.as_secs_f64() * 1000.0),
            },
            Err(e) => {
                debug!("liveness probe of {} failed: {}", endpoint, e);
                LivenessResult {
                    checked_at: now,
                    success: false,
                    latency_ms: None,
                }
            }
        };

        *cached = Some(result);
        Some(result)
    }
}
