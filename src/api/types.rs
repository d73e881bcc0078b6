//! API response types

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::actors::ScheduleStatus;
use crate::storage::{HealthStatus, SnapshotRow, Target};
use crate::tiles::TileView;

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub storage: HealthStatus,
}

/// A target with its scheduling state. The API token is never exposed.
#[derive(Debug, Clone, Serialize)]
pub struct TargetInfo {
    pub id: i64,
    pub name: String,
    pub base_url: String,
    pub is_active: bool,
    pub poll_interval_seconds: u64,
    pub display_order: i64,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub last_warning: Option<String>,
    /// `None` for inactive targets and targets not reconciled yet
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleStatus>,
}

impl TargetInfo {
    pub fn new(target: Target, schedule: Option<ScheduleStatus>) -> Self {
        Self {
            id: target.id,
            name: target.name,
            base_url: target.base_url,
            is_active: target.is_active,
            poll_interval_seconds: target.poll_interval_seconds,
            display_order: target.display_order,
            last_seen_at: target.last_seen_at,
            last_warning: target.last_warning,
            schedule,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetsResponse {
    pub targets: Vec<TargetInfo>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatestSnapshotResponse {
    pub target_id: i64,
    pub snapshot: SnapshotRow,
}

#[derive(Debug, Clone, Serialize)]
pub struct TilesResponse {
    pub tiles: Vec<TileView>,
    pub count: usize,
}
