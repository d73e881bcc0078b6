//! Storage backend trait definition
//!
//! This module defines the `StorageBackend` trait that every hub-side
//! persistence implementation provides.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error::StorageResult;
use super::schema::{IngestionRecord, Retention, SnapshotRow, Target, TargetSchedule, TargetUpsert};

/// Health status of the storage backend
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// Is the backend operational?
    pub healthy: bool,

    /// Human-readable status message
    pub message: String,

    /// Additional backend-specific metadata
    pub metadata: HashMap<String, String>,
}

/// Trait for hub persistence backends
///
/// ## Ordering
///
/// Snapshots of one target are returned oldest first, ordered by
/// `reported_at` and then by insertion order.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync` as they are shared between the
/// scheduler's ingestion tasks, the tile engine and the API.
///
/// ## Error Handling
///
/// Implementations convert backend-specific errors to `StorageError`. A
/// missing column must surface as `StorageError::SchemaMismatch` so callers
/// can run `repair_schema` and retry.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Create the target named `target.name` or update its configuration
    /// fields. Contact time and warning state are left untouched.
    async fn upsert_target(&self, target: TargetUpsert) -> StorageResult<Target>;

    async fn set_target_active(&self, target_id: i64, active: bool) -> StorageResult<()>;

    async fn get_target(&self, target_id: i64) -> StorageResult<Option<Target>>;

    /// All targets ordered by `display_order`, then id.
    async fn list_targets(&self) -> StorageResult<Vec<Target>>;

    /// Scheduling view of every active target.
    async fn list_active_schedules(&self) -> StorageResult<Vec<TargetSchedule>>;

    /// Persist one successful poll atomically.
    ///
    /// Inserts the snapshot, sets the target's `last_seen_at` and
    /// `last_warning`, and applies the record's retention to that target.
    /// Returns the stored row with its assigned id.
    async fn commit_ingestion(&self, record: IngestionRecord) -> StorageResult<SnapshotRow>;

    async fn latest_snapshot(&self, target_id: i64) -> StorageResult<Option<SnapshotRow>>;

    /// Latest snapshot of each listed target, fetched in one round trip.
    /// Targets without snapshots are absent from the map.
    async fn latest_snapshots(&self, target_ids: &[i64]) -> StorageResult<HashMap<i64, SnapshotRow>>;

    /// Up to `limit` most recent snapshots of a target, oldest first.
    async fn snapshots(&self, target_id: i64, limit: usize) -> StorageResult<Vec<SnapshotRow>>;

    /// Apply `retention` to every target. Returns the number of rows deleted.
    async fn prune(&self, retention: &Retention, now: DateTime<Utc>) -> StorageResult<usize>;

    async fn update_snapshot_warnings(
        &self,
        snapshot_id: i64,
        warnings: &[String],
    ) -> StorageResult<()>;

    async fn update_target_warning(
        &self,
        target_id: i64,
        last_warning: Option<&str>,
    ) -> StorageResult<()>;

    /// Add any snapshot columns an older database lacks.
    /// Returns the names of the columns that were added.
    async fn repair_schema(&self) -> StorageResult<Vec<String>>;

    /// Check backend health
    ///
    /// Performs a lightweight operation to verify the backend
    /// is operational (e.g., ping database, check file access).
    async fn health_check(&self) -> StorageResult<HealthStatus>;

    /// Human readable statistics, e.g. "SQLite: 1200 snapshots across 4 targets".
    async fn get_stats(&self) -> StorageResult<String>;

    /// Close the backend and release resources
    async fn close(&self) -> StorageResult<()>;
}
