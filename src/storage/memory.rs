//! In-memory storage backend (no persistence)
//!
//! Used when the hub runs with `"storage": {"backend": "none"}` and as the
//! default backend in tests.
//!
//! ## Limitations
//!
//! - **No persistence**: All data lost on restart
//! - **No schema**: `repair_schema` never has anything to do

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use super::backend::{HealthStatus, StorageBackend};
use super::error::{StorageError, StorageResult};
use super::history::SnapshotHistory;
use super::schema::{IngestionRecord, Retention, SnapshotRow, Target, TargetSchedule, TargetUpsert};

#[derive(Default)]
struct TargetTable {
    rows: BTreeMap<i64, Target>,
    next_target_id: i64,
    next_snapshot_id: i64,
}

/// In-memory storage backend
///
/// Lock order is always the target table first, then the snapshot history,
/// so a commit is observed as one unit.
#[derive(Default)]
pub struct MemoryBackend {
    targets: Mutex<TargetTable>,
    snapshots: SnapshotHistory<i64, SnapshotRow>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_targets(table: &TargetTable) -> Vec<Target> {
    let mut targets: Vec<Target> = table.rows.values().cloned().collect();
    targets.sort_by_key(|target| (target.display_order, target.id));
    targets
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn upsert_target(&self, target: TargetUpsert) -> StorageResult<Target> {
        let mut table = self.targets.lock().await;

        if let Some(existing) = table.rows.values_mut().find(|t| t.name == target.name) {
            existing.base_url = target.base_url;
            existing.api_token = target.api_token;
            existing.is_active = target.is_active;
            existing.poll_interval_seconds = target.poll_interval_seconds;
            existing.display_order = target.display_order;
            return Ok(existing.clone());
        }

        table.next_target_id += 1;
        let created = Target {
            id: table.next_target_id,
            name: target.name,
            base_url: target.base_url,
            api_token: target.api_token,
            is_active: target.is_active,
            poll_interval_seconds: target.poll_interval_seconds,
            display_order: target.display_order,
            last_seen_at: None,
            last_warning: None,
        };
        table.rows.insert(created.id, created.clone());
        debug!("created in-memory target {} ({})", created.name, created.id);
        Ok(created)
    }

    async fn set_target_active(&self, target_id: i64, active: bool) -> StorageResult<()> {
        let mut table = self.targets.lock().await;
        let target = table
            .rows
            .get_mut(&target_id)
            .ok_or_else(|| StorageError::NotFound(format!("target {target_id}")))?;
        target.is_active = active;
        Ok(())
    }

    async fn get_target(&self, target_id: i64) -> StorageResult<Option<Target>> {
        Ok(self.targets.lock().await.rows.get(&target_id).cloned())
    }

    async fn list_targets(&self) -> StorageResult<Vec<Target>> {
        Ok(sorted_targets(&*self.targets.lock().await))
    }

    async fn list_active_schedules(&self) -> StorageResult<Vec<TargetSchedule>> {
        let table = self.targets.lock().await;
        Ok(sorted_targets(&table)
            .iter()
            .filter(|target| target.is_active)
            .map(Target::schedule)
            .collect())
    }

    async fn commit_ingestion(&self, record: IngestionRecord) -> StorageResult<SnapshotRow> {
        let mut table = self.targets.lock().await;
        let target_id = record.snapshot.target_id;
        if !table.rows.contains_key(&target_id) {
            return Err(StorageError::NotFound(format!("target {target_id}")));
        }

        table.next_snapshot_id += 1;
        let mut snapshot = record.snapshot;
        snapshot.id = table.next_snapshot_id;

        let pruned = self
            .snapshots
            .record_and_prune(target_id, snapshot.clone(), &record.retention, record.seen_at)
            .await;

        if let Some(target) = table.rows.get_mut(&target_id) {
            target.last_seen_at = Some(record.seen_at);
            target.last_warning = record.last_warning;
        }

        debug!(
            "committed snapshot {} for target {} ({} pruned)",
            snapshot.id, target_id, pruned
        );
        Ok(snapshot)
    }

    async fn latest_snapshot(&self, target_id: i64) -> StorageResult<Option<SnapshotRow>> {
        Ok(self.snapshots.latest(&target_id).await)
    }

    async fn latest_snapshots(&self, target_ids: &[i64]) -> StorageResult<HashMap<i64, SnapshotRow>> {
        Ok(self.snapshots.latest_many(target_ids).await)
    }

    async fn snapshots(&self, target_id: i64, limit: usize) -> StorageResult<Vec<SnapshotRow>> {
        let all = self.snapshots.all(&target_id).await;
        let skip = all.len().saturating_sub(limit);
        Ok(all.into_iter().skip(skip).collect())
    }

    async fn prune(&self, retention: &Retention, now: DateTime<Utc>) -> StorageResult<usize> {
        let _table = self.targets.lock().await;
        Ok(self.snapshots.prune_all(retention, now).await)
    }

    async fn update_snapshot_warnings(
        &self,
        snapshot_id: i64,
        warnings: &[String],
    ) -> StorageResult<()> {
        let _table = self.targets.lock().await;
        for target_id in self.snapshots.keys().await {
            let updated = self
                .snapshots
                .with_queue(&target_id, |queue| {
                    queue
                        .iter_mut()
                        .find(|row| row.id == snapshot_id)
                        .map(|row| row.warnings = warnings.to_vec())
                        .is_some()
                })
                .await
                .unwrap_or(false);
            if updated {
                return Ok(());
            }
        }
        Err(StorageError::NotFound(format!("snapshot {snapshot_id}")))
    }

    async fn update_target_warning(
        &self,
        target_id: i64,
        last_warning: Option<&str>,
    ) -> StorageResult<()> {
        let mut table = self.targets.lock().await;
        let target = table
            .rows
            .get_mut(&target_id)
            .ok_or_else(|| StorageError::NotFound(format!("target {target_id}")))?;
        target.last_warning = last_warning.map(str::to_string);
        Ok(())
    }

    async fn repair_schema(&self) -> StorageResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let targets = self.targets.lock().await.rows.len();
        Ok(HealthStatus {
            healthy: true,
            message: "In-memory storage operational".to_string(),
            metadata: HashMap::from([
                ("backend".to_string(), "memory".to_string()),
                ("targets".to_string(), targets.to_string()),
            ]),
        })
    }

    async fn get_stats(&self) -> StorageResult<String> {
        let table = self.targets.lock().await;
        let mut total = 0;
        for target_id in table.rows.keys() {
            total += self.snapshots.len(target_id).await;
        }
        Ok(format!(
            "In-Memory: {} snapshots across {} targets",
            total,
            table.rows.len()
        ))
    }

    async fn close(&self) -> StorageResult<()> {
        debug!("closing in-memory backend (no-op)");
        Ok(())
    }
}
