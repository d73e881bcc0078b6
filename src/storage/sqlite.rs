//! SQLite storage backend implementation
//!
//! This module provides a SQLite-based implementation of the `StorageBackend` trait.
//!
//! ## Features
//!
//! - **Embedded**: No separate database server required
//! - **WAL mode**: Readers (tile engine, API) never block the ingestion writer
//! - **Connection pooling**: Efficient resource usage
//! - **Migrations**: Automatic schema versioning with sqlx
//! - **Self-healing**: `repair_schema` adds columns missing from databases
//!   created by older releases
//!
//! ## Layout
//!
//! Timestamps are stored as unix milliseconds. List-shaped snapshot fields and
//! the raw agent body are stored as JSON text.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, QueryBuilder, Row, Sqlite};
use tracing::{debug, info, instrument, warn};

use super::backend::{HealthStatus, StorageBackend};
use super::error::{StorageError, StorageResult};
use super::schema::{IngestionRecord, Retention, SnapshotRow, Target, TargetSchedule, TargetUpsert};
use crate::CpuLoad;

const SNAPSHOT_COLUMNS: &str = "id, target_id, reported_at, cpu_temperature_c, ram_used_percent, \
     total_ram_gb, disk_usage_percent, mounted_usage, cpu_load_one, cpu_load_five, \
     cpu_load_fifteen, network_counters, disk_temperatures, backend_version, os_version, \
     uptime_seconds, warnings, raw_payload";

const TARGET_COLUMNS: &str = "id, name, base_url, api_token, is_active, poll_interval_seconds, \
     display_order, last_seen_at, last_warning";

/// Snapshot columns added after the first release, with their definitions.
const LATE_SNAPSHOT_COLUMNS: &[(&str, &str)] = &[
    ("backend_version", "backend_version TEXT"),
    (
        "network_counters",
        "network_counters TEXT NOT NULL DEFAULT '[]'",
    ),
    (
        "disk_temperatures",
        "disk_temperatures TEXT NOT NULL DEFAULT '[]'",
    ),
];

/// SQLite storage backend
pub struct SqliteBackend {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteBackend {
    /// Open (or create) the database at `db_path` and run migrations.
    ///
    /// ```no_run
    /// # use backend_monitor::storage::sqlite::SqliteBackend;
    /// # async fn example() -> anyhow::Result<()> {
    /// let backend = SqliteBackend::new("./monitor.db").await?;
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite backend at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        info!("SQLite connection pool created");

        debug!("running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;

        info!("database migrations complete");

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }

    /// Underlying pool, for maintenance statements.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    fn timestamp_to_millis(dt: &DateTime<Utc>) -> i64 {
        dt.timestamp_millis()
    }

    /// SQLite integers are signed 64-bit.
    fn to_sql_integer(value: u64, column: &str) -> StorageResult<i64> {
        i64::try_from(value).map_err(|_| StorageError::ValueOutOfRange(format!("{column} = {value}")))
    }

    fn millis_to_timestamp(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap_or_default()
    }

    fn row_to_target(row: &SqliteRow) -> StorageResult<Target> {
        Ok(Target {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            base_url: row.try_get("base_url")?,
            api_token: row.try_get("api_token")?,
            is_active: row.try_get("is_active")?,
            poll_interval_seconds: row.try_get::<i64, _>("poll_interval_seconds")?.max(0) as u64,
            display_order: row.try_get("display_order")?,
            last_seen_at: row
                .try_get::<Option<i64>, _>("last_seen_at")?
                .map(Self::millis_to_timestamp),
            last_warning: row.try_get("last_warning")?,
        })
    }

    fn row_to_snapshot(row: &SqliteRow) -> StorageResult<SnapshotRow> {
        let one: Option<f64> = row.try_get("cpu_load_one")?;
        let five: Option<f64> = row.try_get("cpu_load_five")?;
        let fifteen: Option<f64> = row.try_get("cpu_load_fifteen")?;
        let cpu_load = if one.is_none() && five.is_none() && fifteen.is_none() {
            None
        } else {
            Some(CpuLoad { one, five, fifteen })
        };

        let mounted_usage: String = row.try_get("mounted_usage")?;
        let network_counters: String = row.try_get("network_counters")?;
        let disk_temperatures: String = row.try_get("disk_temperatures")?;
        let warnings: String = row.try_get("warnings")?;
        let raw_payload: String = row.try_get("raw_payload")?;

        Ok(SnapshotRow {
            id: row.try_get("id")?,
            target_id: row.try_get("target_id")?,
            reported_at: Self::millis_to_timestamp(row.try_get("reported_at")?),
            cpu_temperature_c: row.try_get("cpu_temperature_c")?,
            ram_used_percent: row.try_get("ram_used_percent")?,
            total_ram_gb: row.try_get("total_ram_gb")?,
            disk_usage_percent: row.try_get("disk_usage_percent")?,
            mounted_usage: serde_json::from_str(&mounted_usage)?,
            cpu_load,
            network_counters: serde_json::from_str(&network_counters)?,
            disk_temperatures: serde_json::from_str(&disk_temperatures)?,
            backend_version: row.try_get("backend_version")?,
            os_version: row.try_get("os_version")?,
            uptime_seconds: row
                .try_get::<Option<i64>, _>("uptime_seconds")?
                .map(|v| v.max(0) as u64),
            warnings: serde_json::from_str(&warnings)?,
            raw_payload: serde_json::from_str(&raw_payload)?,
        })
    }

    /// Delete one target's rows beyond `max_count`, newest kept.
    async fn prune_target_overflow(
        conn: &mut sqlx::SqliteConnection,
        target_id: i64,
        max_count: usize,
    ) -> StorageResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM metric_snapshots
            WHERE target_id = ?
              AND id NOT IN (
                  SELECT id FROM metric_snapshots
                  WHERE target_id = ?
                  ORDER BY reported_at DESC, id DESC
                  LIMIT ?
              )
            "#,
        )
        .bind(target_id)
        .bind(target_id)
        .bind(max_count as i64)
        .execute(conn)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    #[instrument(skip(self, target), fields(name = %target.name))]
    async fn upsert_target(&self, target: TargetUpsert) -> StorageResult<Target> {
        let sql = format!(
            r#"
            INSERT INTO targets (
                name, base_url, api_token, is_active, poll_interval_seconds, display_order
            )
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (name) DO UPDATE SET
                base_url = excluded.base_url,
                api_token = excluded.api_token,
                is_active = excluded.is_active,
                poll_interval_seconds = excluded.poll_interval_seconds,
                display_order = excluded.display_order
            RETURNING {TARGET_COLUMNS}
            "#
        );

        let poll_interval_seconds =
            Self::to_sql_integer(target.poll_interval_seconds, "poll_interval_seconds")?;

        let row = sqlx::query(&sql)
            .bind(&target.name)
            .bind(&target.base_url)
            .bind(&target.api_token)
            .bind(target.is_active)
            .bind(poll_interval_seconds)
            .bind(target.display_order)
            .fetch_one(&self.pool)
            .await?;

        Self::row_to_target(&row)
    }

    async fn set_target_active(&self, target_id: i64, active: bool) -> StorageResult<()> {
        let result = sqlx::query("UPDATE targets SET is_active = ? WHERE id = ?")
            .bind(active)
            .bind(target_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("target {target_id}")));
        }
        Ok(())
    }

    async fn get_target(&self, target_id: i64) -> StorageResult<Option<Target>> {
        let sql = format!("SELECT {TARGET_COLUMNS} FROM targets WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(target_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_target).transpose()
    }

    async fn list_targets(&self) -> StorageResult<Vec<Target>> {
        let sql = format!("SELECT {TARGET_COLUMNS} FROM targets ORDER BY display_order, id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_target).collect()
    }

    async fn list_active_schedules(&self) -> StorageResult<Vec<TargetSchedule>> {
        let rows = sqlx::query(
            r#"
            SELECT id, poll_interval_seconds, last_seen_at
            FROM targets
            WHERE is_active = 1
            ORDER BY display_order, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(TargetSchedule {
                    id: row.try_get("id")?,
                    poll_interval_seconds: row.try_get::<i64, _>("poll_interval_seconds")?.max(0)
                        as u64,
                    last_seen_at: row
                        .try_get::<Option<i64>, _>("last_seen_at")?
                        .map(Self::millis_to_timestamp),
                })
            })
            .collect()
    }

    #[instrument(skip(self, record), fields(target_id = record.snapshot.target_id))]
    async fn commit_ingestion(&self, record: IngestionRecord) -> StorageResult<SnapshotRow> {
        let IngestionRecord {
            mut snapshot,
            seen_at,
            last_warning,
            retention,
        } = record;
        let target_id = snapshot.target_id;
        let uptime_seconds = snapshot
            .uptime_seconds
            .map(|uptime| Self::to_sql_integer(uptime, "uptime_seconds"))
            .transpose()?;

        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query("SELECT 1 FROM targets WHERE id = ?")
            .bind(target_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(StorageError::NotFound(format!("target {target_id}")));
        }

        let load = snapshot.cpu_load.unwrap_or_default();
        let inserted = sqlx::query(
            r#"
            INSERT INTO metric_snapshots (
                target_id, reported_at, cpu_temperature_c, ram_used_percent, total_ram_gb,
                disk_usage_percent, mounted_usage, cpu_load_one, cpu_load_five,
                cpu_load_fifteen, network_counters, disk_temperatures, backend_version,
                os_version, uptime_seconds, warnings, raw_payload
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(target_id)
        .bind(Self::timestamp_to_millis(&snapshot.reported_at))
        .bind(snapshot.cpu_temperature_c)
        .bind(snapshot.ram_used_percent)
        .bind(snapshot.total_ram_gb)
        .bind(snapshot.disk_usage_percent)
        .bind(serde_json::to_string(&snapshot.mounted_usage)?)
        .bind(load.one)
        .bind(load.five)
        .bind(load.fifteen)
        .bind(serde_json::to_string(&snapshot.network_counters)?)
        .bind(serde_json::to_string(&snapshot.disk_temperatures)?)
        .bind(&snapshot.backend_version)
        .bind(&snapshot.os_version)
        .bind(uptime_seconds)
        .bind(serde_json::to_string(&snapshot.warnings)?)
        .bind(serde_json::to_string(&snapshot.raw_payload)?)
        .fetch_one(&mut *tx)
        .await?;
        snapshot.id = inserted.try_get("id")?;

        sqlx::query("UPDATE targets SET last_seen_at = ?, last_warning = ? WHERE id = ?")
            .bind(Self::timestamp_to_millis(&seen_at))
            .bind(&last_warning)
            .bind(target_id)
            .execute(&mut *tx)
            .await?;

        let expired = sqlx::query("DELETE FROM metric_snapshots WHERE target_id = ? AND reported_at < ?")
            .bind(target_id)
            .bind(Self::timestamp_to_millis(&retention.cutoff(seen_at)))
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let overflow = match retention.max_count {
            Some(max_count) => Self::prune_target_overflow(&mut *tx, target_id, max_count).await?,
            None => 0,
        };

        tx.commit().await?;

        debug!(
            "stored snapshot {} ({} expired, {} over limit)",
            snapshot.id, expired, overflow
        );
        Ok(snapshot)
    }

    async fn latest_snapshot(&self, target_id: i64) -> StorageResult<Option<SnapshotRow>> {
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM metric_snapshots \
             WHERE target_id = ? ORDER BY reported_at DESC, id DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(target_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_snapshot).transpose()
    }

    #[instrument(skip(self, target_ids), fields(count = target_ids.len()))]
    async fn latest_snapshots(&self, target_ids: &[i64]) -> StorageResult<HashMap<i64, SnapshotRow>> {
        if target_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM (\
                SELECT *, ROW_NUMBER() OVER (\
                    PARTITION BY target_id ORDER BY reported_at DESC, id DESC\
                ) AS position \
                FROM metric_snapshots WHERE target_id IN ("
        ));
        let mut ids = builder.separated(", ");
        for target_id in target_ids {
            ids.push_bind(*target_id);
        }
        ids.push_unseparated(")) WHERE position = 1");

        let rows = builder.build().fetch_all(&self.pool).await?;

        rows.iter()
            .map(|row| Self::row_to_snapshot(row).map(|snapshot| (snapshot.target_id, snapshot)))
            .collect()
    }

    async fn snapshots(&self, target_id: i64, limit: usize) -> StorageResult<Vec<SnapshotRow>> {
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM metric_snapshots \
             WHERE target_id = ? ORDER BY reported_at DESC, id DESC LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(target_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut results = rows
            .iter()
            .map(Self::row_to_snapshot)
            .collect::<StorageResult<Vec<_>>>()?;
        // Reverse to get chronological order (oldest first)
        results.reverse();
        Ok(results)
    }

    #[instrument(skip(self, retention))]
    async fn prune(&self, retention: &Retention, now: DateTime<Utc>) -> StorageResult<usize> {
        let mut tx = self.pool.begin().await?;

        let mut deleted = sqlx::query("DELETE FROM metric_snapshots WHERE reported_at < ?")
            .bind(Self::timestamp_to_millis(&retention.cutoff(now)))
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if let Some(max_count) = retention.max_count {
            deleted += sqlx::query(
                r#"
                DELETE FROM metric_snapshots
                WHERE id IN (
                    SELECT id FROM (
                        SELECT id, ROW_NUMBER() OVER (
                            PARTITION BY target_id ORDER BY reported_at DESC, id DESC
                        ) AS position
                        FROM metric_snapshots
                    )
                    WHERE position > ?
                )
                "#,
            )
            .bind(max_count as i64)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        tx.commit().await?;

        info!("pruned {} snapshots", deleted);
        Ok(deleted as usize)
    }

    async fn update_snapshot_warnings(
        &self,
        snapshot_id: i64,
        warnings: &[String],
    ) -> StorageResult<()> {
        let result = sqlx::query("UPDATE metric_snapshots SET warnings = ? WHERE id = ?")
            .bind(serde_json::to_string(warnings)?)
            .bind(snapshot_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("snapshot {snapshot_id}")));
        }
        Ok(())
    }

    async fn update_target_warning(
        &self,
        target_id: i64,
        last_warning: Option<&str>,
    ) -> StorageResult<()> {
        let result = sqlx::query("UPDATE targets SET last_warning = ? WHERE id = ?")
            .bind(last_warning)
            .bind(target_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("target {target_id}")));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn repair_schema(&self) -> StorageResult<Vec<String>> {
        let rows = sqlx::query("PRAGMA table_info(metric_snapshots)")
            .fetch_all(&self.pool)
            .await?;
        let present: Vec<String> = rows
            .iter()
            .map(|row| row.try_get::<String, _>("name"))
            .collect::<Result<_, _>>()?;

        let mut added = Vec::new();
        for (column, definition) in LATE_SNAPSHOT_COLUMNS {
            if present.iter().any(|name| name == column) {
                continue;
            }
            warn!("adding missing column metric_snapshots.{}", column);
            sqlx::query(&format!("ALTER TABLE metric_snapshots ADD COLUMN {definition}"))
                .execute(&self.pool)
                .await?;
            added.push(column.to_string());
        }

        Ok(added)
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> StorageResult<HealthStatus> {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => {
                let mut metadata = HashMap::new();
                metadata.insert("backend".to_string(), "sqlite".to_string());
                metadata.insert("db_path".to_string(), self.db_path.clone());

                Ok(HealthStatus {
                    healthy: true,
                    message: "SQLite backend operational".to_string(),
                    metadata,
                })
            }
            Err(e) => {
                warn!("health check failed: {}", e);
                Ok(HealthStatus {
                    healthy: false,
                    message: format!("health check failed: {}", e),
                    metadata: HashMap::new(),
                })
            }
        }
    }

    async fn get_stats(&self) -> StorageResult<String> {
        let (snapshots,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM metric_snapshots")
            .fetch_one(&self.pool)
            .await?;
        let (targets,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM targets")
            .fetch_one(&self.pool)
            .await?;

        let file_size_mb = std::fs::metadata(&self.db_path)
            .map(|m| m.len())
            .unwrap_or(0) as f64
            / 1_000_000.0;

        Ok(format!(
            "SQLite: {} snapshots across {} targets, {:.2} MB on disk",
            snapshots, targets, file_size_mb
        ))
    }

    async fn close(&self) -> StorageResult<()> {
        info!("closing SQLite backend");
        self.pool.close().await;
        Ok(())
    }
}
