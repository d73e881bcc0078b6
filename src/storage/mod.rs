//! Snapshot persistence and retention
//!
//! ## Hub side
//!
//! `StorageBackend` is the persistence boundary of the hub. Two
//! implementations ship:
//!
//! - **SQLite** (`storage-sqlite` feature, default): embedded database
//!   with WAL mode and migrations
//! - **In-Memory**: no persistence, used when storage is disabled and in tests
//!
//! ## Agent side
//!
//! `SnapshotHistory` is a per-key bounded queue of readings behind a mutex.
//!
//! ## Usage
//!
//! ```no_run
//! use backend_monitor::storage::{StorageBackend, sqlite::SqliteBackend};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = SqliteBackend::new("./monitor.db").await?;
//!     let targets = backend.list_targets().await?;
//!     println!("{} targets", targets.len());
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod error;
pub mod history;
pub mod memory;
pub mod schema;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

pub use backend::{HealthStatus, StorageBackend};
pub use error::{StorageError, StorageResult};
pub use history::SnapshotHistory;
pub use memory::MemoryBackend;
pub use schema::{
    IngestionRecord, Retention, SnapshotRow, Target, TargetSchedule, TargetUpsert,
    warning_summary,
};
