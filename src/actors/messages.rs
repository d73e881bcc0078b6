//! Message types exchanged with actors

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;

/// Commands accepted by the `PollScheduler`
#[derive(Debug)]
pub enum SchedulerCommand {
    /// Copy of the schedule book
    Status {
        respond_to: oneshot::Sender<Vec<ScheduleStatus>>,
    },

    /// Stop ticking, wait for in-flight ingestions, then acknowledge
    Shutdown { respond_to: oneshot::Sender<()> },
}

/// Scheduling state of one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleStatus {
    pub target_id: i64,
    pub next_due_at: DateTime<Utc>,
    pub effective_interval_seconds: i64,
    pub in_flight: bool,
    /// Outcome of the most recent completed poll, if any
    pub last_success: Option<bool>,
    pub consecutive_failures: u32,
}
