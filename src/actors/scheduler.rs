//! PollScheduler - decides when each target is polled
//!
//! One scheduler task serves every target. On each tick it reloads the
//! active targets, reconciles them with its `ScheduleBook` and spawns an
//! ingestion for every target that is due and not already being polled.
//!
//! ## Due times
//!
//! - `effective = max(poll_interval, 30 s)`
//! - a target seen at `last_seen_at` is due no earlier than
//!   `last_seen_at + effective`
//! - a target never seen and never tracked is due immediately
//! - after a successful poll the next one is `effective` later, after a
//!   failed poll `min(effective, 60 s)` later
//!
//! ## Message Flow
//!
//! ```text
//! Timer tick → list_active_schedules → ScheduleBook::reconcile → spawn ingest_safely
//!     ↑                                                               │
//!     │                         ScheduleBook::complete ←──────────────┘
//!     └─── Commands (Status, Shutdown)
//! ```

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::ingest::Ingestor;
use crate::storage::TargetSchedule;
use crate::storage::schema::{MAX_POLL_INTERVAL_SECONDS, MIN_POLL_INTERVAL_SECONDS};

use super::messages::{ScheduleStatus, SchedulerCommand};

/// Upper bound on the delay before retrying a failed poll.
pub const MAX_RETRY_DELAY_SECONDS: i64 = 60;

pub const DEFAULT_TICK: Duration = Duration::from_secs(5);

/// The tick may never exceed the minimum poll interval.
const MAX_TICK: Duration = Duration::from_secs(MIN_POLL_INTERVAL_SECONDS);
const MIN_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct ScheduleEntry {
    next_due_at: DateTime<Utc>,
    effective_interval: chrono::Duration,
    in_flight: bool,
    last_success: Option<bool>,
    consecutive_failures: u32,
}

/// Per-target due times, owned by the scheduler task.
#[derive(Debug, Default)]
pub struct ScheduleBook {
    entries: HashMap<i64, ScheduleEntry>,
}

impl ScheduleBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configured interval floored at 30 s and capped at one year.
    pub fn effective_interval(poll_interval_seconds: u64) -> chrono::Duration {
        let seconds = poll_interval_seconds.clamp(MIN_POLL_INTERVAL_SECONDS, MAX_POLL_INTERVAL_SECONDS);
        chrono::Duration::try_seconds(seconds as i64).unwrap_or(chrono::Duration::MAX)
    }

    /// `at + delay`, saturating at the latest representable instant.
    fn due_after(at: DateTime<Utc>, delay: chrono::Duration) -> DateTime<Utc> {
        at.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn retry_delay(effective_interval: chrono::Duration) -> chrono::Duration {
        effective_interval.min(chrono::Duration::seconds(MAX_RETRY_DELAY_SECONDS))
    }

    /// Align the book with the current active targets.
    ///
    /// Entries of targets that disappeared are dropped. Returns the targets
    /// due at `now`, already marked in flight.
    pub fn reconcile(&mut self, schedules: &[TargetSchedule], now: DateTime<Utc>) -> Vec<i64> {
        self.entries
            .retain(|id, _| schedules.iter().any(|schedule| schedule.id == *id));

        let mut due = Vec::new();
        for schedule in schedules {
            let effective = Self::effective_interval(schedule.poll_interval_seconds);
            let from_last_seen = schedule
                .last_seen_at
                .map(|seen| Self::due_after(seen, effective));

            let entry = self
                .entries
                .entry(schedule.id)
                .or_insert_with(|| ScheduleEntry {
                    next_due_at: from_last_seen.unwrap_or(now),
                    effective_interval: effective,
                    in_flight: false,
                    last_success: None,
                    consecutive_failures: 0,
                });

            entry.effective_interval = effective;
            if let Some(candidate) = from_last_seen.filter(|c| *c > entry.next_due_at) {
                entry.next_due_at = candidate;
            }

            if !entry.in_flight && entry.next_due_at <= now {
                entry.in_flight = true;
                due.push(schedule.id);
            }
        }

        due
    }

    /// Record the outcome of a poll that finished at `now`.
    pub fn complete(&mut self, target_id: i64, success: bool, now: DateTime<Utc>) {
        let Some(entry) = self.entries.get_mut(&target_id) else {
            return;
        };

        entry.in_flight = false;
        entry.last_success = Some(success);
        if success {
            entry.consecutive_failures = 0;
            entry.next_due_at = Self::due_after(now, entry.effective_interval);
        } else {
            entry.consecutive_failures += 1;
            entry.next_due_at = Self::due_after(now, Self::retry_delay(entry.effective_interval));
        }
    }

    pub fn next_due_at(&self, target_id: i64) -> Option<DateTime<Utc>> {
        self.entries.get(&target_id).map(|entry| entry.next_due_at)
    }

    pub fn is_in_flight(&self, target_id: i64) -> bool {
        self.entries
            .get(&target_id)
            .is_some_and(|entry| entry.in_flight)
    }

    pub fn statuses(&self) -> Vec<ScheduleStatus> {
        let mut statuses: Vec<ScheduleStatus> = self
            .entries
            .iter()
            .map(|(id, entry)| ScheduleStatus {
                target_id: *id,
                next_due_at: entry.next_due_at,
                effective_interval_seconds: entry.effective_interval.num_seconds(),
                in_flight: entry.in_flight,
                last_success: entry.last_success,
                consecutive_failures: entry.consecutive_failures,
            })
            .collect();
        statuses.sort_by_key(|status| status.target_id);
        statuses
    }
}

/// Actor driving all polls of the hub
pub struct PollScheduler {
    ingestor: Arc<Ingestor>,

    book: ScheduleBook,

    tick: Duration,

    /// Command receiver for control messages
    command_rx: mpsc::Receiver<SchedulerCommand>,

    /// In-flight ingestions, each yielding `(target_id, success)`
    tasks: JoinSet<(i64, bool)>,
}

impl PollScheduler {
    pub fn new(
        ingestor: Arc<Ingestor>,
        tick: Duration,
        command_rx: mpsc::Receiver<SchedulerCommand>,
    ) -> Self {
        Self {
            ingestor,
            book: ScheduleBook::new(),
            tick: tick.clamp(MIN_TICK, MAX_TICK),
            command_rx,
            tasks: JoinSet::new(),
        }
    }

    /// Run until a Shutdown command arrives or every handle is dropped.
    #[instrument(skip(self), fields(tick = ?self.tick))]
    pub async fn run(mut self) {
        info!("starting poll scheduler");

        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.on_tick().await;
                }

                Some(finished) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    self.on_task_finished(finished);
                }

                command = self.command_rx.recv() => {
                    match command {
                        Some(SchedulerCommand::Status { respond_to }) => {
                            let _ = respond_to.send(self.book.statuses());
                        }

                        Some(SchedulerCommand::Shutdown { respond_to }) => {
                            debug!("received shutdown command");
                            self.drain().await;
                            let _ = respond_to.send(());
                            break;
                        }

                        None => {
                            warn!("command channel closed, shutting down");
                            self.drain().await;
                            break;
                        }
                    }
                }
            }
        }

        info!("poll scheduler stopped");
    }

    async fn on_tick(&mut self) {
        let schedules = match self.ingestor.storage().list_active_schedules().await {
            Ok(schedules) => schedules,
            Err(e) => {
                warn!("could not load targets, skipping tick: {}", e);
                return;
            }
        };

        let due = self.book.reconcile(&schedules, Utc::now());
        trace!("{} of {} targets due", due.len(), schedules.len());

        for target_id in due {
            let ingestor = Arc::clone(&self.ingestor);
            self.tasks.spawn(async move {
                let success = AssertUnwindSafe(ingestor.ingest_safely(target_id))
                    .catch_unwind()
                    .await
                    .map(|snapshot| snapshot.is_some())
                    .unwrap_or_else(|_| {
                        error!("ingestion task for target {target_id} panicked");
                        false
                    });
                (target_id, success)
            });
        }
    }

    fn on_task_finished(&mut self, finished: Result<(i64, bool), JoinError>) {
        match finished {
            Ok((target_id, success)) => {
                trace!("poll of target {target_id} finished, success: {success}");
                self.book.complete(target_id, success, Utc::now());
            }
            Err(e) => error!("ingestion task failed: {}", e),
        }
    }

    /// Wait for every in-flight ingestion.
    async fn drain(&mut self) {
        if !self.tasks.is_empty() {
            info!("waiting for {} in-flight ingestions", self.tasks.len());
        }
        while let Some(finished) = self.tasks.join_next().await {
            self.on_task_finished(finished);
        }
    }
}

/// Handle for controlling a PollScheduler
///
/// Cheap to clone; the scheduler stops when the last handle is dropped.
#[derive(Clone)]
pub struct SchedulerHandle {
    sender: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    /// Spawn the scheduler as a tokio task.
    pub fn spawn(ingestor: Arc<Ingestor>, tick: Duration) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let scheduler = PollScheduler::new(ingestor, tick, cmd_rx);

        tokio::spawn(scheduler.run());

        Self { sender: cmd_tx }
    }

    pub async fn status(&self) -> Result<Vec<ScheduleStatus>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SchedulerCommand::Status { respond_to: tx })
            .await
            .context("failed to send Status command")?;

        rx.await.context("failed to receive response")
    }

    /// Stop the scheduler; returns once in-flight ingestions have finished.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SchedulerCommand::Shutdown { respond_to: tx })
            .await
            .context("failed to send Shutdown command")?;

        rx.await.context("scheduler stopped without acknowledging")
    }
}
