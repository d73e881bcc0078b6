//! Actor-based polling
//!
//! The hub runs a single long-lived `PollScheduler` task. It owns the
//! schedule book, spawns one ingestion task per due target and is controlled
//! through a cloneable `SchedulerHandle`.
//!
//! ## Architecture Overview
//!
//! ```text
//!              ┌─────────────────┐
//!              │   Hub (main)    │
//!              └────────┬────────┘
//!                       │ spawns
//!              ┌────────▼────────┐   commands (mpsc)   ┌──────────────────┐
//!              │  PollScheduler  │ ◄────────────────── │ SchedulerHandle  │
//!              └────────┬────────┘   replies (oneshot) └──────────────────┘
//!                       │ JoinSet
//!          ┌────────────┼────────────┐
//!          │            │            │
//!   ┌──────▼─────┐ ┌────▼──────┐ ┌───▼────────┐
//!   │ ingest T1  │ │ ingest T2 │ │ ingest TN  │
//!   └────────────┘ └───────────┘ └────────────┘
//! ```
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: mpsc channel for control messages
//! 2. **Request/Response**: oneshot channels for status queries and the
//!    shutdown acknowledgement

pub mod messages;
pub mod scheduler;

pub use messages::{ScheduleStatus, SchedulerCommand};
pub use scheduler::{PollScheduler, ScheduleBook, SchedulerHandle};
