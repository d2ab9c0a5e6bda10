//! `digest-scheduler`: daily, timezone-aware digest runs with SQLite persistence.
//!
//! # Overview
//!
//! Schedules live in the `digest_schedules` table. The [`engine::Scheduler`]
//! polls for active schedules whose `next_execution_at` has arrived, runs
//! each one against all of its targets through a [`summarizer::Summarizer`],
//! and writes the outcome back together with the next run time.
//!
//! # Execution status
//!
//! | Targets                          | Status    |
//! |----------------------------------|-----------|
//! | every target `success`           | `success` |
//! | at least one success, not all    | `partial` |
//! | no success (failed or skipped)   | `failed`  |
//!
//! Non-success runs feed `consecutive_failures`; once it reaches
//! `max_retries` (when non-zero) the schedule is paused.

pub mod db;
pub mod engine;
pub mod error;
pub mod runner;
pub mod schedule;
pub mod store;
pub mod summarizer;
pub mod types;

#[cfg(test)]
mod testing;

pub use engine::{PollOutcome, Scheduler};
pub use error::{Result, SchedulerError};
pub use store::{ScheduleStore, SqliteScheduleStore};
pub use summarizer::{Summarizer, SummarizerError, SummaryOutcome, SummaryRequest};
pub use types::{
    ExecutionEvent, ExecutionRecord, ExecutionStatus, NewSchedule, PauseReason, Schedule,
    ScheduleStatus, Target, TargetResult, TargetStatus, Trigger,
};
