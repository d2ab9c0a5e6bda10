use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The provided schedule definition is invalid or unsupported.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// `run_at` is not a valid `HH:MM` time of day.
    #[error("Invalid run_at {0:?}: expected HH:MM")]
    InvalidRunAt(String),

    /// Not a known IANA timezone name.
    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    /// No schedule with the given ID exists in the store.
    #[error("Schedule not found: {id}")]
    ScheduleNotFound { id: String },

    /// The conditional update lost a race with another writer.
    #[error("Concurrent update on schedule {id}: last execution changed underneath")]
    ConcurrentUpdate { id: String },

    /// A JSON column could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
