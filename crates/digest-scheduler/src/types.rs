use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of execution records retained per schedule.
pub const MAX_HISTORY: usize = 20;

/// Whether a schedule is picked up by the polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Active,
    /// Skipped by polling until resumed. Manual runs still work.
    Paused,
}

impl std::fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ScheduleStatus::Active => "active",
            ScheduleStatus::Paused => "paused",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ScheduleStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(ScheduleStatus::Active),
            "paused" => Ok(ScheduleStatus::Paused),
            other => Err(format!("unknown schedule status: {other}")),
        }
    }
}

/// How often a schedule repeats. Only daily runs exist today.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    #[default]
    Daily,
}

impl std::fmt::Display for Frequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Frequency::Daily => write!(f, "daily"),
        }
    }
}

impl std::str::FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "daily" => Ok(Frequency::Daily),
            other => Err(format!("unknown frequency: {other}")),
        }
    }
}

/// Outcome of one whole execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Partial,
    Failed,
}

impl ExecutionStatus {
    /// Fold per-target outcomes into one status.
    ///
    /// An empty slice is `Failed`: nothing was produced.
    pub fn aggregate(results: &[TargetResult]) -> Self {
        let successes = results
            .iter()
            .filter(|r| r.status == TargetStatus::Success)
            .count();
        if successes == 0 {
            ExecutionStatus::Failed
        } else if successes == results.len() {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Partial
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Partial => "partial",
            ExecutionStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "success" => Ok(ExecutionStatus::Success),
            "partial" => Ok(ExecutionStatus::Partial),
            "failed" => Ok(ExecutionStatus::Failed),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// Outcome of one target within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Success,
    /// The summarizer answered but produced nothing (e.g. no data in the window).
    Skipped,
    Failed,
}

/// One independent unit of work inside a schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub target_id: String,
    pub target_name: String,
}

impl Target {
    pub fn new(target_id: impl Into<String>, target_name: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            target_name: target_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetResult {
    pub target_id: String,
    pub target_name: String,
    pub status: TargetStatus,
    /// Produced artifact; present iff `status == Success`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_id: Option<String>,
    /// Present iff `status != Success`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TargetResult {
    pub fn success(target: &Target, result_id: String) -> Self {
        Self {
            target_id: target.target_id.clone(),
            target_name: target.target_name.clone(),
            status: TargetStatus::Success,
            result_id: Some(result_id),
            error: None,
        }
    }

    pub fn skipped(target: &Target, reason: impl Into<String>) -> Self {
        Self {
            target_id: target.target_id.clone(),
            target_name: target.target_name.clone(),
            status: TargetStatus::Skipped,
            result_id: None,
            error: Some(reason.into()),
        }
    }

    pub fn failed(target: &Target, error: impl Into<String>) -> Self {
        Self {
            target_id: target.target_id.clone(),
            target_name: target.target_name.clone(),
            status: TargetStatus::Failed,
            result_id: None,
            error: Some(error.into()),
        }
    }
}

/// Immutable outcome of one run of one schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// UUID v7 string, so records sort by creation time.
    pub id: String,
    pub schedule_id: String,
    pub executed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: ExecutionStatus,
    /// Same order as `Schedule::targets` at execution time.
    pub target_results: Vec<TargetResult>,
    /// Set iff `status != Success`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionRecord {
    /// True when every non-success target was skipped rather than failed.
    pub fn only_soft_failures(&self) -> bool {
        self.target_results
            .iter()
            .all(|r| r.status != TargetStatus::Failed)
            && !self.target_results.is_empty()
    }
}

/// A persisted recurring job definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    /// UUID v7 string, primary key.
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub description: Option<String>,
    /// Wall-clock `HH:MM`, interpreted in `timezone`.
    pub run_at: String,
    /// IANA timezone name.
    pub timezone: String,
    pub frequency: Frequency,
    pub status: ScheduleStatus,
    pub targets: Vec<Target>,
    /// Forwarded verbatim to the summarizer.
    pub options: serde_json::Value,
    /// Consecutive failures before auto-pause; 0 disables auto-pause.
    pub max_retries: u32,
    /// Lifetime count of non-success executions.
    pub fail_count: u32,
    /// Non-success executions since the last success.
    pub consecutive_failures: u32,
    pub last_execution_at: Option<DateTime<Utc>>,
    pub last_execution_status: Option<ExecutionStatus>,
    /// The only field the polling loop reads for due-ness.
    pub next_execution_at: DateTime<Utc>,
    /// Newest first, at most [`MAX_HISTORY`] entries.
    pub history: Vec<ExecutionRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Incremented by every write to the row.
    pub version: i64,
}

impl Schedule {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ScheduleStatus::Active && self.next_execution_at <= now
    }
}

/// User input for creating a schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSchedule {
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub run_at: String,
    pub timezone: String,
    pub targets: Vec<Target>,
    #[serde(default)]
    pub options: serde_json::Value,
    #[serde(default)]
    pub max_retries: u32,
}

/// Fields written back after an execution, applied atomically together with
/// the history prepend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulePatch {
    pub status: ScheduleStatus,
    pub fail_count: u32,
    pub consecutive_failures: u32,
    pub last_execution_at: DateTime<Utc>,
    pub last_execution_status: ExecutionStatus,
    pub next_execution_at: DateTime<Utc>,
    /// The update only applies if the stored row is still at this version.
    pub expected_version: i64,
}

/// What started an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Scheduled,
    Manual,
}

/// Why an execution left a previously active schedule paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    /// `consecutive_failures` reached `max_retries`.
    RepeatedFailures,
    /// No next execution could be computed from `run_at` and `timezone`.
    Unschedulable,
}

/// Published on the optional event channel after every persisted execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub schedule_id: String,
    pub schedule_name: String,
    pub trigger: Trigger,
    pub record: ExecutionRecord,
    /// Set when this execution paused the schedule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<PauseReason>,
    pub next_execution_at: DateTime<Utc>,
}
