use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    schedule::{execution_window, ExecutionWindow},
    summarizer::{Summarizer, SummarizerError, SummaryRequest},
    types::{ExecutionRecord, ExecutionStatus, Schedule, TargetResult, TargetStatus},
};

/// Runs one schedule against all of its targets.
///
/// Never touches the store: it reads the schedule it is handed and returns
/// a record. Targets run one after another; a failing target is recorded
/// and the next one still runs.
pub struct ExecutionRunner {
    summarizer: Arc<dyn Summarizer>,
    target_timeout: Duration,
}

impl ExecutionRunner {
    pub fn new(summarizer: Arc<dyn Summarizer>, target_timeout: Duration) -> Self {
        Self {
            summarizer,
            target_timeout,
        }
    }

    pub async fn execute(&self, schedule: &Schedule) -> ExecutionRecord {
        let executed_at = Utc::now();
        let started = Instant::now();

        let target_results = match execution_window(executed_at, &schedule.timezone) {
            Ok(window) => self.run_targets(schedule, &window).await,
            Err(e) => {
                warn!(schedule_id = %schedule.id, "cannot compute execution window: {e}");
                schedule
                    .targets
                    .iter()
                    .map(|t| TargetResult::failed(t, e.to_string()))
                    .collect()
            }
        };

        let status = ExecutionStatus::aggregate(&target_results);
        let error = match status {
            ExecutionStatus::Success => None,
            _ => Some(describe_failure(&target_results)),
        };

        ExecutionRecord {
            id: Uuid::now_v7().to_string(),
            schedule_id: schedule.id.clone(),
            executed_at,
            duration_ms: started.elapsed().as_millis() as u64,
            status,
            target_results,
            error,
        }
    }

    async fn run_targets(
        &self,
        schedule: &Schedule,
        window: &ExecutionWindow,
    ) -> Vec<TargetResult> {
        let mut results = Vec::with_capacity(schedule.targets.len());

        for target in &schedule.targets {
            let req = SummaryRequest {
                target_id: target.target_id.clone(),
                target_name: target.target_name.clone(),
                start_utc: window.start_iso(),
                end_utc: window.end_iso(),
                timezone: schedule.timezone.clone(),
                options: schedule.options.clone(),
            };

            let call = self.summarizer.summarize(&req);
            let outcome = match tokio::time::timeout(self.target_timeout, call).await {
                Ok(outcome) => outcome,
                Err(_) => Err(SummarizerError::Timeout {
                    secs: self.target_timeout.as_secs(),
                }),
            };

            let result = match outcome {
                Ok(outcome) => match outcome.usable_id() {
                    Some(id) => {
                        debug!(
                            schedule_id = %schedule.id,
                            target_id = %target.target_id,
                            result_id = %id,
                            cached = outcome.cached,
                            "target summarised"
                        );
                        TargetResult::success(target, id.to_string())
                    }
                    None => TargetResult::skipped(target, "no identifier returned"),
                },
                Err(e) => {
                    warn!(
                        schedule_id = %schedule.id,
                        target_id = %target.target_id,
                        summarizer = %self.summarizer.name(),
                        err = %e,
                        "target failed"
                    );
                    TargetResult::failed(target, e.to_string())
                }
            };
            results.push(result);
        }

        results
    }
}

/// `"<n>/<total> targets did not succeed: <first error>"`.
fn describe_failure(results: &[TargetResult]) -> String {
    if results.is_empty() {
        return "schedule has no targets".to_string();
    }
    let failed: Vec<&TargetResult> = results
        .iter()
        .filter(|r| r.status != TargetStatus::Success)
        .collect();
    let first = failed
        .first()
        .and_then(|r| r.error.as_deref())
        .unwrap_or("unknown error");
    format!(
        "{}/{} targets did not succeed: {first}",
        failed.len(),
        results.len()
    )
}
