use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::{
    db::init_db,
    error::{Result, SchedulerError},
    schedule::{compute_next_execution, parse_timezone, to_utc_string, RunAt},
    types::{
        ExecutionRecord, ExecutionStatus, Frequency, NewSchedule, Schedule, SchedulePatch,
        ScheduleStatus, Target, TargetResult, MAX_HISTORY,
    },
};

/// Persistence seam used by the engine.
///
/// Implementations must apply [`ScheduleStore::atomic_update`] as a single
/// atomic write: the patch and the history prepend land together or not at all.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Active schedules with `next_execution_at <= now`, oldest due first.
    ///
    /// Rows that cannot be decoded are paused and left out, so they never
    /// hold a batch slot.
    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Schedule>>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Schedule>>;

    /// Apply `patch` and prepend `record` to the history, truncating it to
    /// [`MAX_HISTORY`]. Fails with `ConcurrentUpdate` when any other write
    /// has touched the row since `patch.expected_version` was read.
    async fn atomic_update(
        &self,
        id: &str,
        patch: &SchedulePatch,
        record: &ExecutionRecord,
    ) -> Result<()>;
}

const SCHEDULE_COLUMNS: &str = "id, user_id, name, description, run_at, timezone, frequency,
     status, targets, options, max_retries, fail_count, consecutive_failures,
     last_execution_at, last_execution_status, next_execution_at, created_at, updated_at,
     version";

/// SQLite-backed schedule store.
///
/// Wraps a single connection in a `Mutex`; every method takes the lock for
/// one statement or one transaction and releases it before returning.
pub struct SqliteScheduleStore {
    db: Mutex<Connection>,
}

impl SqliteScheduleStore {
    /// Wrap `conn`, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Validate and persist a new schedule in `active` status.
    ///
    /// `next_execution_at` is the first `run_at` strictly after `now`.
    #[instrument(skip(self, new), fields(user_id = %new.user_id, name = %new.name))]
    pub fn create(&self, new: NewSchedule, now: DateTime<Utc>) -> Result<Schedule> {
        let run_at: RunAt = new.run_at.parse()?;
        parse_timezone(&new.timezone)?;
        if new.name.trim().is_empty() {
            return Err(SchedulerError::InvalidSchedule("name must not be empty".into()));
        }
        if new.targets.is_empty() {
            return Err(SchedulerError::InvalidSchedule(
                "at least one target is required".into(),
            ));
        }
        if new.targets.iter().any(|t| t.target_id.trim().is_empty()) {
            return Err(SchedulerError::InvalidSchedule(
                "target_id must not be empty".into(),
            ));
        }

        let run_at = run_at.to_string();
        let next = compute_next_execution(&run_at, &new.timezone, now)?;
        let id = Uuid::now_v7().to_string();
        let now_str = to_utc_string(now);

        self.conn().execute(
            "INSERT INTO digest_schedules
             (id, user_id, name, description, run_at, timezone, frequency, status,
              targets, options, max_retries, fail_count, consecutive_failures,
              last_execution_at, last_execution_status, next_execution_at,
              created_at, updated_at, version)
             VALUES (?1,?2,?3,?4,?5,?6,?7,'active',?8,?9,?10,0,0,NULL,NULL,?11,?12,?12,0)",
            params![
                id,
                new.user_id,
                new.name,
                new.description,
                run_at,
                new.timezone,
                Frequency::Daily.to_string(),
                serde_json::to_string(&new.targets)?,
                serde_json::to_string(&new.options)?,
                new.max_retries,
                to_utc_string(next),
                now_str,
            ],
        )?;

        info!(schedule_id = %id, next_execution_at = %next, "schedule created");

        Ok(Schedule {
            id,
            user_id: new.user_id,
            name: new.name,
            description: new.description,
            run_at,
            timezone: new.timezone,
            frequency: Frequency::Daily,
            status: ScheduleStatus::Active,
            targets: new.targets,
            options: new.options,
            max_retries: new.max_retries,
            fail_count: 0,
            consecutive_failures: 0,
            last_execution_at: None,
            last_execution_status: None,
            next_execution_at: next,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
            version: 0,
        })
    }

    /// Fetch one schedule with its history, or `None`.
    pub fn get(&self, id: &str) -> Result<Option<Schedule>> {
        let db = self.conn();
        let row = db
            .query_row(
                &format!("SELECT {SCHEDULE_COLUMNS} FROM digest_schedules WHERE id = ?1"),
                [id],
                read_schedule_row,
            )
            .optional()?;
        match row {
            Some(row) => {
                let history = load_history(&db, id)?;
                Ok(Some(row.into_schedule(history)?))
            }
            None => Ok(None),
        }
    }

    /// All schedules owned by `user_id`, oldest first.
    pub fn list_for_user(&self, user_id: &str) -> Result<Vec<Schedule>> {
        self.list_where("WHERE user_id = ?1", params![user_id])
    }

    /// Every schedule in the store, oldest first.
    pub fn list_all(&self) -> Result<Vec<Schedule>> {
        self.list_where("", params![])
    }

    fn list_where(&self, clause: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Schedule>> {
        let db = self.conn();
        let mut stmt = db.prepare(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM digest_schedules {clause} ORDER BY created_at, id"
        ))?;
        let rows: Vec<ScheduleRow> = stmt
            .query_map(args, read_schedule_row)?
            .collect::<rusqlite::Result<_>>()?;

        let mut schedules = Vec::with_capacity(rows.len());
        for row in rows {
            let history = load_history(&db, &row.id)?;
            schedules.push(row.into_schedule(history)?);
        }
        Ok(schedules)
    }

    /// Pause or resume a schedule.
    ///
    /// Resuming recomputes `next_execution_at` from `now` and clears
    /// `consecutive_failures`, so a resumed schedule neither fires for a
    /// slot it missed while paused nor re-pauses on its next failure.
    #[instrument(skip(self))]
    pub fn set_status(
        &self,
        id: &str,
        status: ScheduleStatus,
        now: DateTime<Utc>,
    ) -> Result<Schedule> {
        let current = self
            .get(id)?
            .ok_or_else(|| SchedulerError::ScheduleNotFound { id: id.to_string() })?;
        let now_str = to_utc_string(now);

        match status {
            ScheduleStatus::Paused => {
                self.conn().execute(
                    "UPDATE digest_schedules
                     SET status = 'paused', updated_at = ?1, version = version + 1
                     WHERE id = ?2",
                    params![now_str, id],
                )?;
            }
            ScheduleStatus::Active => {
                let next = compute_next_execution(&current.run_at, &current.timezone, now)?;
                self.conn().execute(
                    "UPDATE digest_schedules
                     SET status = 'active', consecutive_failures = 0,
                         next_execution_at = ?1, updated_at = ?2, version = version + 1
                     WHERE id = ?3",
                    params![to_utc_string(next), now_str, id],
                )?;
            }
        }
        info!(schedule_id = %id, %status, "schedule status changed");

        self.get(id)?
            .ok_or_else(|| SchedulerError::ScheduleNotFound { id: id.to_string() })
    }

    /// Remove a schedule and its history. Returns `ScheduleNotFound` if no row is deleted.
    #[instrument(skip(self))]
    pub fn delete(&self, id: &str) -> Result<()> {
        let mut db = self.conn();
        let tx = db.transaction()?;
        tx.execute("DELETE FROM digest_executions WHERE schedule_id = ?1", [id])?;
        let n = tx.execute("DELETE FROM digest_schedules WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::ScheduleNotFound { id: id.to_string() });
        }
        tx.commit()?;
        info!(schedule_id = %id, "schedule deleted");
        Ok(())
    }

    fn query_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Schedule>> {
        let db = self.conn();
        let mut stmt = db.prepare_cached(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM digest_schedules
             WHERE status = 'active' AND next_execution_at <= ?1
             ORDER BY next_execution_at ASC
             LIMIT ?2"
        ))?;
        let rows: Vec<ScheduleRow> = stmt
            .query_map(params![to_utc_string(now), limit as i64], read_schedule_row)?
            .collect::<rusqlite::Result<_>>()?;

        drop(stmt);

        let mut due = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id.clone();
            // One corrupt row must not stall every other schedule.
            match load_history(&db, &id).and_then(|history| row.into_schedule(history)) {
                Ok(schedule) => due.push(schedule),
                Err(e) => {
                    error!(schedule_id = %id, "pausing undecodable schedule: {e}");
                    if let Err(e) = quarantine(&db, &id, now) {
                        error!(schedule_id = %id, "cannot pause undecodable schedule: {e}");
                    }
                }
            }
        }
        Ok(due)
    }

    fn apply_update(
        &self,
        id: &str,
        patch: &SchedulePatch,
        record: &ExecutionRecord,
    ) -> Result<()> {
        let mut db = self.conn();
        let tx = db.transaction()?;

        let n = tx.execute(
            "UPDATE digest_schedules
             SET status = ?1, fail_count = ?2, consecutive_failures = ?3,
                 last_execution_at = ?4, last_execution_status = ?5,
                 next_execution_at = ?6, updated_at = ?7, version = version + 1
             WHERE id = ?8 AND version = ?9",
            params![
                patch.status.to_string(),
                patch.fail_count,
                patch.consecutive_failures,
                to_utc_string(patch.last_execution_at),
                patch.last_execution_status.to_string(),
                to_utc_string(patch.next_execution_at),
                to_utc_string(Utc::now()),
                id,
                patch.expected_version,
            ],
        )?;
        if n == 0 {
            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM digest_schedules WHERE id = ?1)",
                [id],
                |row| row.get(0),
            )?;
            // dropping `tx` rolls back
            return Err(if exists {
                SchedulerError::ConcurrentUpdate { id: id.to_string() }
            } else {
                SchedulerError::ScheduleNotFound { id: id.to_string() }
            });
        }

        tx.execute(
            "INSERT INTO digest_executions
             (id, schedule_id, seq, executed_at, duration_ms, status, target_results, error)
             VALUES (?1, ?2,
                     (SELECT COALESCE(MAX(seq), 0) + 1 FROM digest_executions WHERE schedule_id = ?2),
                     ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id,
                id,
                to_utc_string(record.executed_at),
                record.duration_ms as i64,
                record.status.to_string(),
                serde_json::to_string(&record.target_results)?,
                record.error,
            ],
        )?;

        tx.execute(
            "DELETE FROM digest_executions
             WHERE schedule_id = ?1
               AND seq NOT IN (
                   SELECT seq FROM digest_executions
                   WHERE schedule_id = ?1
                   ORDER BY seq DESC
                   LIMIT ?2)",
            params![id, MAX_HISTORY as i64],
        )?;

        tx.commit()?;
        Ok(())
    }
}

#[async_trait]
impl ScheduleStore for SqliteScheduleStore {
    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Schedule>> {
        self.query_due(now, limit)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Schedule>> {
        self.get(id)
    }

    async fn atomic_update(
        &self,
        id: &str,
        patch: &SchedulePatch,
        record: &ExecutionRecord,
    ) -> Result<()> {
        self.apply_update(id, patch, record)
    }
}

/// Raw column values, decoded into a [`Schedule`] outside the row callback
/// so JSON and timestamp errors surface as `SchedulerError`.
struct ScheduleRow {
    id: String,
    user_id: String,
    name: String,
    description: Option<String>,
    run_at: String,
    timezone: String,
    frequency: String,
    status: String,
    targets: String,
    options: String,
    max_retries: u32,
    fail_count: u32,
    consecutive_failures: u32,
    last_execution_at: Option<String>,
    last_execution_status: Option<String>,
    next_execution_at: String,
    created_at: String,
    updated_at: String,
    version: i64,
}

fn read_schedule_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduleRow> {
    Ok(ScheduleRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        run_at: row.get(4)?,
        timezone: row.get(5)?,
        frequency: row.get(6)?,
        status: row.get(7)?,
        targets: row.get(8)?,
        options: row.get(9)?,
        max_retries: row.get(10)?,
        fail_count: row.get(11)?,
        consecutive_failures: row.get(12)?,
        last_execution_at: row.get(13)?,
        last_execution_status: row.get(14)?,
        next_execution_at: row.get(15)?,
        created_at: row.get(16)?,
        updated_at: row.get(17)?,
        version: row.get(18)?,
    })
}

impl ScheduleRow {
    fn into_schedule(self, history: Vec<ExecutionRecord>) -> Result<Schedule> {
        let targets: Vec<Target> = serde_json::from_str(&self.targets)?;
        let options: serde_json::Value = serde_json::from_str(&self.options)?;
        Ok(Schedule {
            frequency: self.frequency.parse().map_err(SchedulerError::InvalidSchedule)?,
            status: self.status.parse().map_err(SchedulerError::InvalidSchedule)?,
            last_execution_at: self
                .last_execution_at
                .as_deref()
                .map(|s| parse_ts("last_execution_at", s))
                .transpose()?,
            last_execution_status: self
                .last_execution_status
                .as_deref()
                .map(|s| s.parse().map_err(SchedulerError::InvalidSchedule))
                .transpose()?,
            next_execution_at: parse_ts("next_execution_at", &self.next_execution_at)?,
            created_at: parse_ts("created_at", &self.created_at)?,
            updated_at: parse_ts("updated_at", &self.updated_at)?,
            id: self.id,
            user_id: self.user_id,
            name: self.name,
            description: self.description,
            run_at: self.run_at,
            timezone: self.timezone,
            targets,
            options,
            max_retries: self.max_retries,
            fail_count: self.fail_count,
            consecutive_failures: self.consecutive_failures,
            history,
            version: self.version,
        })
    }
}

/// Take a schedule out of the due set without reading its columns.
fn quarantine(db: &Connection, id: &str, now: DateTime<Utc>) -> Result<()> {
    db.execute(
        "UPDATE digest_schedules
         SET status = 'paused', updated_at = ?1, version = version + 1
         WHERE id = ?2",
        params![to_utc_string(now), id],
    )?;
    Ok(())
}

/// History for one schedule, newest first. Records that fail to decode are
/// logged and left out.
fn load_history(db: &Connection, schedule_id: &str) -> Result<Vec<ExecutionRecord>> {
    let mut stmt = db.prepare_cached(
        "SELECT id, executed_at, duration_ms, status, target_results, error
         FROM digest_executions
         WHERE schedule_id = ?1
         ORDER BY seq DESC
         LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![schedule_id, MAX_HISTORY as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,         // id
                row.get::<_, String>(1)?,         // executed_at
                row.get::<_, i64>(2)?,            // duration_ms
                row.get::<_, String>(3)?,         // status
                row.get::<_, String>(4)?,         // target_results JSON
                row.get::<_, Option<String>>(5)?, // error
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut history = Vec::with_capacity(rows.len());
    for (id, executed_at, duration_ms, status, results_json, error) in rows {
        match decode_execution(&executed_at, &status, &results_json) {
            Ok((executed_at, status, target_results)) => history.push(ExecutionRecord {
                id,
                schedule_id: schedule_id.to_string(),
                executed_at,
                duration_ms: duration_ms.max(0) as u64,
                status,
                target_results,
                error,
            }),
            Err(e) => error!(
                schedule_id = %schedule_id,
                record_id = %id,
                "skipping undecodable execution: {e}"
            ),
        }
    }
    Ok(history)
}

fn decode_execution(
    executed_at: &str,
    status: &str,
    results_json: &str,
) -> Result<(DateTime<Utc>, ExecutionStatus, Vec<TargetResult>)> {
    let executed_at = parse_ts("executed_at", executed_at)?;
    let status: ExecutionStatus = status.parse().map_err(SchedulerError::InvalidSchedule)?;
    let target_results: Vec<TargetResult> = serde_json::from_str(results_json)?;
    Ok((executed_at, status, target_results))
}

fn parse_ts(field: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SchedulerError::InvalidSchedule(format!("bad {field} {value:?}: {e}")))
}
