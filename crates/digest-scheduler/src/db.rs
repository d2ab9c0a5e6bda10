use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `digest_schedules` and `digest_executions` tables (idempotent)
/// plus the index the due-query walks. Timestamps are fixed-width UTC
/// strings, so `next_execution_at <= ?` compares correctly as text.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS digest_schedules (
            id                    TEXT    NOT NULL PRIMARY KEY,
            user_id               TEXT    NOT NULL,
            name                  TEXT    NOT NULL,
            description           TEXT,
            run_at                TEXT    NOT NULL,   -- HH:MM wall clock
            timezone              TEXT    NOT NULL,   -- IANA name
            frequency             TEXT    NOT NULL DEFAULT 'daily',
            status                TEXT    NOT NULL DEFAULT 'active',
            targets               TEXT    NOT NULL,   -- JSON array of {target_id, target_name}
            options               TEXT    NOT NULL DEFAULT 'null',  -- opaque JSON
            max_retries           INTEGER NOT NULL DEFAULT 0,
            fail_count            INTEGER NOT NULL DEFAULT 0,
            consecutive_failures  INTEGER NOT NULL DEFAULT 0,
            last_execution_at     TEXT,
            last_execution_status TEXT,
            next_execution_at     TEXT    NOT NULL,
            created_at            TEXT    NOT NULL,
            updated_at            TEXT    NOT NULL,
            version               INTEGER NOT NULL DEFAULT 0   -- bumped on every write
        ) STRICT;

        -- Polling: WHERE status = 'active' AND next_execution_at <= ? ORDER BY next_execution_at
        CREATE INDEX IF NOT EXISTS idx_digest_schedules_due
            ON digest_schedules (status, next_execution_at);
        CREATE INDEX IF NOT EXISTS idx_digest_schedules_user
            ON digest_schedules (user_id);

        CREATE TABLE IF NOT EXISTS digest_executions (
            id             TEXT    NOT NULL PRIMARY KEY,
            schedule_id    TEXT    NOT NULL,
            seq            INTEGER NOT NULL,   -- per-schedule, newest = highest
            executed_at    TEXT    NOT NULL,
            duration_ms    INTEGER NOT NULL,
            status         TEXT    NOT NULL,
            target_results TEXT    NOT NULL,   -- JSON array, target order preserved
            error          TEXT,
            UNIQUE (schedule_id, seq)
        ) STRICT;
        ",
    )?;
    Ok(())
}
