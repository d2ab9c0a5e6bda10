//! Zoned time resolution: wall-clock `HH:MM` in an IANA zone → UTC instants.
//!
//! All timezone arithmetic lives here so the rest of the crate only ever
//! sees `DateTime<Utc>`.

use std::str::FromStr;

use chrono::{
    DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, Offset, SecondsFormat,
    TimeZone, Utc,
};
use chrono_tz::Tz;

use crate::error::{Result, SchedulerError};

/// How far before a DST gap to look for the offset that was in effect.
const GAP_LOOKBACK_HOURS: i64 = 3;

/// A wall-clock time of day, parsed from `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunAt {
    hour: u32,
    minute: u32,
}

impl RunAt {
    pub fn new(hour: u32, minute: u32) -> Result<Self> {
        if hour > 23 || minute > 59 {
            return Err(SchedulerError::InvalidRunAt(format!("{hour}:{minute}")));
        }
        Ok(Self { hour, minute })
    }

    fn time(&self) -> NaiveTime {
        // hour/minute are range-checked in `new`
        NaiveTime::from_hms_opt(self.hour, self.minute, 0).unwrap_or(NaiveTime::MIN)
    }
}

impl FromStr for RunAt {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || SchedulerError::InvalidRunAt(s.to_string());
        let (h, m) = s.split_once(':').ok_or_else(invalid)?;
        let digits = |p: &str| p.bytes().all(|b| b.is_ascii_digit());
        if h.is_empty() || h.len() > 2 || m.len() != 2 || !digits(h) || !digits(m) {
            return Err(invalid());
        }
        let hour: u32 = h.parse().map_err(|_| invalid())?;
        let minute: u32 = m.parse().map_err(|_| invalid())?;
        RunAt::new(hour, minute).map_err(|_| invalid())
    }
}

impl std::fmt::Display for RunAt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Parse an IANA timezone name such as `Asia/Jerusalem`.
pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| SchedulerError::InvalidTimezone(name.to_string()))
}

/// The previous local calendar day, as UTC bounds (both inclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionWindow {
    pub start_utc: DateTime<Utc>,
    pub end_utc: DateTime<Utc>,
}

impl ExecutionWindow {
    pub fn start_iso(&self) -> String {
        to_utc_string(self.start_utc)
    }

    pub fn end_iso(&self) -> String {
        to_utc_string(self.end_utc)
    }
}

/// Fixed-width RFC 3339 with milliseconds and a `Z` suffix.
///
/// Every stored timestamp uses this form, so string order equals time order.
pub fn to_utc_string(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Compute the next UTC execution time for a daily `run_at` in `timezone`,
/// strictly after `from`.
///
/// A candidate equal to `from` counts as already run and rolls to the next
/// day, so two polls can never both treat the same instant as due.
pub fn compute_next_execution(
    run_at: &str,
    timezone: &str,
    from: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let run_at: RunAt = run_at.parse()?;
    let tz = parse_timezone(timezone)?;
    next_occurrence(run_at, tz, from)
}

/// Typed form of [`compute_next_execution`].
pub fn next_occurrence(run_at: RunAt, tz: Tz, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let today = from.with_timezone(&tz).date_naive();
    let candidate = resolve_local(tz, today.and_time(run_at.time()))?;
    if candidate > from {
        return Ok(candidate);
    }

    // Same wall-clock time on the next local day, not +24h.
    let tomorrow = next_day(today)?;
    resolve_local(tz, tomorrow.and_time(run_at.time()))
}

/// The full local calendar day before `trigger`, `00:00:00.000`–`23:59:59.999`.
pub fn execution_window(trigger: DateTime<Utc>, timezone: &str) -> Result<ExecutionWindow> {
    let tz = parse_timezone(timezone)?;
    window_for(trigger, tz)
}

pub fn window_for(trigger: DateTime<Utc>, tz: Tz) -> Result<ExecutionWindow> {
    let day = trigger.with_timezone(&tz).date_naive();
    let previous = day.pred_opt().ok_or_else(|| out_of_range(day))?;

    let start_utc = resolve_local(tz, previous.and_time(NaiveTime::MIN))?;
    let day_start = resolve_local(tz, day.and_time(NaiveTime::MIN))?;
    Ok(ExecutionWindow {
        start_utc,
        end_utc: day_start - Duration::milliseconds(1),
    })
}

fn next_day(day: NaiveDate) -> Result<NaiveDate> {
    day.succ_opt().ok_or_else(|| out_of_range(day))
}

fn out_of_range(day: NaiveDate) -> SchedulerError {
    SchedulerError::InvalidSchedule(format!("date out of range near {day}"))
}

/// Map a local wall-clock time to an instant.
///
/// Overlap (clocks fall back): the earlier instant wins.
/// Gap (clocks spring forward): the pre-transition offset is kept, which
/// shifts the wall time forward by the gap length (02:30 → 03:30).
fn resolve_local(tz: Tz, local: NaiveDateTime) -> Result<DateTime<Utc>> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Ok(earliest.with_timezone(&Utc)),
        LocalResult::None => {
            let before = local - Duration::hours(GAP_LOOKBACK_HOURS);
            let offset = tz
                .offset_from_local_datetime(&before)
                .earliest()
                .ok_or_else(|| {
                    SchedulerError::InvalidSchedule(format!("no valid local time near {local} in {tz}"))
                })?
                .fix();
            let utc = local - Duration::seconds(i64::from(offset.local_minus_utc()));
            Ok(Utc.from_utc_datetime(&utc))
        }
    }
}
