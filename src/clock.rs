use std::sync::Mutex;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::model::{Ms, SlotTime, Span};

/// Source of "now". Injected so tests can move time across UTC midnight.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests and benchmarks.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClockError {
    #[error("local time {date} {time} does not exist in {zone}")]
    NonexistentLocalTime {
        date: NaiveDate,
        time: SlotTime,
        zone: Tz,
    },
}

/// Converts local desk dates and times to absolute instants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Zone {
    tz: Tz,
}

impl Zone {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn tz(&self) -> Tz {
        self.tz
    }

    /// Ambiguous local times (clocks turned back) resolve to the earlier instant.
    pub fn local_to_instant(&self, date: NaiveDate, time: SlotTime) -> Result<Ms, ClockError> {
        self.tz
            .from_local_datetime(&date.and_time(time.time()))
            .earliest()
            .map(|dt| dt.timestamp_millis())
            .ok_or(ClockError::NonexistentLocalTime {
                date,
                time,
                zone: self.tz,
            })
    }

    /// `[start, start + duration)` for a slot on a local date.
    pub fn slot_span(
        &self,
        date: NaiveDate,
        time: SlotTime,
        duration: Duration,
    ) -> Result<Span, ClockError> {
        let start = self.local_to_instant(date, time)?;
        Ok(Span::new(start, start + duration.num_milliseconds()))
    }

    /// The local calendar day as an absolute window, local midnight to local midnight.
    pub fn day_window(&self, date: NaiveDate) -> Span {
        let next = date.succ_opt().unwrap_or(date);
        let start = self.midnight(date);
        let end = self.midnight(next);
        if end > start {
            Span::new(start, end)
        } else {
            Span::new(start, start + 24 * 60 * crate::model::MINUTE_MS)
        }
    }

    /// Local midnight. Zones that skip midnight get the first valid half hour after it.
    fn midnight(&self, date: NaiveDate) -> Ms {
        let naive = date.and_time(NaiveTime::MIN);
        (0..=6)
            .find_map(|step| {
                self.tz
                    .from_local_datetime(&(naive + Duration::minutes(30 * step)))
                    .earliest()
            })
            .map_or_else(|| naive.and_utc().timestamp_millis(), |dt| dt.timestamp_millis())
    }
}

/// Unix milliseconds back to a UTC timestamp.
pub fn instant(ms: Ms) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// UTC calendar day key, e.g. `2026-03-10`.
pub fn utc_day_key(now: DateTime<Utc>) -> String {
    now.date_naive().format("%Y-%m-%d").to_string()
}

pub fn start_of_next_utc_day(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive().succ_opt().unwrap_or(now.date_naive());
    tomorrow.and_time(NaiveTime::MIN).and_utc()
}

/// Whole seconds until `instant`, never less than 1.
pub fn seconds_until(instant: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let millis = (instant - now).num_milliseconds();
    let secs = (millis + 999).div_euclid(1000);
    u64::try_from(secs).unwrap_or(0).max(1)
}
