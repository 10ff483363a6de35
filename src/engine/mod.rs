mod availability;
mod error;
mod fallback;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use availability::{free_slots, merge_overlapping, normalize_busy, slot_is_free};
pub use error::EngineError;
pub use fallback::{DEFAULT_SLOTS, FallbackPolicy};

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{Duration, NaiveDate};
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::calendar::{CalendarError, CalendarProvider};
use crate::clock::Zone;
use crate::desk::{DeskId, DeskRegistry};
use crate::model::SlotTime;

pub const DEFAULT_SLOT_MINUTES: i64 = 45;
pub const DEFAULT_UPSTREAM_TIMEOUT: StdDuration = StdDuration::from_secs(5);

/// Identifies one bookable slot for in-process write serialisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SlotKey {
    desk: DeskId,
    date: NaiveDate,
    time: SlotTime,
}

/// A booking's claim on one slot lock. Dropping it, including when the
/// booking future is cancelled, removes the map entry once nobody else holds it.
struct SlotLease<'a> {
    locks: &'a DashMap<SlotKey, Arc<Mutex<()>>>,
    key: SlotKey,
    lock: Arc<Mutex<()>>,
}

impl<'a> SlotLease<'a> {
    fn acquire(locks: &'a DashMap<SlotKey, Arc<Mutex<()>>>, key: SlotKey) -> Self {
        let lock = locks.entry(key).or_default().clone();
        Self { locks, key, lock }
    }

    fn lock(&self) -> &Mutex<()> {
        &self.lock
    }
}

impl Drop for SlotLease<'_> {
    fn drop(&mut self) {
        // Two references left: the map's and this lease's.
        self.locks
            .remove_if(&self.key, |_, l| Arc::strong_count(l) == 2 && Arc::ptr_eq(l, &self.lock));
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub zone: Zone,
    pub fallback: FallbackPolicy,
    pub slot_duration: Duration,
    /// Upper bound on every calendar call, on top of the HTTP client's own timeout.
    pub upstream_timeout: StdDuration,
}

impl EngineSettings {
    pub fn new(zone: Zone) -> Self {
        Self {
            zone,
            fallback: FallbackPolicy::default(),
            slot_duration: Duration::minutes(DEFAULT_SLOT_MINUTES),
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
        }
    }
}

/// Availability and booking against per-desk external calendars.
pub struct Engine {
    registry: DeskRegistry,
    /// `None` when no calendar credentials are configured; every desk is then in fallback.
    calendar: Option<Arc<dyn CalendarProvider>>,
    settings: EngineSettings,
    /// Per-slot write locks; entries are removed once no booking holds them.
    slot_locks: DashMap<SlotKey, Arc<Mutex<()>>>,
}

impl Engine {
    pub fn new(
        registry: DeskRegistry,
        calendar: Option<Arc<dyn CalendarProvider>>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            registry,
            calendar,
            settings,
            slot_locks: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &DeskRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Calendar reference and provider, if this desk has a live integration.
    pub(super) fn live_calendar(&self, id: DeskId) -> Result<Option<(&str, &dyn CalendarProvider)>, EngineError> {
        let desk = self.registry.get(id)?;
        Ok(match (desk.calendar.as_deref(), self.calendar.as_deref()) {
            (Some(reference), Some(provider)) => Some((reference, provider)),
            _ => None,
        })
    }

    /// Run one calendar call under the upstream timeout, recording latency and failures.
    pub(super) async fn call_upstream<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = Result<T, CalendarError>>,
    ) -> Result<T, CalendarError> {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.settings.upstream_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(CalendarError::Timeout {
                timeout_ms: u64::try_from(self.settings.upstream_timeout.as_millis())
                    .unwrap_or(u64::MAX),
            }),
        };
        metrics::histogram!(crate::observability::UPSTREAM_DURATION_SECONDS, "op" => op)
            .record(started.elapsed().as_secs_f64());
        if result.is_err() {
            metrics::counter!(crate::observability::UPSTREAM_FAILURES_TOTAL, "op" => op)
                .increment(1);
        }
        result
    }
}
