use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::{CounterStore, QuotaError};

#[derive(Debug, Clone, PartialEq, Eq)]
struct DayCount {
    day: String,
    count: u64,
}

/// Process-local counters. Each instance keeps its own budget, so a fleet
/// of N instances can hand out up to N times the limit.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    buckets: DashMap<String, DayCount>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(
        &self,
        bucket: &str,
        day: &str,
        _expire_at: DateTime<Utc>,
    ) -> Result<u64, QuotaError> {
        // The shard lock is held for the whole read-modify-write.
        let mut entry = self
            .buckets
            .entry(bucket.to_string())
            .or_insert_with(|| DayCount {
                day: day.to_string(),
                count: 0,
            });
        // One day per bucket: any other day, earlier or later, starts over.
        if day != entry.day {
            entry.day = day.to_string();
            entry.count = 0;
        }
        entry.count += 1;
        Ok(entry.count)
    }

    fn is_shared(&self) -> bool {
        false
    }
}
