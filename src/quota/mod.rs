//! Daily usage budget for metered resources.
//!
//! A bucket is "at most N units per UTC calendar day". The ledger does not
//! know what a bucket guards; callers pick the name and the limit.

mod memory;
mod rest;

pub use memory::MemoryCounterStore;
pub use rest::RestCounterStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::clock::{Clock, seconds_until, start_of_next_utc_day, utc_day_key};
use crate::limits::MAX_BUCKET_NAME_LEN;

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("daily limit must be at least 1")]
    InvalidLimit,

    #[error("invalid quota bucket name: {0:?}")]
    InvalidBucket(String),

    #[error("counter store transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("counter store unavailable: {0}")]
    Store(String),
}

/// Answer to one reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub allowed: bool,
    /// Seconds until the next UTC midnight, when the bucket starts over.
    pub retry_after_seconds: u64,
}

/// Shared counter keyed by bucket and UTC day.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add one to the bucket's counter for `day` and return the new
    /// value. A counter first created by this call expires at `expire_at`;
    /// later calls never move an existing expiry.
    async fn increment(
        &self,
        bucket: &str,
        day: &str,
        expire_at: DateTime<Utc>,
    ) -> Result<u64, QuotaError>;

    /// Whether the counter is visible to other service instances.
    fn is_shared(&self) -> bool;
}

pub struct QuotaLedger {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn is_shared(&self) -> bool {
        self.store.is_shared()
    }

    /// Consume one unit of `bucket` for today if fewer than `limit` have been used.
    ///
    /// Denied calls still count, so the counter only grows within a day.
    pub async fn reserve(&self, bucket: &str, limit: u32) -> Result<Reservation, QuotaError> {
        if limit == 0 {
            return Err(QuotaError::InvalidLimit);
        }
        validate_bucket(bucket)?;

        let now = self.clock.now();
        let day = utc_day_key(now);
        let next_midnight = start_of_next_utc_day(now);

        let count = match self.store.increment(bucket, &day, next_midnight).await {
            Ok(count) => count,
            Err(e) => {
                metrics::counter!(crate::observability::QUOTA_RESERVATIONS_TOTAL, "outcome" => "error")
                    .increment(1);
                return Err(e);
            }
        };
        let allowed = count <= u64::from(limit);
        let retry_after_seconds = seconds_until(next_midnight, now);

        if allowed {
            debug!(bucket, day = %day, count, limit, "quota reserved");
            metrics::counter!(crate::observability::QUOTA_RESERVATIONS_TOTAL, "outcome" => "allowed")
                .increment(1);
        } else {
            info!(bucket, day = %day, count, limit, retry_after_seconds, "daily quota exhausted");
            metrics::counter!(crate::observability::QUOTA_RESERVATIONS_TOTAL, "outcome" => "denied")
                .increment(1);
        }
        Ok(Reservation {
            allowed,
            retry_after_seconds,
        })
    }
}

/// Lower-case ASCII letters, digits, `_` and `-`; safe inside a counter key.
pub fn is_valid_bucket_name(bucket: &str) -> bool {
    !bucket.is_empty()
        && bucket.len() <= MAX_BUCKET_NAME_LEN
        && bucket
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

fn validate_bucket(bucket: &str) -> Result<(), QuotaError> {
    if is_valid_bucket_name(bucket) {
        Ok(())
    } else {
        Err(QuotaError::InvalidBucket(bucket.to_string()))
    }
}
