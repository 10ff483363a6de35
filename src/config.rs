//! Startup configuration from `SLOTWISE_*` environment variables.
//!
//! Every variable has a default except credentials. A value that is present
//! but malformed is an error; nothing falls back silently.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono_tz::Tz;
use strum::IntoEnumIterator;
use thiserror::Error;

use crate::calendar::{
    CalendarError, CalendarProvider, DEFAULT_API_BASE, GoogleCalendar, ServiceAccount,
    ServiceAccountKey, StaticToken, TokenSource,
};
use crate::clock::{Clock, Zone};
use crate::desk::{DeskId, DeskRegistry};
use crate::engine::{DEFAULT_SLOT_MINUTES, DEFAULT_UPSTREAM_TIMEOUT, EngineSettings, FallbackPolicy};
use crate::limits::MAX_CANDIDATE_SLOTS;
use crate::model::SlotTime;
use crate::quota::{CounterStore, MemoryCounterStore, QuotaError, RestCounterStore, is_valid_bucket_name};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_TIMEZONE: &str = "Asia/Tokyo";
pub const DEFAULT_SLOTS: &str = "09:00,10:30,12:00,14:00,15:30,17:00";
pub const DEFAULT_QUOTA_BUCKETS: &str = "audio=300";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("desk calendars are configured but neither SLOTWISE_CALENDAR_TOKEN nor SLOTWISE_CALENDAR_CREDENTIALS is set")]
    MissingCredentials,

    #[error("set only one of SLOTWISE_CALENDAR_TOKEN and SLOTWISE_CALENDAR_CREDENTIALS")]
    ConflictingCredentials,

    #[error("SLOTWISE_COUNTER_URL is set without SLOTWISE_COUNTER_TOKEN")]
    MissingCounterToken,

    #[error("SLOTWISE_REQUIRE_SHARED_COUNTER is set but SLOTWISE_COUNTER_URL is not")]
    SharedCounterRequired,

    #[error(transparent)]
    Calendar(#[from] CalendarError),

    #[error(transparent)]
    Quota(#[from] QuotaError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalendarAuth {
    Token(String),
    ServiceAccountFile(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterConfig {
    pub url: String,
    pub token: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub metrics_port: Option<u16>,
    pub timezone: Tz,
    pub slots: Vec<SlotTime>,
    pub slot_minutes: i64,
    pub upstream_timeout: Duration,
    pub desk_calendars: HashMap<DeskId, String>,
    pub calendar_api_base: String,
    pub calendar_auth: Option<CalendarAuth>,
    pub counter: Option<CounterConfig>,
    pub require_shared_counter: bool,
    /// Daily limit per metered bucket.
    pub quota_buckets: BTreeMap<String, u32>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let bind = get("SLOTWISE_BIND").unwrap_or_else(|| "0.0.0.0".into());
        let port = parse_opt(&get, "SLOTWISE_PORT")?.unwrap_or(DEFAULT_PORT);
        let metrics_port = parse_opt(&get, "SLOTWISE_METRICS_PORT")?;

        let tz_raw = get("SLOTWISE_TIMEZONE").unwrap_or_else(|| DEFAULT_TIMEZONE.into());
        let timezone: Tz = tz_raw
            .parse()
            .map_err(|e| invalid("SLOTWISE_TIMEZONE", &tz_raw, e))?;

        let slots_raw = get("SLOTWISE_SLOTS").unwrap_or_else(|| DEFAULT_SLOTS.into());
        let slots = parse_slots(&slots_raw)?;

        let slot_minutes: i64 =
            parse_opt(&get, "SLOTWISE_SLOT_MINUTES")?.unwrap_or(DEFAULT_SLOT_MINUTES);
        if !(1..=24 * 60).contains(&slot_minutes) {
            return Err(invalid(
                "SLOTWISE_SLOT_MINUTES",
                &slot_minutes.to_string(),
                "must be between 1 and 1440",
            ));
        }

        let upstream_timeout = match parse_opt::<u64>(&get, "SLOTWISE_UPSTREAM_TIMEOUT_MS")? {
            Some(0) => {
                return Err(invalid("SLOTWISE_UPSTREAM_TIMEOUT_MS", "0", "must be positive"));
            }
            Some(ms) => Duration::from_millis(ms),
            None => DEFAULT_UPSTREAM_TIMEOUT,
        };

        let desk_calendars: HashMap<DeskId, String> = DeskId::iter()
            .filter_map(|id| {
                let var = format!("SLOTWISE_CALENDAR_{}", id.as_ref().to_ascii_uppercase());
                get(&var).map(|calendar| (id, calendar))
            })
            .collect();

        let calendar_api_base =
            get("SLOTWISE_CALENDAR_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.into());
        let calendar_auth = match (
            get("SLOTWISE_CALENDAR_TOKEN"),
            get("SLOTWISE_CALENDAR_CREDENTIALS"),
        ) {
            (Some(_), Some(_)) => return Err(ConfigError::ConflictingCredentials),
            (Some(token), None) => Some(CalendarAuth::Token(token)),
            (None, Some(path)) => Some(CalendarAuth::ServiceAccountFile(PathBuf::from(path))),
            (None, None) => None,
        };
        if !desk_calendars.is_empty() && calendar_auth.is_none() {
            return Err(ConfigError::MissingCredentials);
        }

        let counter = match (get("SLOTWISE_COUNTER_URL"), get("SLOTWISE_COUNTER_TOKEN")) {
            (Some(url), Some(token)) => Some(CounterConfig { url, token }),
            (Some(_), None) => return Err(ConfigError::MissingCounterToken),
            (None, _) => None,
        };
        let require_shared_counter = match get("SLOTWISE_REQUIRE_SHARED_COUNTER") {
            Some(raw) => parse_bool("SLOTWISE_REQUIRE_SHARED_COUNTER", &raw)?,
            None => false,
        };
        if require_shared_counter && counter.is_none() {
            return Err(ConfigError::SharedCounterRequired);
        }

        let buckets_raw =
            get("SLOTWISE_QUOTA_BUCKETS").unwrap_or_else(|| DEFAULT_QUOTA_BUCKETS.into());
        let quota_buckets = parse_buckets(&buckets_raw)?;

        Ok(Self {
            bind,
            port,
            metrics_port,
            timezone,
            slots,
            slot_minutes,
            upstream_timeout,
            desk_calendars,
            calendar_api_base,
            calendar_auth,
            counter,
            require_shared_counter,
            quota_buckets,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn desk_registry(&self) -> DeskRegistry {
        DeskRegistry::new(self.desk_calendars.clone())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            zone: Zone::new(self.timezone),
            fallback: FallbackPolicy::new(self.slots.clone()),
            slot_duration: chrono::Duration::minutes(self.slot_minutes),
            upstream_timeout: self.upstream_timeout,
        }
    }

    /// The calendar client, or `None` when no credentials are configured.
    pub fn calendar_provider(
        &self,
        clock: Arc<dyn Clock>,
    ) -> Result<Option<Arc<dyn CalendarProvider>>, ConfigError> {
        let Some(auth) = &self.calendar_auth else {
            return Ok(None);
        };
        let tokens: Arc<dyn TokenSource> = match auth {
            CalendarAuth::Token(token) => Arc::new(StaticToken::new(token.clone())),
            CalendarAuth::ServiceAccountFile(path) => {
                let key = ServiceAccountKey::from_file(path)?;
                Arc::new(ServiceAccount::new(key, clock)?)
            }
        };
        let client: Arc<dyn CalendarProvider> = Arc::new(GoogleCalendar::new(
            &self.calendar_api_base,
            self.upstream_timeout,
            tokens,
        )?);
        Ok(Some(client))
    }

    pub fn counter_store(&self) -> Result<Arc<dyn CounterStore>, ConfigError> {
        let store: Arc<dyn CounterStore> = match &self.counter {
            Some(c) => Arc::new(RestCounterStore::new(&c.url, c.token.clone(), self.upstream_timeout)?),
            None => Arc::new(MemoryCounterStore::new()),
        };
        Ok(store)
    }
}

fn invalid(var: &'static str, value: &str, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_opt<T>(get: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(var)
        .map(|raw| raw.parse().map_err(|e| invalid(var, &raw, e)))
        .transpose()
}

fn parse_bool(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(var, raw, "expected true or false")),
    }
}

fn parse_slots(raw: &str) -> Result<Vec<SlotTime>, ConfigError> {
    let slots = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<SlotTime>().map_err(|e| invalid("SLOTWISE_SLOTS", raw, e)))
        .collect::<Result<Vec<_>, _>>()?;
    if slots.is_empty() {
        return Err(invalid("SLOTWISE_SLOTS", raw, "at least one slot is required"));
    }
    if slots.len() > MAX_CANDIDATE_SLOTS {
        return Err(invalid(
            "SLOTWISE_SLOTS",
            raw,
            format!("at most {MAX_CANDIDATE_SLOTS} slots"),
        ));
    }
    Ok(slots)
}

fn parse_buckets(raw: &str) -> Result<BTreeMap<String, u32>, ConfigError> {
    let mut buckets = BTreeMap::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let Some((name, limit)) = entry.split_once('=') else {
            return Err(invalid("SLOTWISE_QUOTA_BUCKETS", raw, format!("{entry:?} is not name=limit")));
        };
        let name = name.trim();
        if !is_valid_bucket_name(name) {
            return Err(invalid("SLOTWISE_QUOTA_BUCKETS", raw, format!("bad bucket name {name:?}")));
        }
        let limit: u32 = limit
            .trim()
            .parse()
            .map_err(|e| invalid("SLOTWISE_QUOTA_BUCKETS", raw, format!("{name}: {e}")))?;
        if limit == 0 {
            return Err(invalid("SLOTWISE_QUOTA_BUCKETS", raw, format!("{name}: limit must be at least 1")));
        }
        if buckets.insert(name.to_string(), limit).is_some() {
            return Err(invalid("SLOTWISE_QUOTA_BUCKETS", raw, format!("{name} listed twice")));
        }
    }
    Ok(buckets)
}
