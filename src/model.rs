use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime, Timelike};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ulid::Ulid;

use crate::desk::DeskId;

/// Unix milliseconds, the only instant type used for comparisons.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// A local time-of-day on the `HH:MM` grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotTime(NaiveTime);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid slot time {0:?}: expected HH:MM")]
pub struct SlotTimeParseError(pub String);

impl SlotTime {
    pub fn from_hm(hour: u32, minute: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(hour, minute, 0).map(Self)
    }

    pub fn time(&self) -> NaiveTime {
        self.0
    }
}

impl FromStr for SlotTime {
    type Err = SlotTimeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Exactly five characters, so "9:00" and "09:00:00" are both rejected.
        if s.len() != 5 {
            return Err(SlotTimeParseError(s.to_string()));
        }
        NaiveTime::parse_from_str(s, "%H:%M")
            .map(Self)
            .map_err(|_| SlotTimeParseError(s.to_string()))
    }
}

impl fmt::Display for SlotTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0.hour(), self.0.minute())
    }
}

impl Serialize for SlotTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SlotTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Where an availability answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SlotSource {
    /// Filtered against the desk's external calendar.
    Live,
    /// Static candidate list; the calendar was not consulted or not reachable.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    pub slots: Vec<SlotTime>,
    pub source: SlotSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attendee {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
}

/// A confirmed slot submitted by a client. Never stored locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub reference: Ulid,
    pub desk: DeskId,
    pub date: NaiveDate,
    pub time: SlotTime,
    pub attendee: Attendee,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingOutcome {
    pub created: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<Ulid>,
}

impl BookingOutcome {
    pub fn created(reference: Ulid) -> Self {
        Self {
            created: true,
            reference: Some(reference),
        }
    }

    /// No live integration; the caller routes the request to manual follow-up.
    pub fn not_created() -> Self {
        Self {
            created: false,
            reference: None,
        }
    }
}
