//! External calendar integration.
//!
//! The engine only talks to a [`CalendarProvider`]; [`GoogleCalendar`] is the
//! production implementation over the Google Calendar v3 REST API.

mod auth;
mod error;
mod google;

pub use auth::{ServiceAccount, ServiceAccountKey, StaticToken, TokenSource};
pub use error::CalendarError;
pub use google::{GoogleCalendar, DEFAULT_API_BASE};

use async_trait::async_trait;
use chrono_tz::Tz;

use crate::model::{Attendee, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReminderMethod {
    Email,
    Popup,
}

impl ReminderMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            ReminderMethod::Email => "email",
            ReminderMethod::Popup => "popup",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reminder {
    pub method: ReminderMethod,
    pub minutes_before: u32,
}

/// An event to create on a desk calendar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub summary: String,
    pub description: String,
    pub span: Span,
    /// Zone the event is displayed in; instants in `span` are absolute.
    pub zone: Tz,
    pub attendees: Vec<Attendee>,
    pub reminders: Vec<Reminder>,
}

#[async_trait]
pub trait CalendarProvider: Send + Sync {
    /// Busy intervals on `calendar` intersecting `window`.
    async fn free_busy(&self, calendar: &str, window: Span) -> Result<Vec<Span>, CalendarError>;

    /// Create an event and notify its attendees. Returns the provider's event id.
    async fn insert_event(&self, calendar: &str, event: &NewEvent)
    -> Result<String, CalendarError>;
}
