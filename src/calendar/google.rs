// Google Calendar v3 client.
//
// Only the two endpoints the engine needs: `freeBusy` for availability and
// `events.insert` for bookings. Authentication is delegated to a
// `TokenSource` so static tokens and service accounts share one code path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::auth::TokenSource;
use super::{CalendarError, CalendarProvider, NewEvent};
use crate::clock::instant;
use crate::model::Span;

pub const DEFAULT_API_BASE: &str = "https://www.googleapis.com/calendar/v3";

pub struct GoogleCalendar {
    http: reqwest::Client,
    base_url: Url,
    tokens: Arc<dyn TokenSource>,
}

impl GoogleCalendar {
    /// Build a client whose every request is bounded by `timeout`.
    pub fn new(
        base_url: &str,
        timeout: Duration,
        tokens: Arc<dyn TokenSource>,
    ) -> Result<Self, CalendarError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("slotwise/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Self::with_client(http, base_url, tokens)
    }

    pub fn with_client(
        http: reqwest::Client,
        base_url: &str,
        tokens: Arc<dyn TokenSource>,
    ) -> Result<Self, CalendarError> {
        let base_url =
            Url::parse(base_url).map_err(|e| CalendarError::InvalidUrl(format!("{base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(CalendarError::InvalidUrl(base_url.to_string()));
        }
        Ok(Self {
            http,
            base_url,
            tokens,
        })
    }

    /// Append path segments to the base URL, percent-encoding each one.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, CalendarError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| CalendarError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        url: Url,
        body: &B,
    ) -> Result<T, CalendarError> {
        debug!("POST {}", url);
        let token = self.tokens.access_token(&self.http).await?;
        let resp = self
            .http
            .post(url)
            .bearer_auth(&token)
            .json(body)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            self.tokens.invalidate(&token).await;
        }
        parse_response(resp).await
    }
}

async fn parse_response<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, CalendarError> {
    let status = resp.status();
    let body = resp.text().await?;

    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(CalendarError::Auth {
            message: format!("HTTP {}: {}", status.as_u16(), truncate(&body)),
        });
    }
    if !status.is_success() {
        return Err(CalendarError::Status {
            status: status.as_u16(),
            body: truncate(&body).to_string(),
        });
    }

    serde_json::from_str(&body).map_err(|e| CalendarError::Deserialization {
        message: e.to_string(),
        body,
    })
}

fn truncate(body: &str) -> &str {
    const MAX: usize = 512;
    if body.len() <= MAX {
        return body;
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FreeBusyRequest<'a> {
    time_min: DateTime<Utc>,
    time_max: DateTime<Utc>,
    time_zone: &'static str,
    items: [FreeBusyItem<'a>; 1],
}

#[derive(Serialize)]
struct FreeBusyItem<'a> {
    id: &'a str,
}

#[derive(Deserialize)]
struct FreeBusyResponse {
    #[serde(default)]
    calendars: HashMap<String, CalendarBusy>,
}

#[derive(Deserialize)]
struct CalendarBusy {
    #[serde(default)]
    busy: Vec<BusyPeriod>,
    #[serde(default)]
    errors: Vec<ApiErrorEntry>,
}

#[derive(Deserialize)]
struct BusyPeriod {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

#[derive(Deserialize)]
struct ApiErrorEntry {
    reason: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EventBody<'a> {
    summary: &'a str,
    description: &'a str,
    start: EventTime,
    end: EventTime,
    attendees: Vec<EventAttendee<'a>>,
    reminders: EventReminders,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EventTime {
    date_time: DateTime<Utc>,
    time_zone: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EventAttendee<'a> {
    email: &'a str,
    display_name: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EventReminders {
    use_default: bool,
    overrides: Vec<ReminderOverride>,
}

#[derive(Serialize)]
struct ReminderOverride {
    method: &'static str,
    minutes: u32,
}

#[derive(Deserialize)]
struct CreatedEvent {
    id: String,
}

// ── Provider ────────────────────────────────────────────────────────

#[async_trait]
impl CalendarProvider for GoogleCalendar {
    async fn free_busy(&self, calendar: &str, window: Span) -> Result<Vec<Span>, CalendarError> {
        let url = self.endpoint(&["freeBusy"])?;
        let request = FreeBusyRequest {
            time_min: instant(window.start),
            time_max: instant(window.end),
            time_zone: "UTC",
            items: [FreeBusyItem { id: calendar }],
        };
        let response: FreeBusyResponse = self.post(url, &request).await?;

        // A missing entry must not read as "free".
        let Some(entry) = response.calendars.get(calendar) else {
            return Err(CalendarError::Calendar {
                calendar: calendar.to_string(),
                reason: "missing from freeBusy response".into(),
            });
        };
        if let Some(err) = entry.errors.first() {
            return Err(CalendarError::Calendar {
                calendar: calendar.to_string(),
                reason: err.reason.clone(),
            });
        }

        Ok(entry
            .busy
            .iter()
            .map(|b| (b.start.timestamp_millis(), b.end.timestamp_millis()))
            .filter(|(start, end)| start < end)
            .map(|(start, end)| Span::new(start, end))
            .collect())
    }

    async fn insert_event(
        &self,
        calendar: &str,
        event: &NewEvent,
    ) -> Result<String, CalendarError> {
        let mut url = self.endpoint(&["calendars", calendar, "events"])?;
        url.query_pairs_mut().append_pair("sendUpdates", "all");

        let zone = event.zone.name().to_string();
        let body = EventBody {
            summary: &event.summary,
            description: &event.description,
            start: EventTime {
                date_time: instant(event.span.start),
                time_zone: zone.clone(),
            },
            end: EventTime {
                date_time: instant(event.span.end),
                time_zone: zone,
            },
            attendees: event
                .attendees
                .iter()
                .map(|a| EventAttendee {
                    email: &a.email,
                    display_name: &a.name,
                })
                .collect(),
            reminders: EventReminders {
                use_default: false,
                overrides: event
                    .reminders
                    .iter()
                    .map(|r| ReminderOverride {
                        method: r.method.as_str(),
                        minutes: r.minutes_before,
                    })
                    .collect(),
            },
        };

        let created: CreatedEvent = self.post(url, &body).await?;
        Ok(created.id)
    }
}
