use std::fmt::Write as _;
use tracing::{info, warn};

use crate::calendar::{CalendarProvider, NewEvent, Reminder, ReminderMethod};
use crate::limits::*;
use crate::model::*;

use super::availability::{normalize_busy, slot_is_free};
use super::{Engine, EngineError, SlotKey, SlotLease};

impl Engine {
    /// Write a confirmed slot to the desk's calendar.
    ///
    /// Desks without a live integration return `created = false`; the caller
    /// routes those to manual confirmation. Within this process, bookings for
    /// the same slot are serialised and the slot is re-checked against the
    /// calendar right before the write. Separate instances can still race.
    pub async fn book(&self, request: BookingRequest) -> Result<BookingOutcome, EngineError> {
        validate_request(&request)?;
        if !self.settings.fallback.contains(request.time) {
            return Err(EngineError::UnknownSlot(request.time));
        }
        let span = self.settings.zone.slot_span(
            request.date,
            request.time,
            self.settings.slot_duration,
        )?;

        let Some((calendar, provider)) = self.live_calendar(request.desk)? else {
            info!(
                desk = %request.desk,
                date = %request.date,
                time = %request.time,
                reference = %request.reference,
                "no calendar configured, booking left for manual follow-up"
            );
            metrics::counter!(crate::observability::BOOKINGS_TOTAL, "outcome" => "manual")
                .increment(1);
            return Ok(BookingOutcome::not_created());
        };

        let key = SlotKey {
            desk: request.desk,
            date: request.date,
            time: request.time,
        };
        let lease = SlotLease::acquire(&self.slot_locks, key);
        let result = {
            let _guard = lease.lock().lock().await;
            self.recheck_and_insert(&request, span, calendar, provider).await
        };
        drop(lease);

        match result {
            Ok(event_id) => {
                info!(
                    desk = %request.desk,
                    date = %request.date,
                    time = %request.time,
                    reference = %request.reference,
                    event_id = %event_id,
                    "booking created"
                );
                metrics::counter!(crate::observability::BOOKINGS_TOTAL, "outcome" => "created")
                    .increment(1);
                Ok(BookingOutcome::created(request.reference))
            }
            Err(e @ EngineError::SlotTaken { .. }) => Err(e),
            Err(e) => {
                warn!(
                    desk = %request.desk,
                    reference = %request.reference,
                    error = %e,
                    "booking write failed"
                );
                metrics::counter!(crate::observability::BOOKINGS_TOTAL, "outcome" => "failed")
                    .increment(1);
                Err(e)
            }
        }
    }

    async fn recheck_and_insert(
        &self,
        request: &BookingRequest,
        span: Span,
        calendar: &str,
        provider: &dyn CalendarProvider,
    ) -> Result<String, EngineError> {
        let busy = self
            .call_upstream("free_busy", provider.free_busy(calendar, span))
            .await
            .map_err(EngineError::UpstreamUnavailable)?;
        if !slot_is_free(&span, &normalize_busy(&busy)) {
            warn!(
                desk = %request.desk,
                date = %request.date,
                time = %request.time,
                "slot taken between availability and booking"
            );
            metrics::counter!(crate::observability::BOOKINGS_TOTAL, "outcome" => "taken")
                .increment(1);
            return Err(EngineError::SlotTaken {
                desk: request.desk,
                date: request.date,
                time: request.time,
            });
        }

        let event = build_event(request, span, self.settings.zone.tz());
        self.call_upstream("insert_event", provider.insert_event(calendar, &event))
            .await
            .map_err(EngineError::UpstreamUnavailable)
    }
}

fn validate_request(request: &BookingRequest) -> Result<(), EngineError> {
    let attendee = &request.attendee;
    if attendee.name.trim().is_empty() {
        return Err(EngineError::MissingField("name"));
    }
    if attendee.email.trim().is_empty() {
        return Err(EngineError::MissingField("email"));
    }
    if attendee.name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    if attendee.email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("email too long"));
    }
    if let Some(ref phone) = attendee.phone
        && phone.len() > MAX_PHONE_LEN {
            return Err(EngineError::LimitExceeded("phone too long"));
        }
    if let Some(ref notes) = request.notes
        && notes.len() > MAX_NOTES_LEN {
            return Err(EngineError::LimitExceeded("notes too long"));
        }
    Ok(())
}

fn build_event(request: &BookingRequest, span: Span, zone: chrono_tz::Tz) -> NewEvent {
    let attendee = &request.attendee;
    let mut description = String::new();
    let _ = writeln!(description, "Name: {}", attendee.name.trim());
    let _ = writeln!(description, "Email: {}", attendee.email.trim());
    let _ = writeln!(
        description,
        "Phone: {}",
        attendee.phone.as_deref().map(str::trim).filter(|p| !p.is_empty()).unwrap_or("-")
    );
    if let Some(notes) = request.notes.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
        let _ = writeln!(description, "Notes: {notes}");
    }
    let _ = write!(description, "Reference: {}", request.reference);

    NewEvent {
        summary: format!("{} consultation", request.desk.display_name()),
        description,
        span,
        zone,
        attendees: vec![Attendee {
            name: attendee.name.trim().to_string(),
            email: attendee.email.trim().to_string(),
            phone: attendee.phone.clone(),
        }],
        reminders: vec![
            Reminder {
                method: ReminderMethod::Email,
                minutes_before: EMAIL_REMINDER_MINUTES,
            },
            Reminder {
                method: ReminderMethod::Popup,
                minutes_before: POPUP_REMINDER_MINUTES,
            },
        ],
    }
}
