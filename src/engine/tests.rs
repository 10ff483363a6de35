use super::*;
use crate::calendar::{NewEvent, ReminderMethod};
use crate::limits::*;
use crate::model::*;

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use ulid::Ulid;

const M: Ms = 60_000; // 1 minute in ms

/// In-memory calendar. Inserted events become busy time, like the real thing.
#[derive(Default)]
struct FakeCalendar {
    busy: StdMutex<Vec<Span>>,
    queries: StdMutex<Vec<(String, Span)>>,
    events: StdMutex<Vec<(String, NewEvent)>>,
    fail_free_busy: AtomicBool,
    fail_insert: AtomicBool,
    delay_ms: AtomicU64,
    free_busy_calls: AtomicUsize,
}

impl FakeCalendar {
    fn with_busy(busy: Vec<Span>) -> Arc<Self> {
        let fake = Self::default();
        *fake.busy.lock().unwrap() = busy;
        Arc::new(fake)
    }

    fn events(&self) -> Vec<(String, NewEvent)> {
        self.events.lock().unwrap().clone()
    }

    fn calls(&self) -> usize {
        self.free_busy_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CalendarProvider for FakeCalendar {
    async fn free_busy(&self, calendar: &str, window: Span) -> Result<Vec<Span>, CalendarError> {
        self.free_busy_calls.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().unwrap().push((calendar.to_string(), window));
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(StdDuration::from_millis(delay)).await;
        }
        if self.fail_free_busy.load(Ordering::SeqCst) {
            return Err(CalendarError::Status {
                status: 500,
                body: "backend error".into(),
            });
        }
        Ok(self
            .busy
            .lock()
            .unwrap()
            .iter()
            .copied()
            .filter(|b| b.overlaps(&window))
            .collect())
    }

    async fn insert_event(&self, calendar: &str, event: &NewEvent) -> Result<String, CalendarError> {
        // Yield so concurrent bookings genuinely interleave.
        tokio::task::yield_now().await;
        if self.fail_insert.load(Ordering::SeqCst) {
            return Err(CalendarError::Auth {
                message: "HTTP 403: forbidden".into(),
            });
        }
        self.busy.lock().unwrap().push(event.span);
        let mut events = self.events.lock().unwrap();
        events.push((calendar.to_string(), event.clone()));
        Ok(format!("evt{}", events.len()))
    }
}

fn zone() -> Zone {
    Zone::new(chrono_tz::Asia::Tokyo)
}

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, 10).unwrap()
}

fn t(s: &str) -> SlotTime {
    s.parse().unwrap()
}

fn times(list: &[&str]) -> Vec<SlotTime> {
    list.iter().map(|s| t(s)).collect()
}

fn at(time: &str) -> Ms {
    zone().local_to_instant(date(), t(time)).unwrap()
}

fn registry() -> DeskRegistry {
    let mut calendars = HashMap::new();
    calendars.insert(DeskId::Language, "language@cal".to_string());
    calendars.insert(DeskId::Study, "study@cal".to_string());
    DeskRegistry::new(calendars)
}

fn engine_with(fake: &Arc<FakeCalendar>) -> Engine {
    let provider: Arc<dyn CalendarProvider> = fake.clone();
    Engine::new(registry(), Some(provider), EngineSettings::new(zone()))
}

fn request(desk: DeskId, time: &str) -> BookingRequest {
    BookingRequest {
        reference: Ulid::new(),
        desk,
        date: date(),
        time: t(time),
        attendee: Attendee {
            name: "Aiko Tanaka".into(),
            email: "aiko@example.com".into(),
            phone: None,
        },
        notes: Some("Second visit".into()),
    }
}

// ── Availability ─────────────────────────────────────────

#[tokio::test]
async fn live_availability_drops_busy_slot() {
    let fake = FakeCalendar::with_busy(vec![Span::new(at("14:00"), at("14:00") + 45 * M)]);
    let engine = engine_with(&fake);

    let a = engine.availability("language", date()).await.unwrap();
    assert_eq!(a.source, SlotSource::Live);
    assert_eq!(a.slots, times(&["09:00", "10:30", "12:00", "15:30", "17:00"]));
}

#[tokio::test]
async fn live_availability_queries_the_local_day() {
    let fake = FakeCalendar::with_busy(vec![]);
    let engine = engine_with(&fake);

    engine.availability("study", date()).await.unwrap();
    let queries = fake.queries.lock().unwrap().clone();
    assert_eq!(queries, vec![("study@cal".to_string(), zone().day_window(date()))]);
}

#[tokio::test]
async fn busy_block_touching_slot_keeps_it() {
    // Busy 08:00-09:00 and 09:45-10:30 leave 09:00 and 10:30 free.
    let fake = FakeCalendar::with_busy(vec![
        Span::new(at("09:00") - 60 * M, at("09:00")),
        Span::new(at("09:00") + 45 * M, at("10:30")),
    ]);
    let engine = engine_with(&fake);

    let a = engine.availability("language", date()).await.unwrap();
    assert_eq!(a.slots.len(), 6);
}

#[tokio::test]
async fn unconfigured_desk_serves_fallback_without_calling_calendar() {
    let fake = FakeCalendar::with_busy(vec![Span::new(at("09:00"), at("17:00") + 45 * M)]);
    let engine = engine_with(&fake);

    let a = engine.availability("business", date()).await.unwrap();
    assert_eq!(a, FallbackPolicy::default().slots());
    assert_eq!(fake.calls(), 0);
}

#[tokio::test]
async fn missing_provider_means_every_desk_is_fallback() {
    let engine = Engine::new(registry(), None, EngineSettings::new(zone()));
    let a = engine.availability("language", date()).await.unwrap();
    assert_eq!(a.source, SlotSource::Fallback);
    assert_eq!(a.slots.len(), 6);
}

#[tokio::test]
async fn upstream_error_serves_fallback() {
    let fake = FakeCalendar::with_busy(vec![Span::new(at("14:00"), at("14:45"))]);
    fake.fail_free_busy.store(true, Ordering::SeqCst);
    let engine = engine_with(&fake);

    let a = engine.availability("language", date()).await.unwrap();
    assert_eq!(a.source, SlotSource::Fallback);
    assert_eq!(a.slots, FallbackPolicy::default().candidates());
}

#[tokio::test]
async fn upstream_timeout_serves_fallback() {
    let fake = FakeCalendar::with_busy(vec![]);
    fake.delay_ms.store(500, Ordering::SeqCst);
    let mut settings = EngineSettings::new(zone());
    settings.upstream_timeout = StdDuration::from_millis(20);
    let provider: Arc<dyn CalendarProvider> = fake.clone();
    let engine = Engine::new(registry(), Some(provider), settings);

    let started = Instant::now();
    let a = engine.availability("language", date()).await.unwrap();
    assert_eq!(a.source, SlotSource::Fallback);
    assert!(started.elapsed() < StdDuration::from_millis(400));
}

#[tokio::test]
async fn unknown_desk_is_an_error() {
    let fake = FakeCalendar::with_busy(vec![]);
    let engine = engine_with(&fake);
    let err = engine.availability("sales", date()).await.unwrap_err();
    assert!(matches!(err, EngineError::DeskNotFound(ref d) if d == "sales"));
    assert_eq!(fake.calls(), 0);
}

#[tokio::test]
async fn custom_candidates_and_duration() {
    let fake = FakeCalendar::with_busy(vec![Span::new(at("10:00") + 50 * M, at("11:00"))]);
    let mut settings = EngineSettings::new(zone());
    settings.fallback = FallbackPolicy::new(times(&["10:00", "11:00"]));
    settings.slot_duration = Duration::minutes(60);
    let provider: Arc<dyn CalendarProvider> = fake.clone();
    let engine = Engine::new(registry(), Some(provider), settings);

    let a = engine.availability("language", date()).await.unwrap();
    assert_eq!(a.slots, times(&["11:00"]));
}

#[tokio::test]
async fn late_slot_sees_busy_time_after_midnight() {
    let next_day = date().succ_opt().unwrap();
    let midnight = zone().local_to_instant(next_day, t("00:00")).unwrap();
    let fake = FakeCalendar::with_busy(vec![Span::new(midnight, midnight + 30 * M)]);
    let mut settings = EngineSettings::new(zone());
    settings.fallback = FallbackPolicy::new(times(&["23:30"]));
    let provider: Arc<dyn CalendarProvider> = fake.clone();
    let engine = Engine::new(registry(), Some(provider), settings);

    let a = engine.availability("language", date()).await.unwrap();
    assert_eq!(a.source, SlotSource::Live);
    assert!(a.slots.is_empty());

    let queries = fake.queries.lock().unwrap().clone();
    assert_eq!(queries[0].1.start, zone().day_window(date()).start);
    assert_eq!(queries[0].1.end, at("23:30") + 45 * M);
}

// ── Booking ──────────────────────────────────────────────

#[tokio::test]
async fn booking_writes_event_with_details() {
    let fake = FakeCalendar::with_busy(vec![]);
    let engine = engine_with(&fake);
    let req = request(DeskId::Language, "10:30");
    let reference = req.reference;

    let outcome = engine.book(req).await.unwrap();
    assert_eq!(outcome, BookingOutcome::created(reference));

    let events = fake.events();
    assert_eq!(events.len(), 1);
    let (calendar, event) = &events[0];
    assert_eq!(calendar, "language@cal");
    assert_eq!(event.summary, "Language consultation");
    assert_eq!(event.span, Span::new(at("10:30"), at("10:30") + 45 * M));
    assert_eq!(event.zone, chrono_tz::Asia::Tokyo);
    assert_eq!(event.attendees.len(), 1);
    assert_eq!(event.attendees[0].email, "aiko@example.com");

    let lines: Vec<&str> = event.description.lines().collect();
    assert_eq!(
        lines,
        vec![
            "Name: Aiko Tanaka".to_string(),
            "Email: aiko@example.com".to_string(),
            "Phone: -".to_string(),
            "Notes: Second visit".to_string(),
            format!("Reference: {reference}"),
        ]
    );

    let reminders: Vec<(ReminderMethod, u32)> = event
        .reminders
        .iter()
        .map(|r| (r.method, r.minutes_before))
        .collect();
    assert_eq!(
        reminders,
        vec![
            (ReminderMethod::Email, EMAIL_REMINDER_MINUTES),
            (ReminderMethod::Popup, POPUP_REMINDER_MINUTES),
        ]
    );
}

#[tokio::test]
async fn booked_slot_disappears_from_availability() {
    let fake = FakeCalendar::with_busy(vec![]);
    let engine = engine_with(&fake);
    engine.book(request(DeskId::Study, "12:00")).await.unwrap();

    let a = engine.availability("study", date()).await.unwrap();
    assert_eq!(a.slots, times(&["09:00", "10:30", "14:00", "15:30", "17:00"]));
}

#[tokio::test]
async fn unconfigured_desk_is_not_created() {
    let fake = FakeCalendar::with_busy(vec![]);
    let engine = engine_with(&fake);

    let outcome = engine.book(request(DeskId::Business, "09:00")).await.unwrap();
    assert_eq!(outcome, BookingOutcome::not_created());
    assert!(fake.events().is_empty());
    assert_eq!(fake.calls(), 0);
}

#[tokio::test]
async fn busy_slot_is_rejected_as_taken() {
    let fake = FakeCalendar::with_busy(vec![Span::new(at("15:00"), at("15:31"))]);
    let engine = engine_with(&fake);

    let err = engine.book(request(DeskId::Language, "15:30")).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::SlotTaken { desk: DeskId::Language, time, .. } if time == t("15:30")
    ));
    assert!(fake.events().is_empty());
}

#[tokio::test]
async fn recheck_failure_does_not_write() {
    let fake = FakeCalendar::with_busy(vec![]);
    fake.fail_free_busy.store(true, Ordering::SeqCst);
    let engine = engine_with(&fake);

    let err = engine.book(request(DeskId::Language, "09:00")).await.unwrap_err();
    assert!(matches!(err, EngineError::UpstreamUnavailable(CalendarError::Status { status: 500, .. })));
    assert!(fake.events().is_empty());
}

#[tokio::test]
async fn insert_failure_is_upstream_unavailable() {
    let fake = FakeCalendar::with_busy(vec![]);
    fake.fail_insert.store(true, Ordering::SeqCst);
    let engine = engine_with(&fake);

    let err = engine.book(request(DeskId::Language, "09:00")).await.unwrap_err();
    assert!(matches!(err, EngineError::UpstreamUnavailable(CalendarError::Auth { .. })));
}

#[tokio::test]
async fn slot_outside_candidate_list_is_rejected() {
    let fake = FakeCalendar::with_busy(vec![]);
    let engine = engine_with(&fake);

    let err = engine.book(request(DeskId::Language, "09:15")).await.unwrap_err();
    assert!(matches!(err, EngineError::UnknownSlot(time) if time == t("09:15")));
    assert_eq!(fake.calls(), 0);
}

#[tokio::test]
async fn booking_input_is_validated() {
    let fake = FakeCalendar::with_busy(vec![]);
    let engine = engine_with(&fake);

    let mut req = request(DeskId::Language, "09:00");
    req.attendee.name = "   ".into();
    assert!(matches!(
        engine.book(req).await,
        Err(EngineError::MissingField("name"))
    ));

    let mut req = request(DeskId::Language, "09:00");
    req.attendee.email.clear();
    assert!(matches!(
        engine.book(req).await,
        Err(EngineError::MissingField("email"))
    ));

    let mut req = request(DeskId::Language, "09:00");
    req.notes = Some("x".repeat(MAX_NOTES_LEN + 1));
    assert!(matches!(
        engine.book(req).await,
        Err(EngineError::LimitExceeded(_))
    ));

    assert!(fake.events().is_empty());
}

#[tokio::test]
async fn nonexistent_local_time_cannot_be_booked() {
    let fake = FakeCalendar::with_busy(vec![]);
    let mut settings = EngineSettings::new(Zone::new(chrono_tz::Europe::Berlin));
    settings.fallback = FallbackPolicy::new(times(&["02:30", "09:00"]));
    let provider: Arc<dyn CalendarProvider> = fake.clone();
    let engine = Engine::new(registry(), Some(provider), settings);

    let mut req = request(DeskId::Language, "02:30");
    req.date = NaiveDate::from_ymd_opt(2026, 3, 29).unwrap();
    let err = engine.book(req).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTime(_)));
    assert!(fake.events().is_empty());
}

#[tokio::test]
async fn concurrent_bookings_for_one_slot_create_one_event() {
    let fake = FakeCalendar::with_busy(vec![]);
    let engine = Arc::new(engine_with(&fake));

    let attempts = (0..8).map(|_| {
        let engine = engine.clone();
        async move { engine.book(request(DeskId::Language, "14:00")).await }
    });
    let results = futures::future::join_all(attempts).await;

    let created = results.iter().filter(|r| matches!(r, Ok(o) if o.created)).count();
    let taken = results
        .iter()
        .filter(|r| matches!(r, Err(EngineError::SlotTaken { .. })))
        .count();
    assert_eq!(created, 1);
    assert_eq!(taken, 7);
    assert_eq!(fake.events().len(), 1);
    assert!(engine.slot_locks.is_empty());
}

#[tokio::test]
async fn different_slots_book_independently() {
    let fake = FakeCalendar::with_busy(vec![]);
    let engine = Arc::new(engine_with(&fake));

    let (a, b) = tokio::join!(
        engine.book(request(DeskId::Language, "09:00")),
        engine.book(request(DeskId::Study, "09:00")),
    );
    assert!(a.unwrap().created);
    assert!(b.unwrap().created);
    assert_eq!(fake.events().len(), 2);
}

#[tokio::test]
async fn cancelled_bookings_release_their_slot_locks() {
    let fake = FakeCalendar::with_busy(vec![]);
    fake.delay_ms.store(200, Ordering::SeqCst);
    let engine = engine_with(&fake);

    for days in 0..20 {
        let mut req = request(DeskId::Language, "09:00");
        req.date = date() + Duration::days(days);
        let attempt = tokio::time::timeout(StdDuration::from_millis(10), engine.book(req)).await;
        assert!(attempt.is_err());
    }
    assert!(engine.slot_locks.is_empty());
    assert!(fake.events().is_empty());
}

#[tokio::test]
async fn cancelled_waiter_leaves_the_holders_lock_in_place() {
    let fake = FakeCalendar::with_busy(vec![]);
    fake.delay_ms.store(100, Ordering::SeqCst);
    let engine = engine_with(&fake);

    let holder = engine.book(request(DeskId::Language, "09:00"));
    let waiter = async {
        let attempt = tokio::time::timeout(
            StdDuration::from_millis(20),
            engine.book(request(DeskId::Language, "09:00")),
        )
        .await;
        assert!(attempt.is_err());
        assert_eq!(engine.slot_locks.len(), 1);
    };
    let (booked, ()) = tokio::join!(holder, waiter);
    assert!(booked.unwrap().created);
    assert!(engine.slot_locks.is_empty());
}
