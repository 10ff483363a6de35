use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{MatchedPath, Path, Query, Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::model::{Attendee, Availability, BookingOutcome, BookingRequest, SlotTime};
use crate::quota::{QuotaError, QuotaLedger, Reservation};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub ledger: Arc<QuotaLedger>,
    /// Configured daily limit per bucket. Buckets not listed here are unknown.
    pub buckets: Arc<BTreeMap<String, u32>>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/availability", get(availability))
        .route("/bookings", post(book))
        .route("/quota/:bucket/reserve", post(reserve))
        .route_layer(middleware::from_fn(record_latency))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Serve until `shutdown` resolves; in-flight requests are allowed to finish.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn record_latency(request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| "unmatched".to_string(), |p| p.as_str().to_string());
    let started = Instant::now();
    let response = next.run(request).await;
    metrics::histogram!(
        crate::observability::HTTP_REQUEST_DURATION_SECONDS,
        "route" => route,
        "status" => response.status().as_u16().to_string()
    )
    .record(started.elapsed().as_secs_f64());
    response
}

// ── Errors ──────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("unknown quota bucket: {0}")]
    UnknownBucket(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Quota(#[from] QuotaError),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::UnknownBucket(_) => (StatusCode::NOT_FOUND, "unknown_bucket"),
            ApiError::Engine(e) => match e {
                EngineError::DeskNotFound(_) => (StatusCode::NOT_FOUND, "unknown_desk"),
                EngineError::MissingField(_) => (StatusCode::BAD_REQUEST, "missing_field"),
                EngineError::LimitExceeded(_) => (StatusCode::UNPROCESSABLE_ENTITY, "limit_exceeded"),
                EngineError::UnknownSlot(_) => (StatusCode::UNPROCESSABLE_ENTITY, "unknown_slot"),
                EngineError::InvalidTime(_) => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_time"),
                EngineError::SlotTaken { .. } => (StatusCode::CONFLICT, "slot_taken"),
                EngineError::UpstreamUnavailable(_) => (StatusCode::BAD_GATEWAY, "calendar_unavailable"),
            },
            ApiError::Quota(e) => match e {
                QuotaError::InvalidBucket(_) => (StatusCode::NOT_FOUND, "unknown_bucket"),
                QuotaError::InvalidLimit => (StatusCode::INTERNAL_SERVER_ERROR, "invalid_limit"),
                QuotaError::Transport(_) | QuotaError::Store(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "counter_unavailable")
                }
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            error!(code, "{self}");
        }
        let body = Json(json!({
            "error": {
                "code": code,
                "message": self.to_string(),
            }
        }));
        (status, body).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

// ── Handlers ────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Health {
    status: &'static str,
    live_desks: usize,
    shared_counter: bool,
}

async fn healthz(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        live_desks: state.engine.registry().live_count(),
        shared_counter: state.ledger.is_shared(),
    })
}

#[derive(Debug, Deserialize)]
struct AvailabilityQuery {
    desk: String,
    date: String,
}

async fn availability(
    State(state): State<AppState>,
    query: Result<Query<AvailabilityQuery>, QueryRejection>,
) -> Result<Json<Availability>, ApiError> {
    let Query(query) = query?;
    let date = parse_date(&query.date)?;
    let availability = state.engine.availability(&query.desk, date).await?;
    Ok(Json(availability))
}

/// Booking submission as posted by the web form.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BookingForm {
    desk: String,
    date: String,
    time: String,
    full_name: String,
    email: String,
    #[serde(default)]
    phone: Option<String>,
    #[serde(default)]
    notes: Option<String>,
}

async fn book(
    State(state): State<AppState>,
    form: Result<Json<BookingForm>, JsonRejection>,
) -> Result<Json<BookingOutcome>, ApiError> {
    let Json(form) = form?;
    let desk = state.engine.registry().resolve(&form.desk)?.id;
    let date = parse_date(&form.date)?;
    let time: SlotTime = form
        .time
        .parse()
        .map_err(|e: crate::model::SlotTimeParseError| ApiError::BadRequest(e.to_string()))?;

    let request = BookingRequest {
        reference: Ulid::new(),
        desk,
        date,
        time,
        attendee: Attendee {
            name: form.full_name,
            email: form.email,
            phone: form.phone.filter(|p| !p.trim().is_empty()),
        },
        notes: form.notes.filter(|n| !n.trim().is_empty()),
    };
    let outcome = state.engine.book(request).await?;
    Ok(Json(outcome))
}

async fn reserve(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
) -> Result<Response, ApiError> {
    let Some(&limit) = state.buckets.get(&bucket) else {
        return Err(ApiError::UnknownBucket(bucket));
    };
    let reservation = state.ledger.reserve(&bucket, limit).await?;
    Ok(reservation_response(reservation))
}

/// Allowed is 200. Denied is 503 with `Retry-After`, the same body either way.
fn reservation_response(reservation: Reservation) -> Response {
    if reservation.allowed {
        return (StatusCode::OK, Json(reservation)).into_response();
    }
    let mut response = (StatusCode::SERVICE_UNAVAILABLE, Json(reservation)).into_response();
    match HeaderValue::from_str(&reservation.retry_after_seconds.to_string()) {
        Ok(value) => {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        Err(e) => warn!("unrepresentable Retry-After: {e}"),
    }
    response
}

fn parse_date(raw: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| ApiError::BadRequest(format!("invalid date {raw:?}: {e}")))
}
