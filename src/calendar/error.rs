use thiserror::Error;

/// Failures talking to the external calendar.
///
/// Every variant means "the calendar did not give a trustworthy answer";
/// callers never read one of these as "no busy intervals".
#[derive(Debug, Error)]
pub enum CalendarError {
    // ── Transport ───────────────────────────────────────────────────
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("calendar call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("invalid calendar API base URL: {0}")]
    InvalidUrl(String),

    // ── Credentials ─────────────────────────────────────────────────
    #[error("calendar credentials rejected: {message}")]
    Auth { message: String },

    #[error("invalid calendar credentials: {message}")]
    Credentials { message: String },

    // ── API ─────────────────────────────────────────────────────────
    #[error("calendar API error (HTTP {status}): {body}")]
    Status { status: u16, body: String },

    /// The free/busy response carried an error entry for this calendar.
    #[error("calendar {calendar} reported {reason}")]
    Calendar { calendar: String, reason: String },

    #[error("unexpected calendar response: {message}")]
    Deserialization { message: String, body: String },
}

impl CalendarError {
    pub fn is_timeout(&self) -> bool {
        match self {
            CalendarError::Timeout { .. } => true,
            CalendarError::Transport(e) => e.is_timeout(),
            _ => false,
        }
    }
}
