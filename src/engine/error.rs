use chrono::NaiveDate;
use thiserror::Error;

use crate::calendar::CalendarError;
use crate::clock::ClockError;
use crate::desk::DeskId;
use crate::model::SlotTime;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown desk: {0}")]
    DeskNotFound(String),

    #[error("{0} is not a bookable slot")]
    UnknownSlot(SlotTime),

    #[error("{desk} {date} {time} is no longer free")]
    SlotTaken {
        desk: DeskId,
        date: NaiveDate,
        time: SlotTime,
    },

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error(transparent)]
    InvalidTime(#[from] ClockError),

    /// The calendar call failed or timed out. Never recovered on the write path.
    #[error("calendar unavailable: {0}")]
    UpstreamUnavailable(#[source] CalendarError),
}
