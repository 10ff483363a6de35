use chrono::NaiveDate;
use tracing::{debug, warn};

use crate::model::*;

use super::availability::free_slots;
use super::{Engine, EngineError};

impl Engine {
    /// Bookable slots for a desk on a local date.
    ///
    /// Only an unknown desk is an error. An unconfigured desk, a failing
    /// calendar, or a timeout all degrade to the fallback list.
    pub async fn availability(&self, desk: &str, date: NaiveDate) -> Result<Availability, EngineError> {
        let id = self.registry.resolve(desk)?.id;

        let Some((calendar, provider)) = self.live_calendar(id)? else {
            debug!(desk = %id, %date, "no calendar configured, serving fallback slots");
            metrics::counter!(crate::observability::AVAILABILITY_TOTAL, "source" => "fallback")
                .increment(1);
            return Ok(self.settings.fallback.slots());
        };

        let window = self.query_window(date);
        let busy = match self
            .call_upstream("free_busy", provider.free_busy(calendar, window))
            .await
        {
            Ok(busy) => busy,
            Err(e) => {
                warn!(desk = %id, %date, error = %e, "free/busy query failed, serving fallback slots");
                metrics::counter!(crate::observability::AVAILABILITY_TOTAL, "source" => "fallback")
                    .increment(1);
                return Ok(self.settings.fallback.slots());
            }
        };

        let slots = free_slots(
            self.settings.fallback.candidates(),
            &busy,
            date,
            self.settings.slot_duration,
            &self.settings.zone,
        );
        debug!(desk = %id, %date, busy = busy.len(), free = slots.len(), "live availability");
        metrics::counter!(crate::observability::AVAILABILITY_TOTAL, "source" => "live").increment(1);
        Ok(Availability {
            slots,
            source: SlotSource::Live,
        })
    }

    /// The local day, stretched to the end of any candidate slot that runs past midnight.
    fn query_window(&self, date: NaiveDate) -> Span {
        let mut window = self.settings.zone.day_window(date);
        for &time in self.settings.fallback.candidates() {
            if let Ok(slot) = self.settings.zone.slot_span(date, time, self.settings.slot_duration) {
                window.end = window.end.max(slot.end);
            }
        }
        window
    }
}
