use crate::model::{Availability, SlotSource, SlotTime};

pub const DEFAULT_SLOTS: [(u32, u32); 6] = [(9, 0), (10, 30), (12, 0), (14, 0), (15, 30), (17, 0)];

/// The fixed candidate list, served whenever the live calendar is not consulted.
///
/// Fallback slots may already be taken on the real calendar. Booking re-checks
/// the slot before writing, so the looseness only affects what is displayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackPolicy {
    candidates: Vec<SlotTime>,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_SLOTS
                .iter()
                .filter_map(|&(h, m)| SlotTime::from_hm(h, m))
                .collect(),
        )
    }
}

impl FallbackPolicy {
    /// Candidates are kept ascending and unique.
    pub fn new(mut candidates: Vec<SlotTime>) -> Self {
        candidates.sort();
        candidates.dedup();
        Self { candidates }
    }

    pub fn candidates(&self) -> &[SlotTime] {
        &self.candidates
    }

    pub fn contains(&self, time: SlotTime) -> bool {
        self.candidates.binary_search(&time).is_ok()
    }

    pub fn slots(&self) -> Availability {
        Availability {
            slots: self.candidates.clone(),
            source: SlotSource::Fallback,
        }
    }
}
