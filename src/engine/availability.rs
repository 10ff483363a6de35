use chrono::{Duration, NaiveDate};
use tracing::debug;

use crate::clock::Zone;
use crate::model::*;

// ── Free/busy filtering ──────────────────────────────────────────

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// Sort and merge busy intervals so lookups can binary search.
pub fn normalize_busy(busy: &[Span]) -> Vec<Span> {
    let mut sorted = busy.to_vec();
    sorted.sort_by_key(|s| s.start);
    merge_overlapping(&sorted)
}

/// True iff `slot` overlaps none of `merged` (sorted, disjoint).
///
/// Half-open overlap: a slot ending exactly where a busy interval starts is free.
pub fn slot_is_free(slot: &Span, merged: &[Span]) -> bool {
    // First busy interval that ends after the slot starts is the only candidate.
    let idx = merged.partition_point(|b| b.end <= slot.start);
    merged.get(idx).is_none_or(|b| !b.overlaps(slot))
}

/// Filter the candidate list down to slots that do not overlap any busy interval.
/// Order of `candidates` is preserved. Local times that do not exist on `date`
/// (daylight-saving gap) are dropped.
pub fn free_slots(
    candidates: &[SlotTime],
    busy: &[Span],
    date: NaiveDate,
    duration: Duration,
    zone: &Zone,
) -> Vec<SlotTime> {
    let merged = normalize_busy(busy);
    candidates
        .iter()
        .copied()
        .filter(|&time| match zone.slot_span(date, time, duration) {
            Ok(span) => slot_is_free(&span, &merged),
            Err(e) => {
                debug!("skipping slot: {e}");
                false
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;
    const M: Ms = 60_000;

    fn times(list: &[&str]) -> Vec<SlotTime> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    fn candidates() -> Vec<SlotTime> {
        times(&["09:00", "10:30", "12:00", "14:00", "15:30", "17:00"])
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 10).unwrap()
    }

    fn utc_zone() -> Zone {
        Zone::new(chrono_tz::UTC)
    }

    fn day_start() -> Ms {
        utc_zone().day_window(date()).start
    }

    // ── merge_overlapping ────────────────────────────────

    #[test]
    fn merge_overlapping_basic() {
        let spans = vec![
            Span::new(100, 300),
            Span::new(200, 400),
            Span::new(500, 600),
        ];
        let merged = merge_overlapping(&spans);
        assert_eq!(merged, vec![Span::new(100, 400), Span::new(500, 600)]);
    }

    #[test]
    fn merge_overlapping_adjacent() {
        let spans = vec![Span::new(100, 200), Span::new(200, 300)];
        let merged = merge_overlapping(&spans);
        assert_eq!(merged, vec![Span::new(100, 300)]);
    }

    #[test]
    fn normalize_sorts_before_merging() {
        let spans = vec![Span::new(500, 600), Span::new(100, 300), Span::new(250, 400)];
        assert_eq!(
            normalize_busy(&spans),
            vec![Span::new(100, 400), Span::new(500, 600)]
        );
    }

    // ── slot_is_free ─────────────────────────────────────

    #[test]
    fn overlap_is_symmetric() {
        let cases = [
            (Span::new(0, 45), Span::new(30, 60)),
            (Span::new(0, 45), Span::new(45, 60)),
            (Span::new(10, 20), Span::new(0, 100)),
            (Span::new(0, 10), Span::new(20, 30)),
        ];
        for (a, b) in cases {
            assert_eq!(
                slot_is_free(&a, &[b]),
                slot_is_free(&b, &[a]),
                "asymmetric for {a:?} / {b:?}"
            );
        }
    }

    #[test]
    fn touching_busy_interval_does_not_exclude() {
        let slot = Span::new(10 * H, 10 * H + 45 * M);
        let before = Span::new(9 * H, 10 * H);
        let after = Span::new(10 * H + 45 * M, 12 * H);
        assert!(slot_is_free(&slot, &[before]));
        assert!(slot_is_free(&slot, &[after]));
        assert!(slot_is_free(&slot, &normalize_busy(&[before, after])));
    }

    #[test]
    fn one_minute_overlap_excludes() {
        let slot = Span::new(10 * H, 10 * H + 45 * M);
        assert!(!slot_is_free(&slot, &[Span::new(10 * H + 44 * M, 11 * H)]));
        assert!(!slot_is_free(&slot, &[Span::new(9 * H, 10 * H + M)]));
    }

    #[test]
    fn slot_inside_long_busy_block_excluded() {
        let slot = Span::new(10 * H, 10 * H + 45 * M);
        let merged = normalize_busy(&[Span::new(0, 2 * H), Span::new(8 * H, 18 * H)]);
        assert!(!slot_is_free(&slot, &merged));
    }

    // ── free_slots ───────────────────────────────────────

    #[test]
    fn busy_afternoon_slot_is_removed() {
        let zone = Zone::new(chrono_tz::Asia::Tokyo);
        let start = zone
            .local_to_instant(date(), "14:00".parse().unwrap())
            .unwrap();
        let busy = vec![Span::new(start, start + 45 * M)];

        let free = free_slots(&candidates(), &busy, date(), Duration::minutes(45), &zone);
        assert_eq!(
            free,
            times(&["09:00", "10:30", "12:00", "15:30", "17:00"])
        );
    }

    #[test]
    fn no_busy_intervals_returns_all_candidates_in_order() {
        let free = free_slots(&candidates(), &[], date(), Duration::minutes(45), &utc_zone());
        assert_eq!(free, candidates());
    }

    #[test]
    fn busy_interval_spanning_two_slots() {
        let busy = vec![Span::new(day_start() + 10 * H, day_start() + 12 * H + M)];
        let free = free_slots(&candidates(), &busy, date(), Duration::minutes(45), &utc_zone());
        assert_eq!(free, times(&["09:00", "14:00", "15:30", "17:00"]));
    }

    #[test]
    fn busy_ending_at_slot_start_keeps_slot() {
        let busy = vec![Span::new(day_start() + 13 * H, day_start() + 14 * H)];
        let free = free_slots(&candidates(), &busy, date(), Duration::minutes(45), &utc_zone());
        assert_eq!(free, candidates());
    }

    #[test]
    fn longer_duration_reaches_next_busy_block() {
        // 90-minute slots: only 10:30 (to 12:00) covers the 11:30 block.
        let busy = vec![Span::new(day_start() + 11 * H + 30 * M, day_start() + 11 * H + 45 * M)];
        let free = free_slots(&candidates(), &busy, date(), Duration::minutes(90), &utc_zone());
        assert_eq!(free, times(&["09:00", "12:00", "14:00", "15:30", "17:00"]));
    }

    #[test]
    fn nonexistent_local_time_is_dropped() {
        let zone = Zone::new(chrono_tz::Europe::Berlin);
        let dst = NaiveDate::from_ymd_opt(2026, 3, 29).unwrap();
        let free = free_slots(&times(&["02:30", "09:00"]), &[], dst, Duration::minutes(45), &zone);
        assert_eq!(free, times(&["09:00"]));
    }
}
