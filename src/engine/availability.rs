use crate::limits::*;
use crate::model::*;

use super::EngineError;

// ── Bookability ───────────────────────────────────────────────────

/// A window is bookable iff it is declared available, has spare capacity,
/// and starts at least `min_lead_secs` after `now`. Past windows fall out
/// of the lead-time check for free.
pub fn window_bookable(slot: &SlotState, now: Secs, min_lead_secs: i64) -> bool {
    slot.is_available
        && slot.has_capacity()
        && slot.key.start_at().timestamp() >= now + min_lead_secs
}

/// Validate a requested lesson window: hour-aligned by construction, must be
/// non-empty, end by midnight, and stay under the lesson length cap.
pub fn validate_window(start_hour: u8, end_hour: u8) -> Result<(), EngineError> {
    if start_hour >= end_hour {
        return Err(EngineError::LimitExceeded("window start must precede end"));
    }
    if end_hour > HOURS_PER_DAY {
        return Err(EngineError::LimitExceeded("window ends past midnight"));
    }
    if end_hour - start_hour > MAX_LESSON_HOURS {
        return Err(EngineError::LimitExceeded("lesson too long"));
    }
    Ok(())
}

// ── Span set math (reconciliation) ────────────────────────────────

/// Merge overlapping/adjacent spans into disjoint ones. Input need not be
/// sorted.
pub fn merge_spans(spans: &[Span]) -> Vec<Span> {
    let mut sorted = spans.to_vec();
    sorted.sort_by_key(|s| s.start);
    let mut merged: Vec<Span> = Vec::new();
    for span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// Intersect two disjoint sorted span sets (two-pointer sweep).
pub fn intersect_span_sets(a: &[Span], b: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if let Some(overlap) = a[i].intersect(&b[j]) {
            result.push(overlap);
        }
        if a[i].end <= b[j].end {
            i += 1;
        } else {
            j += 1;
        }
    }
    result
}

pub fn total_secs(spans: &[Span]) -> i64 {
    spans.iter().map(|s| s.duration_secs()).sum()
}
