use std::sync::Arc;

use tracing::warn;

use crate::model::*;
use crate::observability::AVAILABILITY_FAIL_OPEN_TOTAL;
use crate::store::AvailabilityStore;

/// Whether `span` may be booked given the configured windows.
///
/// Fail-open: no source, an empty window set, or a failed lookup all allow
/// the slot. Otherwise some single window must contain the whole span;
/// adjacent windows are not joined.
pub async fn is_within_availability(
    source: Option<&Arc<dyn AvailabilityStore>>,
    span: &Span,
) -> bool {
    let Some(source) = source else {
        return true;
    };
    let windows = match source.list_all().await {
        Ok(windows) => windows,
        Err(e) => {
            warn!(error = %e, "availability lookup failed, allowing slot");
            metrics::counter!(AVAILABILITY_FAIL_OPEN_TOTAL, "cause" => "error").increment(1);
            return true;
        }
    };
    if windows.is_empty() {
        warn!("no availability windows configured, allowing slot");
        metrics::counter!(AVAILABILITY_FAIL_OPEN_TOTAL, "cause" => "empty").increment(1);
        return true;
    }
    window_contains(&windows, span)
}

pub fn window_contains(windows: &[AvailabilityWindow], span: &Span) -> bool {
    windows.iter().any(|w| w.span.contains_span(span))
}

/// Free time inside `query`: the union of the windows (or the whole query
/// when none are configured) minus the busy spans.
pub fn open_slots(windows: &[AvailabilityWindow], busy: &[Span], query: &Span) -> Vec<Span> {
    let mut base: Vec<Span> = if windows.is_empty() {
        vec![*query]
    } else {
        windows
            .iter()
            .filter(|w| w.span.overlaps(query))
            .map(|w| Span::new(w.span.start.max(query.start), w.span.end.min(query.end)))
            .collect()
    };
    base.sort_by_key(|s| s.start);
    let base = merge_overlapping(&base);

    let mut busy: Vec<Span> = busy.to_vec();
    busy.sort_by_key(|s| s.start);
    let busy = merge_overlapping(&busy);

    subtract_intervals(&base, &busy)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
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

/// Both inputs sorted and disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}
