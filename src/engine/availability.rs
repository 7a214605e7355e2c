use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

// ── Availability Algorithm ────────────────────────────────────────

/// Resolve the open windows of a business on `date` from its rules.
///
/// Precedence: SPECIFIC_DATE > DATE_RANGE > RECURRING_WEEKLY. A closed
/// SPECIFIC_DATE rule empties the date no matter what else applies.
/// Within the winning kind the highest `priority` wins; a tie at the top
/// is a configuration error. No applicable rule means closed.
pub fn resolve_windows(
    business_id: Ulid,
    rules: &[AvailabilityRule],
    date: NaiveDate,
) -> Result<Vec<TimeSlot>, EngineError> {
    Ok(winning_rule(business_id, rules, date)?
        .filter(|r| r.open)
        .map(open_windows)
        .unwrap_or_default())
}

/// The rule that decides `date`, if any applies.
pub fn winning_rule<'a>(
    business_id: Ulid,
    rules: &'a [AvailabilityRule],
    date: NaiveDate,
) -> Result<Option<&'a AvailabilityRule>, EngineError> {
    let applicable: Vec<&AvailabilityRule> = rules
        .iter()
        .filter(|r| r.is_active && r.kind.applies_to(date))
        .collect();

    if let Some(closed) = applicable
        .iter()
        .find(|r| !r.open && matches!(r.kind, AvailabilityKind::SpecificDate { .. }))
    {
        return Ok(Some(*closed));
    }

    let Some(top_specificity) = applicable.iter().map(|r| r.kind.specificity()).max() else {
        return Ok(None);
    };
    let tier: Vec<&AvailabilityRule> = applicable
        .into_iter()
        .filter(|r| r.kind.specificity() == top_specificity)
        .collect();

    let top_priority = tier.iter().map(|r| r.priority).max().unwrap_or_default();
    let mut winners: Vec<&AvailabilityRule> =
        tier.into_iter().filter(|r| r.priority == top_priority).collect();
    if winners.len() > 1 {
        let mut ids: Vec<Ulid> = winners.iter().map(|r| r.id).collect();
        ids.sort();
        return Err(EngineError::AmbiguousAvailability {
            business_id,
            date,
            rules: ids,
        });
    }
    Ok(winners.pop())
}

/// Blocked windows of an open rule, clipped to its open windows.
pub fn blocked_windows(rule: &AvailabilityRule) -> Vec<TimeSlot> {
    if !rule.open || rule.blocked.is_empty() {
        return Vec::new();
    }
    let mut windows = rule.windows.clone();
    windows.sort_by_key(|w| w.start);
    let windows = merge_overlapping(&windows);
    let mut blocked = rule.blocked.clone();
    blocked.sort_by_key(|b| b.start);

    let mut clipped = Vec::new();
    for b in merge_overlapping(&blocked) {
        for w in &windows {
            let (start, end) = (b.start.max(w.start), b.end.min(w.end));
            if start < end {
                clipped.push(TimeSlot::new(start, end));
            }
        }
    }
    clipped
}

/// Merged open windows of one rule with its blocked windows removed.
pub fn open_windows(rule: &AvailabilityRule) -> Vec<TimeSlot> {
    let mut windows = rule.windows.clone();
    windows.sort_by_key(|w| w.start);
    let windows = merge_overlapping(&windows);

    if rule.blocked.is_empty() {
        return windows;
    }
    let mut blocked = rule.blocked.clone();
    blocked.sort_by_key(|b| b.start);
    let blocked = merge_overlapping(&blocked);
    subtract_intervals(&windows, &blocked)
}

/// Cut windows into whole slots of `granularity` minutes, each window
/// starting its own grid. A trailing partial slot is dropped.
pub fn partition_slots(windows: &[TimeSlot], granularity: Minute) -> Vec<TimeSlot> {
    if granularity == 0 {
        return Vec::new();
    }
    let mut slots = Vec::new();
    for w in windows {
        let mut start = w.start;
        while start + granularity <= w.end {
            slots.push(TimeSlot::new(start, start + granularity));
            start += granularity;
        }
    }
    slots
}

/// Merge sorted overlapping/adjacent windows into disjoint windows.
pub fn merge_overlapping(sorted: &[TimeSlot]) -> Vec<TimeSlot> {
    let mut merged: Vec<TimeSlot> = Vec::new();
    for &w in sorted {
        if let Some(last) = merged.last_mut()
            && w.start <= last.end {
                last.end = last.end.max(w.end);
                continue;
            }
        merged.push(w);
    }
    merged
}

/// Remove `to_remove` from `base`. Both inputs sorted and disjoint.
pub fn subtract_intervals(base: &[TimeSlot], to_remove: &[TimeSlot]) -> Vec<TimeSlot> {
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
                result.push(TimeSlot::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(TimeSlot::new(current_start, current_end));
        }
    }

    result
}
