//! Reassignment metrics derived from assignee timelines.
//!
//! A hop is any change of assignee; a bounce is a hop back to someone who
//! already had the issue. The unassigned sentinel counts as neither.

use std::collections::HashSet;

use crate::model::{HopsBounces, TimelineInterval};

/// Count hops and bounces over assignee values in timeline order.
///
/// Values equal to `unassigned` (case-insensitive) or blank are dropped first.
#[must_use]
pub fn hops_and_bounces<I, S>(values: I, unassigned: &str) -> HopsBounces
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut count: u32 = 0;
    let mut distinct = HashSet::new();
    for value in values {
        let value = value.as_ref().trim();
        if value.is_empty() || value.eq_ignore_ascii_case(unassigned) {
            continue;
        }
        count += 1;
        distinct.insert(value.to_string());
    }

    let distinct = u32::try_from(distinct.len()).unwrap_or(u32::MAX);
    HopsBounces {
        hops: count.saturating_sub(1),
        bounces: count.saturating_sub(distinct),
    }
}

impl HopsBounces {
    /// Compute from stored assignee intervals, ordering them by start.
    #[must_use]
    pub fn from_intervals(intervals: &[TimelineInterval], unassigned: &str) -> Self {
        let mut ordered: Vec<&TimelineInterval> = intervals.iter().collect();
        ordered.sort_by_key(|iv| (iv.start_at, iv.id));
        hops_and_bounces(ordered.iter().map(|iv| iv.value.as_str()), unassigned)
    }
}
