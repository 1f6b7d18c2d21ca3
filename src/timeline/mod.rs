//! Timeline reconstruction.
//!
//! Each (integration, issue, field) timeline is a sequence of half-open
//! intervals ordered by start. Applying a [`ChangeEvent`] keeps that sequence
//! contiguous and non-overlapping, whatever order events arrive in and however
//! often they are replayed.
//!
//! Every change is expressed as a [`TimelineOp`] and executed through
//! [`TimelineStore::apply`], so the storage layer can audit it.

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::error::Result;
use crate::model::{ChangeEvent, FieldType, IssueSnapshot, TimelineInterval, TimelineKey};
use crate::storage::TimelineStore;

/// A single timeline mutation.
///
/// A replacement is a [`TimelineOp::Delete`] followed by a [`TimelineOp::Insert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineOp {
    /// Insert; no-op if an interval already starts at the same instant.
    Insert(TimelineInterval),
    /// Insert, or overwrite value/end/synthetic of the interval at the same start.
    Upsert(TimelineInterval),
    /// Move the end of a stored interval.
    UpdateEnd {
        interval: TimelineInterval,
        end_at: DateTime<Utc>,
    },
    /// Remove a stored interval.
    Delete(TimelineInterval),
}

impl TimelineOp {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Insert(_) => "insert",
            Self::Upsert(_) => "upsert",
            Self::UpdateEnd { .. } => "update_end",
            Self::Delete(_) => "delete",
        }
    }

    #[must_use]
    pub fn key(&self) -> TimelineKey {
        match self {
            Self::Insert(iv) | Self::Upsert(iv) | Self::Delete(iv) => iv.key(),
            Self::UpdateEnd { interval, .. } => interval.key(),
        }
    }
}

/// Apply one change event to its timeline.
///
/// Returns the operations that changed storage; an empty vector means the
/// event was already fully reflected (a replay).
///
/// # Errors
///
/// Returns an error if a store lookup or mutation fails.
pub fn apply_event<S>(store: &mut S, key: &TimelineKey, event: &ChangeEvent) -> Result<Vec<TimelineOp>>
where
    S: TimelineStore + ?Sized,
{
    let mut plan = Vec::new();
    if let Some(old_value) = event.old_value.as_deref() {
        plan.extend(leading_backfill(store, key, old_value, event.changed_at)?);
    }

    let mut applied = run(store, plan)?;
    let stitching = stitch(store, key, event)?;
    applied.extend(run(store, stitching)?);

    trace!(
        key = %key,
        at = %event.changed_at,
        value = ?event.new_value,
        ops = applied.len(),
        "applied change event"
    );
    Ok(applied)
}

/// Decide what to do with the synthetic interval `{old_value, [epoch, changed_at)}`.
///
/// Observed intervals are never removed; a synthetic leading interval is
/// replaced only when the new one is strictly shorter.
fn leading_backfill<S>(
    store: &S,
    key: &TimelineKey,
    old_value: &str,
    changed_at: DateTime<Utc>,
) -> Result<Vec<TimelineOp>>
where
    S: TimelineStore + ?Sized,
{
    let synthetic = key.interval(old_value, DateTime::UNIX_EPOCH, Some(changed_at), true);
    let Some(first) = store.first_interval(key)? else {
        return Ok(vec![TimelineOp::Insert(synthetic)]);
    };

    if first.synthetic {
        let ends_later = first.end_at.is_none_or(|end| end > changed_at);
        if ends_later {
            debug!(key = %key, stale_end = ?first.end_at, corrected_end = %changed_at, "replacing leading interval");
            return Ok(vec![TimelineOp::Delete(first), TimelineOp::Insert(synthetic)]);
        }
        return Ok(Vec::new());
    }

    if changed_at <= first.start_at {
        // Earlier than anything observed so far: history starts here.
        return Ok(vec![TimelineOp::Insert(synthetic)]);
    }
    Ok(Vec::new())
}

/// Close the preceding interval at `changed_at` and upsert the event's own.
fn stitch<S>(store: &S, key: &TimelineKey, event: &ChangeEvent) -> Result<Vec<TimelineOp>>
where
    S: TimelineStore + ?Sized,
{
    let at = event.changed_at;
    let mut plan = Vec::new();

    if let Some(prev) = store.last_interval_before(key, at)? {
        if prev.end_at != Some(at) {
            plan.push(TimelineOp::UpdateEnd {
                interval: prev,
                end_at: at,
            });
        }
    }

    if let Some(value) = event.new_value.as_deref() {
        let end_at = store.first_interval_after(key, at)?.map(|next| next.start_at);
        plan.push(TimelineOp::Upsert(key.interval(value, at, end_at, false)));
    }
    Ok(plan)
}

fn run<S>(store: &mut S, plan: Vec<TimelineOp>) -> Result<Vec<TimelineOp>>
where
    S: TimelineStore + ?Sized,
{
    let mut applied = Vec::with_capacity(plan.len());
    for op in plan {
        if store.apply(&op)? {
            applied.push(op);
        }
    }
    Ok(applied)
}

/// Give every field with a known current value at least one interval.
///
/// Fields that already have intervals are left alone. The synthetic interval
/// starts at creation and stays open: it is the only, and so the latest,
/// interval of its field, and later events close it by stitching.
///
/// # Errors
///
/// Returns an error if a store lookup or mutation fails.
pub fn backfill_missing_fields<S>(
    store: &mut S,
    integration_id: &str,
    snapshot: &IssueSnapshot,
) -> Result<Vec<TimelineOp>>
where
    S: TimelineStore + ?Sized,
{
    let present = store.field_types_present(integration_id, &snapshot.issue_id)?;

    let mut plan = Vec::new();
    for field_type in FieldType::ALL {
        if present.contains(&field_type) {
            continue;
        }
        let Some(value) = snapshot.current_value(field_type) else {
            continue;
        };
        let key = TimelineKey::new(integration_id, &snapshot.issue_id, field_type);
        debug!(key = %key, value = %value, "backfilling field without history");
        plan.push(TimelineOp::Insert(key.interval(&value, snapshot.created_at, None, true)));
    }
    run(store, plan)
}

/// Move epoch-zero leading intervals of an issue to its creation time.
///
/// # Errors
///
/// Returns an error if the store update fails.
pub fn anchor_zero_starts<S>(
    store: &mut S,
    integration_id: &str,
    issue_id: &str,
    created_at: DateTime<Utc>,
) -> Result<usize>
where
    S: TimelineStore + ?Sized,
{
    if created_at <= DateTime::UNIX_EPOCH {
        return Ok(0);
    }
    store.anchor_zero_starts(integration_id, issue_id, created_at)
}

/// Check the continuity invariant over intervals sorted by start.
///
/// Returns the first offending pair, if any.
#[must_use]
pub fn find_discontinuity(intervals: &[TimelineInterval]) -> Option<(&TimelineInterval, &TimelineInterval)> {
    intervals
        .windows(2)
        .find(|pair| pair[0].end_at != Some(pair[1].start_at))
        .map(|pair| (&pair[0], &pair[1]))
}
