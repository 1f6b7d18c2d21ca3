//! Sprint delivery classifier.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::{LookupCaches, end_of_day, parse_sprint_path};
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::model::{SprintMembership, TimelineInterval};
use crate::storage::MetadataStore;

/// Everything the classifier needs about one sprint stay of one issue.
#[derive(Debug, Clone, Copy)]
pub struct ClassifierInput<'a> {
    pub integration_id: &'a str,
    pub issue_id: &'a str,
    pub issue_type: &'a str,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Sprint interval after [`sanitize_memberships`](super::sanitize_memberships).
    pub membership: &'a TimelineInterval,
    /// Status timeline in stored order.
    pub statuses: &'a [TimelineInterval],
    /// Story point timeline in stored order.
    pub story_points: &'a [TimelineInterval],
    /// Open status and story point intervals end here.
    pub processing_time: DateTime<Utc>,
}

/// Classify one sprint membership interval.
///
/// Returns `Ok(None)` when the sprint path cannot be parsed or the sprint is
/// unknown; the caller skips that membership.
///
/// # Errors
///
/// Returns an error if a metadata lookup fails.
pub fn classify<M>(
    input: &ClassifierInput<'_>,
    caches: &mut LookupCaches,
    metadata: &M,
    config: &PipelineConfig,
) -> Result<Option<SprintMembership>>
where
    M: MetadataStore + ?Sized,
{
    let path = input.membership.value.as_str();
    let Some((parent_key, name)) = parse_sprint_path(path, &config.sprint_path_separator) else {
        warn!(issue = input.issue_id, sprint = path, "unparsable sprint path, skipping membership");
        return Ok(None);
    };
    let Some(sprint) = caches.sprint(metadata, input.integration_id, parent_key, name)? else {
        warn!(issue = input.issue_id, sprint = path, "sprint not found, skipping membership");
        return Ok(None);
    };

    let added_at = input.membership.start_at;
    // An end at exactly end-of-day was put there by sanitizing an open stay.
    let removed_at = input
        .membership
        .end_at
        .filter(|end| *end != end_of_day(input.processing_time));
    let completed_at = sprint.completed_date();

    let (planned, mut outside_of_sprint) = match input.resolved_at {
        Some(resolved_at) => {
            let outside = resolved_at < sprint.start_at;
            (!outside, outside)
        }
        None => (added_at < sprint.start_at, false),
    };

    let planned_at = if planned { sprint.start_at } else { added_at };
    let story_points_planned = story_points_at(input, planned_at, config);
    let story_points_delivered = story_points_at(input, completed_at, config);

    let closed = closed_status_at(input, completed_at, caches, metadata, config)?;
    let delivered = closed.is_some();
    if closed.is_some_and(|status| status.start_at < sprint.start_at) {
        // Already closed before the sprint began.
        outside_of_sprint = true;
    }

    debug!(
        issue = input.issue_id,
        sprint = %sprint.id,
        planned,
        delivered,
        outside_of_sprint,
        story_points_planned,
        story_points_delivered,
        "classified sprint membership"
    );

    Ok(Some(SprintMembership {
        integration_id: input.integration_id.to_string(),
        issue_id: input.issue_id.to_string(),
        sprint_id: sprint.id,
        added_at,
        removed_at,
        planned,
        outside_of_sprint,
        delivered,
        story_points_planned,
        story_points_delivered,
        ignorable: config.is_ignorable_type(input.issue_type),
    }))
}

fn story_points_at(input: &ClassifierInput<'_>, at: DateTime<Utc>, config: &PipelineConfig) -> f32 {
    let covering = input
        .story_points
        .iter()
        .filter(|iv| iv.covers(at, input.processing_time));
    let Some(interval) = config.overlap_policy.pick(covering) else {
        return 0.0;
    };
    parse_story_points(&interval.value).unwrap_or_else(|| {
        warn!(issue = input.issue_id, value = %interval.value, "unparsable story points, counting 0");
        0.0
    })
}

fn closed_status_at<'a, M>(
    input: &ClassifierInput<'a>,
    at: DateTime<Utc>,
    caches: &mut LookupCaches,
    metadata: &M,
    config: &PipelineConfig,
) -> Result<Option<&'a TimelineInterval>>
where
    M: MetadataStore + ?Sized,
{
    let mut closed = Vec::new();
    for status in input.statuses.iter().filter(|iv| iv.covers(at, input.processing_time)) {
        let category = caches.status_category(metadata, input.integration_id, &status.value)?;
        // Unknown categories count as not closed.
        if category.is_some_and(|c| config.is_closed_category(&c)) {
            closed.push(status);
        }
    }
    Ok(config.overlap_policy.pick(closed))
}

/// Parse a stored story point value.
///
/// Blank and `null` are zero; anything else that is not a finite number is
/// `None`.
#[must_use]
pub fn parse_story_points(raw: &str) -> Option<f32> {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("null") {
        return Some(0.0);
    }
    raw.parse::<f32>().ok().filter(|v| v.is_finite())
}
