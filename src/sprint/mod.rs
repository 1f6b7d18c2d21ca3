//! Sprint delivery classification.
//!
//! Sprint membership comes from the issue's `sprint` timeline: each interval
//! is one stay in one sprint. [`sanitize_memberships`] prepares those intervals
//! for a processing run, and [`classify`] turns each into a
//! [`SprintMembership`](crate::model::SprintMembership) row.

pub mod cache;
pub mod classifier;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TimelineError;
use crate::model::TimelineInterval;

pub use cache::{BoundedCache, LookupCaches};
pub use classifier::{ClassifierInput, classify, parse_story_points};

/// Which interval wins when stale data leaves several covering one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverlapPolicy {
    /// Oldest stored interval wins.
    #[default]
    FirstMatch,
    /// Most recently started interval wins.
    LastMatch,
}

impl OverlapPolicy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FirstMatch => "first-match",
            Self::LastMatch => "last-match",
        }
    }

    /// Pick one element out of candidates given in stored order.
    pub fn pick<T, I>(self, candidates: I) -> Option<T>
    where
        I: IntoIterator<Item = T>,
    {
        let mut iter = candidates.into_iter();
        match self {
            Self::FirstMatch => iter.next(),
            Self::LastMatch => iter.last(),
        }
    }
}

impl fmt::Display for OverlapPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OverlapPolicy {
    type Err = TimelineError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "first-match" | "first" => Ok(Self::FirstMatch),
            "last-match" | "last" => Ok(Self::LastMatch),
            other => Err(TimelineError::Config(format!(
                "Invalid overlap policy: {other}. Must be one of: first-match, last-match"
            ))),
        }
    }
}

/// Split a sprint path on its last separator into `(parent_key, name)`.
///
/// `Proj\Team\Sprint 4` with `\` gives `("Proj\Team", "Sprint 4")`. Returns
/// `None` when there is no separator or either side is blank.
#[must_use]
pub fn parse_sprint_path<'a>(path: &'a str, separator: &str) -> Option<(&'a str, &'a str)> {
    if separator.is_empty() {
        return None;
    }
    let (parent, name) = path.rsplit_once(separator)?;
    let (parent, name) = (parent.trim(), name.trim());
    if parent.is_empty() || name.is_empty() {
        return None;
    }
    Some((parent, name))
}

/// Last second (23:59:59 UTC) of the day containing `at`.
#[must_use]
pub fn end_of_day(at: DateTime<Utc>) -> DateTime<Utc> {
    let start = at.date_naive().and_time(NaiveTime::MIN).and_utc();
    start + Duration::days(1) - Duration::seconds(1)
}

/// Close still-open sprint intervals at the end of the processing day.
///
/// The classifier recognizes that exact instant and reports such memberships
/// as not removed.
#[must_use]
pub fn sanitize_memberships(
    intervals: &[TimelineInterval],
    processing_time: DateTime<Utc>,
) -> Vec<TimelineInterval> {
    let day_end = end_of_day(processing_time);
    intervals
        .iter()
        .cloned()
        .map(|mut iv| {
            if iv.end_at.is_none() {
                iv.end_at = Some(day_end.max(iv.start_at));
            }
            iv
        })
        .collect()
}
