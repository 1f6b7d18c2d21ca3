//! Core data types for field timelines and sprint delivery.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TimelineError;

/// Tracked issue field. Each field owns an independent timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Status,
    Assignee,
    Sprint,
    StoryPoints,
}

impl FieldType {
    pub const ALL: [Self; 4] = [Self::Status, Self::Assignee, Self::Sprint, Self::StoryPoints];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Assignee => "assignee",
            Self::Sprint => "sprint",
            Self::StoryPoints => "story_points",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = TimelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "status" => Ok(Self::Status),
            "assignee" => Ok(Self::Assignee),
            "sprint" | "iteration" => Ok(Self::Sprint),
            "story_points" | "story-points" | "storypoints" => Ok(Self::StoryPoints),
            other => Err(TimelineError::InvalidFieldType(other.to_string())),
        }
    }
}

/// A single normalized field change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub field_type: FieldType,
    pub new_value: Option<String>,
    pub old_value: Option<String>,
    pub changed_at: DateTime<Utc>,
}

impl ChangeEvent {
    #[must_use]
    pub fn new(
        field_type: FieldType,
        new_value: Option<String>,
        old_value: Option<String>,
        changed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            field_type,
            new_value,
            old_value,
            changed_at,
        }
    }
}

/// Scope of one timeline: a single field of a single issue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimelineKey {
    pub integration_id: String,
    pub issue_id: String,
    pub field_type: FieldType,
}

impl TimelineKey {
    #[must_use]
    pub fn new(integration_id: &str, issue_id: &str, field_type: FieldType) -> Self {
        Self {
            integration_id: integration_id.to_string(),
            issue_id: issue_id.to_string(),
            field_type,
        }
    }

    /// Build an interval on this timeline (id is assigned on insert).
    #[must_use]
    pub fn interval(
        &self,
        value: &str,
        start_at: DateTime<Utc>,
        end_at: Option<DateTime<Utc>>,
        synthetic: bool,
    ) -> TimelineInterval {
        TimelineInterval {
            id: 0,
            integration_id: self.integration_id.clone(),
            issue_id: self.issue_id.clone(),
            field_type: self.field_type,
            value: value.to_string(),
            start_at,
            end_at,
            synthetic,
        }
    }
}

impl fmt::Display for TimelineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.integration_id, self.issue_id, self.field_type)
    }
}

/// Half-open range `[start_at, end_at)` during which a field held `value`.
///
/// `end_at` is `None` only for the most recent interval of a timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineInterval {
    /// Storage row id. 0 until the interval is persisted.
    pub id: i64,
    pub integration_id: String,
    pub issue_id: String,
    pub field_type: FieldType,
    pub value: String,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    /// Inferred rather than observed (leading or missing-field backfill).
    #[serde(default)]
    pub synthetic: bool,
}

impl TimelineInterval {
    #[must_use]
    pub fn key(&self) -> TimelineKey {
        TimelineKey::new(&self.integration_id, &self.issue_id, self.field_type)
    }

    /// True when `at` falls in `[start_at, end_at)`, with an open end
    /// treated as `open_end`.
    #[must_use]
    pub fn covers(&self, at: DateTime<Utc>, open_end: DateTime<Utc>) -> bool {
        let end = self.end_at.unwrap_or(open_end);
        at >= self.start_at && at < end
    }
}

/// Sprint (iteration) metadata, read-only for this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sprint {
    pub id: String,
    pub integration_id: String,
    pub parent_key: String,
    pub name: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Sprint {
    /// The instant delivery is measured at.
    #[must_use]
    pub fn completed_date(&self) -> DateTime<Utc> {
        self.completed_at.unwrap_or(self.end_at)
    }
}

/// Derived row: one per (issue, sprint) the issue was ever a member of.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SprintMembership {
    pub integration_id: String,
    pub issue_id: String,
    pub sprint_id: String,
    pub added_at: DateTime<Utc>,
    pub removed_at: Option<DateTime<Utc>>,
    pub planned: bool,
    pub outside_of_sprint: bool,
    pub delivered: bool,
    pub story_points_planned: f32,
    pub story_points_delivered: f32,
    pub ignorable: bool,
}

/// Persisted issue summary carrying the derived reassignment metrics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRecord {
    pub integration_id: String,
    pub issue_id: String,
    pub issue_type: String,
    pub status: Option<String>,
    pub assignee: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub hops: u32,
    pub bounces: u32,
}

/// Current state of an issue as reported by the tracker connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueSnapshot {
    pub issue_id: String,
    pub issue_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub sprint: Option<String>,
    #[serde(default)]
    pub story_points: Option<f32>,
}

impl IssueSnapshot {
    /// Current value of a tracked field, rendered the way timelines store it.
    #[must_use]
    pub fn current_value(&self, field_type: FieldType) -> Option<String> {
        let value = match field_type {
            FieldType::Status => self.status.clone(),
            FieldType::Assignee => self.assignee.clone(),
            FieldType::Sprint => self.sprint.clone(),
            FieldType::StoryPoints => self.story_points.map(format_story_points),
        };
        value.filter(|v| !v.trim().is_empty())
    }
}

/// Reassignment metrics derived from an assignee timeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopsBounces {
    pub hops: u32,
    pub bounces: u32,
}

/// Render story points without a trailing `.0` for whole numbers.
#[must_use]
pub fn format_story_points(points: f32) -> String {
    if points.fract() == 0.0 && points.abs() < 1e9 {
        format!("{points:.0}")
    } else {
        points.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn field_type_round_trips_through_str() {
        for field in FieldType::ALL {
            assert_eq!(field.as_str().parse::<FieldType>().unwrap(), field);
        }
        assert!("priority".parse::<FieldType>().is_err());
    }

    #[test]
    fn interval_cover_is_half_open() {
        let key = TimelineKey::new("1", "WI-1", FieldType::Status);
        let interval = key.interval("Active", at(100), Some(at(200)), false);
        assert!(interval.covers(at(100), at(1000)));
        assert!(interval.covers(at(199), at(1000)));
        assert!(!interval.covers(at(200), at(1000)));
        assert!(!interval.covers(at(99), at(1000)));

        let open = key.interval("Done", at(200), None, false);
        assert!(open.covers(at(999), at(1000)));
        assert!(!open.covers(at(1000), at(1000)));
    }

    #[test]
    fn completed_date_falls_back_to_end() {
        let mut sprint = Sprint {
            id: "Proj\\Sprint 1".to_string(),
            integration_id: "1".to_string(),
            parent_key: "Proj".to_string(),
            name: "Sprint 1".to_string(),
            start_at: at(1000),
            end_at: at(2000),
            completed_at: None,
        };
        assert_eq!(sprint.completed_date(), at(2000));
        sprint.completed_at = Some(at(1900));
        assert_eq!(sprint.completed_date(), at(1900));
    }

    #[test]
    fn story_points_render_whole_numbers_plainly() {
        assert_eq!(format_story_points(5.0), "5");
        assert_eq!(format_story_points(2.5), "2.5");
    }

    #[test]
    fn snapshot_ignores_blank_values() {
        let snapshot = IssueSnapshot {
            issue_id: "WI-1".to_string(),
            issue_type: "Bug".to_string(),
            created_at: at(0),
            updated_at: at(10),
            resolved_at: None,
            status: Some("  ".to_string()),
            assignee: Some("alice".to_string()),
            sprint: None,
            story_points: Some(3.0),
        };
        assert_eq!(snapshot.current_value(FieldType::Status), None);
        assert_eq!(snapshot.current_value(FieldType::Assignee).as_deref(), Some("alice"));
        assert_eq!(snapshot.current_value(FieldType::StoryPoints).as_deref(), Some("3"));
    }
}
