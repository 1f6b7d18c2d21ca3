//! Azure DevOps work item updates.
//!
//! A record is one entry of the work item `updates` API:
//!
//! ```json
//! { "rev": 3, "revisedDate": "2021-05-02T09:00:00Z",
//!   "fields": { "System.State": { "oldValue": "New", "newValue": "Active" } } }
//! ```

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::trace;

use super::{EventNormalizer, IssueContext, TrackerKind, parse_timestamp, scalar_to_value};
use crate::config::PipelineConfig;
use crate::error::{Result, TimelineError};
use crate::model::{ChangeEvent, FieldType};

pub const DEFAULT_STORY_POINTS_FIELD: &str = "Microsoft.VSTS.Scheduling.StoryPoints";

const STATE_FIELD: &str = "System.State";
const ASSIGNED_TO_FIELD: &str = "System.AssignedTo";
const ITERATION_PATH_FIELD: &str = "System.IterationPath";
const CHANGED_DATE_FIELD: &str = "System.ChangedDate";

/// `revisedDate` of the latest revision; not a real change time.
const FAR_FUTURE_YEAR: &str = "9999-";

#[derive(Debug, Clone)]
pub struct AzureDevopsNormalizer {
    story_points_field: String,
    unassigned: String,
}

impl AzureDevopsNormalizer {
    #[must_use]
    pub fn new(story_points_field: impl Into<String>, unassigned: impl Into<String>) -> Self {
        Self {
            story_points_field: story_points_field.into(),
            unassigned: unassigned.into(),
        }
    }

    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config
                .story_points_field
                .as_deref()
                .unwrap_or(DEFAULT_STORY_POINTS_FIELD),
            config.unassigned.as_str(),
        )
    }

    fn changed_at(record: &Value, issue: &IssueContext) -> Option<DateTime<Utc>> {
        let from_field = record
            .get("fields")
            .and_then(|f| f.get(CHANGED_DATE_FIELD))
            .and_then(|f| f.get("newValue"))
            .and_then(Value::as_str)
            .and_then(parse_timestamp);
        if from_field.is_some() {
            return from_field;
        }

        let revised = record
            .get("revisedDate")
            .and_then(Value::as_str)
            .filter(|raw| !raw.starts_with(FAR_FUTURE_YEAR))
            .and_then(parse_timestamp);
        if revised.is_some() {
            return revised;
        }

        // The creation revision carries no change time of its own.
        if record.get("rev").and_then(Value::as_i64) == Some(1) {
            return Some(issue.created_at);
        }
        None
    }

    fn identity(&self, value: Option<&Value>) -> Option<String> {
        let name = match value {
            Some(Value::Object(obj)) => obj
                .get("uniqueName")
                .or_else(|| obj.get("displayName"))
                .and_then(scalar_to_value),
            Some(other) => scalar_to_value(other),
            None => None,
        };
        name.or_else(|| Some(self.unassigned.clone()))
    }

    fn field_for(&self, reference_name: &str) -> Option<FieldType> {
        match reference_name {
            STATE_FIELD => Some(FieldType::Status),
            ASSIGNED_TO_FIELD => Some(FieldType::Assignee),
            ITERATION_PATH_FIELD => Some(FieldType::Sprint),
            name if name == self.story_points_field => Some(FieldType::StoryPoints),
            _ => None,
        }
    }
}

impl EventNormalizer for AzureDevopsNormalizer {
    fn tracker(&self) -> TrackerKind {
        TrackerKind::AzureDevops
    }

    fn normalize(&self, record: &Value, issue: &IssueContext) -> Result<Vec<ChangeEvent>> {
        let Some(fields) = record.get("fields").and_then(Value::as_object) else {
            // Link-only or comment-only updates carry no field changes.
            return Ok(Vec::new());
        };
        let tracked: Vec<(FieldType, &Value)> = fields
            .iter()
            .filter_map(|(name, change)| self.field_for(name).map(|f| (f, change)))
            .collect();
        if tracked.is_empty() {
            return Ok(Vec::new());
        }

        let changed_at = Self::changed_at(record, issue).ok_or_else(|| {
            TimelineError::malformed(format!(
                "update rev {} of {} has no change timestamp",
                record.get("rev").map_or_else(|| "?".to_string(), Value::to_string),
                issue.issue_id
            ))
        })?;

        let mut events = Vec::with_capacity(tracked.len());
        for (field_type, change) in tracked {
            let (new_value, old_value) = if field_type == FieldType::Assignee {
                (
                    self.identity(change.get("newValue")),
                    change
                        .get("oldValue")
                        .and_then(|old| self.identity(Some(old))),
                )
            } else {
                (
                    change.get("newValue").and_then(scalar_to_value),
                    change.get("oldValue").and_then(scalar_to_value),
                )
            };
            trace!(issue = %issue.issue_id, field = %field_type, ?new_value, ?old_value, "normalized update");
            events.push(ChangeEvent::new(field_type, new_value, old_value, changed_at));
        }

        // serde_json maps iterate in key order; keep output stable by field.
        events.sort_by_key(|e| e.field_type);
        Ok(events)
    }
}
