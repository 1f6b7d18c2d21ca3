//! Jira changelog histories.
//!
//! A record is one changelog history entry:
//!
//! ```json
//! { "id": "10001", "created": "2021-05-01T10:00:00.000+0000",
//!   "items": [ { "field": "status", "fromString": "To Do", "toString": "Done" } ] }
//! ```
//!
//! Sprint values are rewritten as `<project key><separator><sprint name>` so
//! the sprint resolver can split them like an iteration path.

use serde_json::Value;
use tracing::trace;

use super::{EventNormalizer, IssueContext, TrackerKind, parse_timestamp, scalar_to_value};
use crate::config::PipelineConfig;
use crate::error::{Result, TimelineError};
use crate::model::{ChangeEvent, FieldType};

pub const DEFAULT_STORY_POINTS_FIELD: &str = "Story Points";

#[derive(Debug, Clone)]
pub struct JiraNormalizer {
    story_points_field: String,
    unassigned: String,
    sprint_separator: String,
}

impl JiraNormalizer {
    #[must_use]
    pub fn new(
        story_points_field: impl Into<String>,
        unassigned: impl Into<String>,
        sprint_separator: impl Into<String>,
    ) -> Self {
        Self {
            story_points_field: story_points_field.into(),
            unassigned: unassigned.into(),
            sprint_separator: sprint_separator.into(),
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
            config.sprint_path_separator.as_str(),
        )
    }

    fn field_for(&self, item: &Value) -> Option<FieldType> {
        let name = item.get("field").and_then(Value::as_str)?;
        if name.eq_ignore_ascii_case(&self.story_points_field) {
            return Some(FieldType::StoryPoints);
        }
        match name.to_ascii_lowercase().as_str() {
            "status" => Some(FieldType::Status),
            "assignee" => Some(FieldType::Assignee),
            "sprint" => Some(FieldType::Sprint),
            _ => None,
        }
    }

    fn side(
        &self,
        item: &Value,
        field_type: FieldType,
        project: &str,
        (id_key, text_key): (&str, &str),
    ) -> Option<String> {
        let text = item.get(text_key).and_then(scalar_to_value);
        match field_type {
            FieldType::Assignee => item.get(id_key).and_then(scalar_to_value).or(text),
            FieldType::Sprint => text.and_then(|names| self.sprint_path(&names, project)),
            FieldType::Status | FieldType::StoryPoints => text,
        }
    }

    fn sprint_path(&self, names: &str, project: &str) -> Option<String> {
        // Multi-sprint issues list every sprint; the last one is current.
        let name = names.rsplit(',').map(str::trim).find(|s| !s.is_empty())?;
        if project.is_empty() {
            Some(name.to_string())
        } else {
            Some(format!("{project}{}{name}", self.sprint_separator))
        }
    }
}

fn project_key(issue_id: &str) -> &str {
    issue_id.split_once('-').map_or("", |(project, _)| project)
}

impl EventNormalizer for JiraNormalizer {
    fn tracker(&self) -> TrackerKind {
        TrackerKind::Jira
    }

    fn normalize(&self, record: &Value, issue: &IssueContext) -> Result<Vec<ChangeEvent>> {
        let items = record
            .get("items")
            .and_then(Value::as_array)
            .ok_or_else(|| TimelineError::malformed("changelog entry has no items array"))?;

        let tracked: Vec<(FieldType, &Value)> = items
            .iter()
            .filter_map(|item| self.field_for(item).map(|f| (f, item)))
            .collect();
        if tracked.is_empty() {
            return Ok(Vec::new());
        }

        let changed_at = record
            .get("created")
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
            .ok_or_else(|| {
                TimelineError::malformed(format!(
                    "changelog {} of {} has no parsable created timestamp",
                    record.get("id").map_or_else(|| "?".to_string(), Value::to_string),
                    issue.issue_id
                ))
            })?;

        let project = project_key(&issue.issue_id);
        let mut events = Vec::with_capacity(tracked.len());
        for (field_type, item) in tracked {
            let mut new_value = self.side(item, field_type, project, ("to", "toString"));
            let mut old_value = self.side(item, field_type, project, ("from", "fromString"));
            if field_type == FieldType::Assignee {
                new_value = new_value.or_else(|| Some(self.unassigned.clone()));
                if old_value.is_none() && item.get("from").is_some_and(|v| !v.is_null()) {
                    old_value = Some(self.unassigned.clone());
                }
            }
            trace!(issue = %issue.issue_id, field = %field_type, ?new_value, ?old_value, "normalized changelog item");
            events.push(ChangeEvent::new(field_type, new_value, old_value, changed_at));
        }
        Ok(events)
    }
}
