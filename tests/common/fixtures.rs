//! Builders for issue snapshots, tracker history records and sprint metadata.

use chrono::{DateTime, TimeZone, Utc};
use issue_timeline::model::{IssueSnapshot, Sprint};
use issue_timeline::pipeline::{IssueBatch, IssueInput};
use issue_timeline::storage::SqliteStorage;
use serde_json::{Value, json};

pub const INTEGRATION: &str = "42";

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

/// 2021-05-`day` at `hour`:00 UTC.
pub fn may(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2021, 5, day, hour, 0, 0).unwrap()
}

pub fn snapshot(issue_id: &str, created_at: DateTime<Utc>, updated_at: DateTime<Utc>) -> IssueSnapshot {
    IssueSnapshot {
        issue_id: issue_id.to_string(),
        issue_type: "User Story".to_string(),
        created_at,
        updated_at,
        resolved_at: None,
        status: None,
        assignee: None,
        sprint: None,
        story_points: None,
    }
}

pub fn batch(issues: Vec<IssueInput>) -> IssueBatch {
    IssueBatch {
        integration_id: INTEGRATION.to_string(),
        issues,
    }
}

/// One Azure DevOps work item update.
///
/// `fields` maps reference names to `(old, new)` values; assignee values are
/// wrapped as identities.
pub fn azure_update(rev: i64, changed_at: DateTime<Utc>, fields: &[(&str, Option<&str>, Option<&str>)]) -> Value {
    let mut map = serde_json::Map::new();
    for (name, old, new) in fields {
        let wrap = |v: &str| {
            if *name == "System.AssignedTo" {
                json!({ "uniqueName": v, "displayName": v })
            } else {
                json!(v)
            }
        };
        let mut change = serde_json::Map::new();
        if let Some(old) = old {
            change.insert("oldValue".to_string(), wrap(*old));
        }
        if let Some(new) = new {
            change.insert("newValue".to_string(), wrap(*new));
        }
        map.insert((*name).to_string(), Value::Object(change));
    }
    map.insert(
        "System.ChangedDate".to_string(),
        json!({ "newValue": changed_at.to_rfc3339() }),
    );
    json!({ "rev": rev, "fields": map })
}

/// One Jira changelog history entry with `(field, fromString, toString)` items.
pub fn jira_history(id: &str, created: &str, items: &[(&str, Option<&str>, Option<&str>)]) -> Value {
    let items: Vec<Value> = items
        .iter()
        .map(|(field, from, to)| json!({ "field": field, "fromString": from, "toString": to }))
        .collect();
    json!({ "id": id, "created": created, "items": items })
}

pub fn sprint(
    id: &str,
    parent_key: &str,
    name: &str,
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
) -> Sprint {
    Sprint {
        id: id.to_string(),
        integration_id: INTEGRATION.to_string(),
        parent_key: parent_key.to_string(),
        name: name.to_string(),
        start_at,
        end_at,
        completed_at,
    }
}

/// Seed the status categories a typical Azure DevOps process uses.
pub fn seed_status_categories(storage: &mut SqliteStorage) {
    for (status, category) in [
        ("New", "Proposed"),
        ("Active", "InProgress"),
        ("Resolved", "Resolved"),
        ("Closed", "Completed"),
        ("Done", "Completed"),
    ] {
        storage
            .set_status_category(INTEGRATION, status, category)
            .unwrap();
    }
}
