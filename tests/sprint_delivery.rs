//! Sprint membership classification driven through the full pipeline.

mod common;

use common::fixtures::{INTEGRATION, azure_update, batch, may, seed_status_categories, snapshot, sprint};
use common::test_db;
use issue_timeline::config::PipelineConfig;
use issue_timeline::model::SprintMembership;
use issue_timeline::pipeline::{IssueInput, run_batch};
use issue_timeline::storage::SqliteStorage;

const STATE: &str = "System.State";
const ITERATION: &str = "System.IterationPath";
const POINTS: &str = "Microsoft.VSTS.Scheduling.StoryPoints";
const SPRINT_4: &str = "Proj\\Team\\Sprint 4";
const SPRINT_5: &str = "Proj\\Team\\Sprint 5";

fn seeded() -> SqliteStorage {
    let mut storage = test_db();
    seed_status_categories(&mut storage);
    storage
        .upsert_sprint(&sprint("S4", "Proj\\Team", "Sprint 4", may(3, 9), may(14, 17), None))
        .unwrap();
    storage
        .upsert_sprint(&sprint("S5", "Proj\\Team", "Sprint 5", may(17, 9), may(28, 17), None))
        .unwrap();
    storage
}

fn memberships(storage: &SqliteStorage, issue_id: &str) -> Vec<SprintMembership> {
    storage.get_sprint_memberships(INTEGRATION, issue_id).unwrap()
}

#[test]
fn planned_story_closed_inside_sprint_is_delivered() {
    let mut storage = seeded();
    let mut snap = snapshot("WI-100", may(1, 8), may(10, 12));
    snap.resolved_at = Some(may(10, 12));
    snap.status = Some("Closed".to_string());
    let input = IssueInput {
        snapshot: snap,
        history: vec![
            azure_update(1, may(1, 8), &[(STATE, None, Some("New"))]),
            azure_update(2, may(2, 8), &[(ITERATION, None, Some(SPRINT_4)), (POINTS, None, Some("5"))]),
            azure_update(3, may(4, 8), &[(STATE, Some("New"), Some("Active"))]),
            azure_update(4, may(10, 12), &[(STATE, Some("Active"), Some("Closed"))]),
        ],
    };

    let report = run_batch(&mut storage, &batch(vec![input]), &PipelineConfig::default(), may(20, 8));
    assert!(report.success);
    assert_eq!(report.memberships_written, 1);

    let rows = memberships(&storage, "WI-100");
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.sprint_id, "S4");
    assert_eq!(row.added_at, may(2, 8));
    assert_eq!(row.removed_at, None, "still in the sprint");
    assert!(row.planned);
    assert!(row.delivered);
    assert!(!row.outside_of_sprint);
    assert!((row.story_points_planned - 5.0).abs() < f32::EPSILON);
    assert!((row.story_points_delivered - 5.0).abs() < f32::EPSILON);
    assert!(!row.ignorable);
}

#[test]
fn carried_over_story_gets_one_row_per_sprint() {
    let mut storage = seeded();
    let mut snap = snapshot("WI-101", may(1, 8), may(8, 8));
    snap.status = Some("Active".to_string());
    let input = IssueInput {
        snapshot: snap,
        history: vec![
            azure_update(1, may(1, 8), &[(STATE, None, Some("Active"))]),
            azure_update(2, may(6, 8), &[(ITERATION, None, Some(SPRINT_4)), (POINTS, None, Some("3"))]),
            azure_update(3, may(8, 8), &[(ITERATION, Some(SPRINT_4), Some(SPRINT_5)), (POINTS, Some("3"), Some("8"))]),
        ],
    };

    let report = run_batch(&mut storage, &batch(vec![input]), &PipelineConfig::default(), may(20, 8));
    assert_eq!(report.memberships_written, 2);

    let rows = memberships(&storage, "WI-101");
    let s4 = rows.iter().find(|m| m.sprint_id == "S4").unwrap();
    assert_eq!(s4.added_at, may(6, 8));
    assert_eq!(s4.removed_at, Some(may(8, 8)));
    assert!(!s4.planned, "added after the sprint started");
    assert!(!s4.delivered);
    assert!((s4.story_points_planned - 3.0).abs() < f32::EPSILON);

    let s5 = rows.iter().find(|m| m.sprint_id == "S5").unwrap();
    assert_eq!(s5.removed_at, None);
    assert!(s5.planned);
    assert!((s5.story_points_planned - 8.0).abs() < f32::EPSILON);
}

#[test]
fn work_closed_before_sprint_start_is_outside_of_sprint() {
    let mut storage = seeded();
    let mut snap = snapshot("WI-102", may(1, 8), may(2, 8));
    snap.status = Some("Done".to_string());
    let input = IssueInput {
        snapshot: snap,
        history: vec![
            azure_update(1, may(1, 8), &[(STATE, None, Some("Done"))]),
            azure_update(2, may(2, 8), &[(ITERATION, None, Some(SPRINT_4))]),
        ],
    };

    run_batch(&mut storage, &batch(vec![input]), &PipelineConfig::default(), may(20, 8));

    let rows = memberships(&storage, "WI-102");
    assert_eq!(rows.len(), 1);
    assert!(rows[0].delivered);
    assert!(rows[0].outside_of_sprint);
    assert!(rows[0].story_points_planned.abs() < f32::EPSILON, "no story points recorded");
}

#[test]
fn ignorable_issue_types_are_flagged() {
    let mut storage = seeded();
    let mut snap = snapshot("WI-103", may(1, 8), may(2, 8));
    snap.issue_type = "Sub-Task".to_string();
    let input = IssueInput {
        snapshot: snap,
        history: vec![azure_update(1, may(2, 8), &[(ITERATION, None, Some(SPRINT_4))])],
    };

    run_batch(&mut storage, &batch(vec![input]), &PipelineConfig::default(), may(20, 8));

    let rows = memberships(&storage, "WI-103");
    assert_eq!(rows.len(), 1);
    assert!(rows[0].ignorable);
}

#[test]
fn unknown_sprints_are_skipped_without_failing_the_issue() {
    let mut storage = seeded();
    let input = IssueInput {
        snapshot: snapshot("WI-104", may(1, 8), may(2, 8)),
        history: vec![
            azure_update(1, may(2, 8), &[(ITERATION, None, Some("Proj\\Team\\Sprint 99"))]),
            azure_update(2, may(4, 8), &[(ITERATION, Some("Proj\\Team\\Sprint 99"), Some("Proj"))]),
        ],
    };

    let report = run_batch(&mut storage, &batch(vec![input]), &PipelineConfig::default(), may(20, 8));
    assert!(report.success);
    assert_eq!(report.memberships_written, 0);
    assert_eq!(report.memberships_skipped, 2);
    assert!(memberships(&storage, "WI-104").is_empty());
}

#[test]
fn snapshot_sprint_without_history_is_backfilled_from_creation() {
    let mut storage = seeded();
    let mut snap = snapshot("WI-105", may(1, 8), may(1, 8));
    snap.sprint = Some(SPRINT_4.to_string());
    snap.story_points = Some(2.0);
    snap.status = Some("Closed".to_string());
    let input = batch(vec![IssueInput {
        snapshot: snap,
        history: Vec::new(),
    }]);
    let config = PipelineConfig::default();

    // Mid-sprint: still a member, not yet delivered.
    run_batch(&mut storage, &input, &config, may(12, 8));
    let rows = memberships(&storage, "WI-105");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].added_at, may(1, 8));
    assert_eq!(rows[0].removed_at, None);
    assert!(rows[0].planned);
    assert!((rows[0].story_points_planned - 2.0).abs() < f32::EPSILON);
    assert!(!rows[0].delivered);

    // After the sprint completed, the same backfilled state counts as delivered.
    let report = run_batch(&mut storage, &input, &config, may(20, 8));
    assert_eq!(report.intervals_written, 0);
    let rows = memberships(&storage, "WI-105");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].removed_at, None);
    assert!(rows[0].delivered);
    assert!((rows[0].story_points_delivered - 2.0).abs() < f32::EPSILON);
}
