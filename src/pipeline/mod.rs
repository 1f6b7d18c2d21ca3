//! Per-issue orchestration and batch runners.
//!
//! One issue is processed inside one storage transaction:
//! normalize its history, stitch every event into its field timeline, anchor
//! and backfill, recompute hops/bounces, then classify sprint memberships.
//! Errors stop that issue only; batches always run to completion.

use std::collections::hash_map::DefaultHasher;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::BufReader;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::error::{Result, TimelineError};
use crate::model::{FieldType, HopsBounces, IssueRecord, IssueSnapshot, TimelineKey};
use crate::normalize::{EventNormalizer, IssueContext, normalizer_for};
use crate::sprint::{ClassifierInput, LookupCaches, classify, sanitize_memberships};
use crate::storage::{IssueTx, SqliteStorage, TimelineStore};
use crate::timeline::{anchor_zero_starts, apply_event, backfill_missing_fields};

/// One issue as delivered by a connector: current state plus raw history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueInput {
    pub snapshot: IssueSnapshot,
    #[serde(default)]
    pub history: Vec<Value>,
}

/// A batch of issues from one integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueBatch {
    pub integration_id: String,
    pub issues: Vec<IssueInput>,
}

impl IssueBatch {
    /// Read a batch from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or is not a valid batch.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let batch = serde_json::from_reader(BufReader::new(file))?;
        Ok(batch)
    }
}

/// What processing one issue changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IssueOutcome {
    pub records_dropped: usize,
    pub events_applied: usize,
    pub intervals_written: usize,
    /// Events that were already fully reflected in storage.
    pub duplicates: usize,
    pub issue_record_written: bool,
    pub memberships_written: usize,
    pub memberships_skipped: usize,
    pub hops_bounces: HopsBounces,
}

/// Counters for one batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// True when no issue failed.
    pub success: bool,
    pub issues_seen: usize,
    pub issues_processed: usize,
    pub issue_errors: usize,
    pub records_dropped: usize,
    pub intervals_written: usize,
    pub issue_records_written: usize,
    pub duplicates: usize,
    pub memberships_written: usize,
    pub memberships_skipped: usize,
}

impl BatchReport {
    fn record(&mut self, outcome: &IssueOutcome) {
        self.issues_processed += 1;
        self.records_dropped += outcome.records_dropped;
        self.intervals_written += outcome.intervals_written;
        self.duplicates += outcome.duplicates;
        if outcome.issue_record_written {
            self.issue_records_written += 1;
        }
        self.memberships_written += outcome.memberships_written;
        self.memberships_skipped += outcome.memberships_skipped;
    }

    fn merge(&mut self, other: &Self) {
        self.issues_seen += other.issues_seen;
        self.issues_processed += other.issues_processed;
        self.issue_errors += other.issue_errors;
        self.records_dropped += other.records_dropped;
        self.intervals_written += other.intervals_written;
        self.issue_records_written += other.issue_records_written;
        self.duplicates += other.duplicates;
        self.memberships_written += other.memberships_written;
        self.memberships_skipped += other.memberships_skipped;
    }

    fn failed(issues: usize) -> Self {
        Self {
            issues_seen: issues,
            issue_errors: issues,
            ..Self::default()
        }
    }

    fn finish(mut self) -> Self {
        self.success = self.issue_errors == 0;
        self
    }
}

/// Process one issue in a single transaction.
///
/// History records that cannot be normalized are dropped and counted; the
/// rest of the issue is still processed.
///
/// # Errors
///
/// Returns an error if a storage operation fails. Nothing the issue wrote
/// is kept in that case.
#[allow(clippy::too_many_lines)]
pub fn process_issue(
    storage: &mut SqliteStorage,
    normalizer: &dyn EventNormalizer,
    caches: &mut LookupCaches,
    config: &PipelineConfig,
    integration_id: &str,
    input: &IssueInput,
    now: DateTime<Utc>,
) -> Result<IssueOutcome> {
    let snapshot = &input.snapshot;
    let issue_id = snapshot.issue_id.as_str();
    if issue_id.trim().is_empty() {
        return Err(TimelineError::validation("issue_id", "must not be empty"));
    }

    let context = IssueContext {
        issue_id: issue_id.to_string(),
        created_at: snapshot.created_at,
    };
    let mut events = Vec::new();
    let mut records_dropped = 0;
    for record in &input.history {
        match normalizer.normalize(record, &context) {
            Ok(normalized) => events.extend(normalized),
            Err(err) if err.is_input_error() => {
                warn!(issue = issue_id, error = %err, "dropping history record");
                records_dropped += 1;
            }
            Err(err) => return Err(err),
        }
    }
    // Stable: changes sharing a timestamp keep record order.
    events.sort_by_key(|event| event.changed_at);

    storage.mutate("process_issue", integration_id, |tx, ctx| {
        let mut store = IssueTx::new(tx, ctx);
        let mut outcome = IssueOutcome {
            records_dropped,
            ..IssueOutcome::default()
        };

        for event in &events {
            let key = TimelineKey::new(integration_id, issue_id, event.field_type);
            let ops = apply_event(&mut store, &key, event)?;
            outcome.events_applied += 1;
            if ops.is_empty() {
                outcome.duplicates += 1;
            } else {
                outcome.intervals_written += ops.len();
            }
        }

        let anchored = anchor_zero_starts(&mut store, integration_id, issue_id, snapshot.created_at)?;
        outcome.intervals_written += anchored;
        outcome.intervals_written += backfill_missing_fields(&mut store, integration_id, snapshot)?.len();

        let timeline = |field| TimelineKey::new(integration_id, issue_id, field);
        let assignees = store.intervals(&timeline(FieldType::Assignee))?;
        outcome.hops_bounces = HopsBounces::from_intervals(&assignees, &config.unassigned);

        let stored = store.get_issue_record(integration_id, issue_id)?;
        if stored.as_ref().is_none_or(|record| record.updated_at < snapshot.updated_at) {
            store.upsert_issue_record(&IssueRecord {
                integration_id: integration_id.to_string(),
                issue_id: issue_id.to_string(),
                issue_type: snapshot.issue_type.clone(),
                status: snapshot.status.clone(),
                assignee: snapshot.assignee.clone(),
                created_at: snapshot.created_at,
                updated_at: snapshot.updated_at,
                resolved_at: snapshot.resolved_at,
                hops: outcome.hops_bounces.hops,
                bounces: outcome.hops_bounces.bounces,
            })?;
            outcome.issue_record_written = true;
        } else {
            debug!(issue = issue_id, "stored issue record is as new as this update; keeping it");
        }

        let memberships = sanitize_memberships(&store.intervals(&timeline(FieldType::Sprint))?, now);
        let statuses = store.intervals(&timeline(FieldType::Status))?;
        let story_points = store.intervals(&timeline(FieldType::StoryPoints))?;
        let mut kept = Vec::with_capacity(memberships.len());
        for membership in &memberships {
            let candidate = ClassifierInput {
                integration_id,
                issue_id,
                issue_type: &snapshot.issue_type,
                resolved_at: snapshot.resolved_at,
                membership,
                statuses: &statuses,
                story_points: &story_points,
                processing_time: now,
            };
            match classify(&candidate, caches, &store, config)? {
                Some(row) => {
                    store.upsert_sprint_membership(&row)?;
                    kept.push(row.sprint_id);
                    outcome.memberships_written += 1;
                }
                None => outcome.memberships_skipped += 1,
            }
        }
        let pruned = store.prune_sprint_memberships(integration_id, issue_id, &kept)?;
        if pruned > 0 {
            debug!(issue = issue_id, pruned, "removed memberships no longer on the sprint timeline");
        }

        Ok(outcome)
    })
}

#[allow(clippy::too_many_arguments)]
fn process_into(
    report: &mut BatchReport,
    storage: &mut SqliteStorage,
    normalizer: &dyn EventNormalizer,
    caches: &mut LookupCaches,
    config: &PipelineConfig,
    integration_id: &str,
    input: &IssueInput,
    now: DateTime<Utc>,
) {
    report.issues_seen += 1;
    match process_issue(storage, normalizer, caches, config, integration_id, input, now) {
        Ok(outcome) => {
            debug!(
                issue = %input.snapshot.issue_id,
                events = outcome.events_applied,
                intervals = outcome.intervals_written,
                memberships = outcome.memberships_written,
                "processed issue"
            );
            report.record(&outcome);
        }
        Err(err) => {
            error!(
                integration = integration_id,
                issue = %input.snapshot.issue_id,
                error = %err,
                "issue processing failed, continuing with next issue"
            );
            report.issue_errors += 1;
        }
    }
}

/// Process a batch sequentially on one connection.
///
/// Lookup caches are created for this run and dropped at the end.
#[must_use]
pub fn run_batch(
    storage: &mut SqliteStorage,
    batch: &IssueBatch,
    config: &PipelineConfig,
    now: DateTime<Utc>,
) -> BatchReport {
    let normalizer = normalizer_for(config);
    let mut caches = LookupCaches::new(config.cache_capacity);
    let mut report = BatchReport::default();
    for input in &batch.issues {
        process_into(
            &mut report,
            storage,
            normalizer.as_ref(),
            &mut caches,
            config,
            &batch.integration_id,
            input,
            now,
        );
    }
    let report = report.finish();
    info!(
        integration = %batch.integration_id,
        tracker = %config.tracker,
        issues = report.issues_seen,
        errors = report.issue_errors,
        intervals = report.intervals_written,
        cache_hits = caches.hits(),
        cache_misses = caches.misses(),
        "batch complete"
    );
    report
}

/// Worker that owns every update for an issue.
fn worker_for(issue_id: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    issue_id.hash(&mut hasher);
    let bucket = hasher.finish() % (workers as u64);
    usize::try_from(bucket).unwrap_or(0)
}

fn run_partition(
    worker: usize,
    db_path: &Path,
    integration_id: &str,
    issues: &[&IssueInput],
    config: &PipelineConfig,
    now: DateTime<Utc>,
) -> BatchReport {
    let mut storage = match SqliteStorage::open(db_path) {
        Ok(storage) => storage,
        Err(err) => {
            error!(worker, path = %db_path.display(), error = %err, "worker could not open database");
            return BatchReport::failed(issues.len());
        }
    };
    let normalizer = normalizer_for(config);
    let mut caches = LookupCaches::new(config.cache_capacity);
    let mut report = BatchReport::default();
    for input in issues {
        process_into(
            &mut report,
            &mut storage,
            normalizer.as_ref(),
            &mut caches,
            config,
            integration_id,
            input,
            now,
        );
    }
    debug!(worker, issues = report.issues_seen, errors = report.issue_errors, "worker finished");
    report
}

/// Process a batch on `config.workers` threads sharing one database file.
///
/// Issues are partitioned by a hash of their id, so all work for one issue
/// runs on one worker. Each worker opens its own connection and caches.
#[must_use]
pub fn run_batch_parallel(
    db_path: &Path,
    batch: &IssueBatch,
    config: &PipelineConfig,
    now: DateTime<Utc>,
) -> BatchReport {
    // Schema and WAL mode are set up once before workers connect.
    if let Err(err) = SqliteStorage::open(db_path) {
        error!(path = %db_path.display(), error = %err, "could not open database");
        return BatchReport::failed(batch.issues.len()).finish();
    }

    let workers = config.workers.clamp(1, batch.issues.len().max(1));
    let mut partitions: Vec<Vec<&IssueInput>> = vec![Vec::new(); workers];
    for input in &batch.issues {
        partitions[worker_for(&input.snapshot.issue_id, workers)].push(input);
    }

    let partials: Vec<BatchReport> = std::thread::scope(|scope| {
        let handles: Vec<_> = partitions
            .iter()
            .enumerate()
            .map(|(worker, issues)| {
                let handle = scope.spawn(move || {
                    run_partition(worker, db_path, &batch.integration_id, issues, config, now)
                });
                (handle, issues.len())
            })
            .collect();
        handles
            .into_iter()
            .map(|(handle, issues)| {
                handle.join().unwrap_or_else(|_| {
                    error!(issues, "worker panicked");
                    BatchReport::failed(issues)
                })
            })
            .collect()
    });

    let mut report = BatchReport::default();
    for partial in &partials {
        report.merge(partial);
    }
    let report = report.finish();
    info!(
        integration = %batch.integration_id,
        workers,
        issues = report.issues_seen,
        errors = report.issue_errors,
        intervals = report.intervals_written,
        "parallel batch complete"
    );
    report
}

/// Run a batch against the configured database.
///
/// # Errors
///
/// Returns [`TimelineError::Config`] if no database path is configured.
pub fn run_configured(config: &PipelineConfig, batch: &IssueBatch, now: DateTime<Utc>) -> Result<BatchReport> {
    let db_path = config
        .db_path
        .as_deref()
        .ok_or_else(|| TimelineError::Config("no database path configured (set `db`)".to_string()))?;
    if config.workers > 1 {
        return Ok(run_batch_parallel(db_path, batch, config, now));
    }
    let mut storage = SqliteStorage::open(db_path)?;
    Ok(run_batch(&mut storage, batch, config, now))
}
