//! `SQLite` storage implementation.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use tracing::{debug, trace};

use crate::error::{Result, TimelineError};
use crate::model::{
    FieldType, IssueRecord, Sprint, SprintMembership, TimelineInterval, TimelineKey,
};
use crate::storage::schema::apply_schema;
use crate::storage::{MetadataStore, TimelineStore};
use crate::timeline::TimelineOp;

/// How long a writer waits for another worker's transaction to finish.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const INTERVAL_COLUMNS: &str = "id, value, start_at, end_at, synthetic";

/// SQLite-based storage backend.
#[derive(Debug)]
pub struct SqliteStorage {
    conn: Connection,
}

/// One recorded timeline change, written to `timeline_audit` on commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub key: TimelineKey,
    pub op: String,
    pub interval_id: Option<i64>,
    pub value: Option<String>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
}

/// Context for a mutation operation, tracking side effects.
pub struct MutationContext {
    pub op_name: String,
    pub integration_id: String,
    pub audit: Vec<AuditEntry>,
}

impl MutationContext {
    #[must_use]
    pub fn new(op_name: &str, integration_id: &str) -> Self {
        Self {
            op_name: op_name.to_string(),
            integration_id: integration_id.to_string(),
            audit: Vec::new(),
        }
    }

    /// Record a timeline operation that changed storage.
    pub fn record_op(&mut self, op: &TimelineOp, interval_id: Option<i64>) {
        let (value, start_at, end_at) = match op {
            TimelineOp::Insert(iv) | TimelineOp::Upsert(iv) => {
                (Some(iv.value.clone()), Some(iv.start_at), iv.end_at)
            }
            TimelineOp::UpdateEnd { interval, end_at } => {
                (Some(interval.value.clone()), Some(interval.start_at), Some(*end_at))
            }
            TimelineOp::Delete(iv) => (Some(iv.value.clone()), Some(iv.start_at), iv.end_at),
        };
        self.audit.push(AuditEntry {
            key: op.key(),
            op: op.name().to_string(),
            interval_id,
            value,
            start_at,
            end_at,
        });
    }

    /// Record an epoch-zero start moved to the issue creation time.
    pub fn record_anchor(&mut self, interval: &TimelineInterval, start_at: DateTime<Utc>) {
        self.audit.push(AuditEntry {
            key: interval.key(),
            op: "anchor".to_string(),
            interval_id: Some(interval.id),
            value: Some(interval.value.clone()),
            start_at: Some(start_at),
            end_at: interval.end_at,
        });
    }
}

impl SqliteStorage {
    /// Open a new connection to the database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or schema application fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        // Set before the schema so concurrent openers wait on each other.
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        apply_schema(&conn)?;
        debug!(path = %path.display(), "opened timeline database");
        Ok(Self { conn })
    }

    /// Open an in-memory database for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Execute a mutation in one immediate transaction.
    ///
    /// Audit entries collected in the context are written before commit. Any
    /// error rolls back everything the closure did.
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails (e.g. database error, logic error).
    pub fn mutate<F, R>(&mut self, op: &str, integration_id: &str, f: F) -> Result<R>
    where
        F: FnOnce(&Transaction, &mut MutationContext) -> Result<R>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let mut ctx = MutationContext::new(op, integration_id);

        let result = f(&tx, &mut ctx)?;

        let recorded_at = Utc::now().timestamp();
        for entry in &ctx.audit {
            tx.execute(
                "INSERT INTO timeline_audit
                    (integration_id, issue_id, field_type, op, interval_id, value, start_at, end_at, batch_op, recorded_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    entry.key.integration_id,
                    entry.key.issue_id,
                    entry.key.field_type.as_str(),
                    entry.op,
                    entry.interval_id,
                    entry.value,
                    entry.start_at.map(to_ts),
                    entry.end_at.map(to_ts),
                    ctx.op_name,
                    recorded_at,
                ],
            )?;
        }

        tx.commit()?;
        trace!(op, audit_entries = ctx.audit.len(), "committed mutation");
        Ok(result)
    }

    /// All intervals of one timeline in start order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn intervals(&self, key: &TimelineKey) -> Result<Vec<TimelineInterval>> {
        select_intervals(&self.conn, key)
    }

    /// Audit trail of one issue, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn audit_entries(&self, integration_id: &str, issue_id: &str) -> Result<Vec<AuditEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT field_type, op, interval_id, value, start_at, end_at
             FROM timeline_audit
             WHERE integration_id = ? AND issue_id = ?
             ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![integration_id, issue_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(field, op, interval_id, value, start_at, end_at)| {
                let field_type: FieldType = field.parse()?;
                Ok(AuditEntry {
                    key: TimelineKey::new(integration_id, issue_id, field_type),
                    op,
                    interval_id,
                    value,
                    start_at: start_at.map(from_ts),
                    end_at: end_at.map(from_ts),
                })
            })
            .collect()
    }

    /// Get a persisted issue record.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_issue_record(&self, integration_id: &str, issue_id: &str) -> Result<Option<IssueRecord>> {
        read_issue_record(&self.conn, integration_id, issue_id)
    }

    /// Memberships of one issue, ordered by sprint id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_sprint_memberships(
        &self,
        integration_id: &str,
        issue_id: &str,
    ) -> Result<Vec<SprintMembership>> {
        read_memberships(&self.conn, integration_id, issue_id)
    }

    /// Insert or replace sprint metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn upsert_sprint(&mut self, sprint: &Sprint) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sprints (integration_id, id, parent_key, name, start_at, end_at, completed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(integration_id, id) DO UPDATE SET
                parent_key = excluded.parent_key,
                name = excluded.name,
                start_at = excluded.start_at,
                end_at = excluded.end_at,
                completed_at = excluded.completed_at",
            params![
                sprint.integration_id,
                sprint.id,
                sprint.parent_key,
                sprint.name,
                to_ts(sprint.start_at),
                to_ts(sprint.end_at),
                sprint.completed_at.map(to_ts),
            ],
        )?;
        Ok(())
    }

    /// Map a status value to a status category.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn set_status_category(&mut self, integration_id: &str, status: &str, category: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO status_categories (integration_id, status, category) VALUES (?, ?, ?)
             ON CONFLICT(integration_id, status) DO UPDATE SET category = excluded.category",
            params![integration_id, status.trim(), category.trim()],
        )?;
        Ok(())
    }
}

impl MetadataStore for SqliteStorage {
    fn resolve_sprint(&self, integration_id: &str, parent_key: &str, name: &str) -> Result<Option<Sprint>> {
        read_sprint(&self.conn, integration_id, parent_key, name)
    }

    fn resolve_status_category(&self, integration_id: &str, status: &str) -> Result<Option<String>> {
        read_status_category(&self.conn, integration_id, status)
    }
}

/// Storage handle scoped to one issue's transaction.
///
/// Every timeline change goes through [`TimelineStore::apply`] and lands in
/// the mutation context's audit trail.
pub struct IssueTx<'a> {
    conn: &'a Connection,
    ctx: &'a mut MutationContext,
}

impl<'a> IssueTx<'a> {
    pub fn new(conn: &'a Connection, ctx: &'a mut MutationContext) -> Self {
        Self { conn, ctx }
    }

    /// Get the stored issue record.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_issue_record(&self, integration_id: &str, issue_id: &str) -> Result<Option<IssueRecord>> {
        read_issue_record(self.conn, integration_id, issue_id)
    }

    /// Insert or fully replace an issue record.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn upsert_issue_record(&mut self, record: &IssueRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO issues
                (integration_id, issue_id, issue_type, status, assignee, created_at, updated_at, resolved_at, hops, bounces)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(integration_id, issue_id) DO UPDATE SET
                issue_type = excluded.issue_type,
                status = excluded.status,
                assignee = excluded.assignee,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                resolved_at = excluded.resolved_at,
                hops = excluded.hops,
                bounces = excluded.bounces",
            params![
                record.integration_id,
                record.issue_id,
                record.issue_type,
                record.status,
                record.assignee,
                to_ts(record.created_at),
                to_ts(record.updated_at),
                record.resolved_at.map(to_ts),
                record.hops,
                record.bounces,
            ],
        )?;
        Ok(())
    }

    /// Insert or replace the membership row keyed by (issue, sprint).
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn upsert_sprint_membership(&mut self, membership: &SprintMembership) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sprint_memberships
                (integration_id, issue_id, sprint_id, added_at, removed_at, planned, outside_of_sprint,
                 delivered, story_points_planned, story_points_delivered, ignorable)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(integration_id, issue_id, sprint_id) DO UPDATE SET
                added_at = excluded.added_at,
                removed_at = excluded.removed_at,
                planned = excluded.planned,
                outside_of_sprint = excluded.outside_of_sprint,
                delivered = excluded.delivered,
                story_points_planned = excluded.story_points_planned,
                story_points_delivered = excluded.story_points_delivered,
                ignorable = excluded.ignorable",
            params![
                membership.integration_id,
                membership.issue_id,
                membership.sprint_id,
                to_ts(membership.added_at),
                membership.removed_at.map(to_ts),
                membership.planned,
                membership.outside_of_sprint,
                membership.delivered,
                f64::from(membership.story_points_planned),
                f64::from(membership.story_points_delivered),
                membership.ignorable,
            ],
        )?;
        Ok(())
    }

    /// Delete membership rows of an issue whose sprint is not in `keep`.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn prune_sprint_memberships(
        &mut self,
        integration_id: &str,
        issue_id: &str,
        keep: &[String],
    ) -> Result<usize> {
        let existing = read_memberships(self.conn, integration_id, issue_id)?;
        let mut removed = 0;
        for stale in existing.iter().filter(|m| !keep.contains(&m.sprint_id)) {
            removed += self.conn.execute(
                "DELETE FROM sprint_memberships WHERE integration_id = ? AND issue_id = ? AND sprint_id = ?",
                params![integration_id, issue_id, stale.sprint_id],
            )?;
        }
        Ok(removed)
    }
}

impl TimelineStore for IssueTx<'_> {
    fn first_interval(&self, key: &TimelineKey) -> Result<Option<TimelineInterval>> {
        select_one(self.conn, key, "start_at >= ?4", "ASC", i64::MIN)
    }

    fn last_interval_before(&self, key: &TimelineKey, at: DateTime<Utc>) -> Result<Option<TimelineInterval>> {
        select_one(self.conn, key, "start_at < ?4", "DESC", to_ts(at))
    }

    fn first_interval_after(&self, key: &TimelineKey, at: DateTime<Utc>) -> Result<Option<TimelineInterval>> {
        select_one(self.conn, key, "start_at > ?4", "ASC", to_ts(at))
    }

    fn intervals(&self, key: &TimelineKey) -> Result<Vec<TimelineInterval>> {
        select_intervals(self.conn, key)
    }

    fn field_types_present(&self, integration_id: &str, issue_id: &str) -> Result<Vec<FieldType>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT field_type FROM timeline_intervals
             WHERE integration_id = ? AND issue_id = ?",
        )?;
        let names = stmt
            .query_map(params![integration_id, issue_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut fields = names
            .iter()
            .map(|name| name.parse::<FieldType>())
            .collect::<Result<Vec<_>>>()?;
        fields.sort();
        Ok(fields)
    }

    fn apply(&mut self, op: &TimelineOp) -> Result<bool> {
        let changed = execute_op(self.conn, op)?;
        if let Some(interval_id) = changed {
            trace!(key = %op.key(), op = op.name(), interval_id, "timeline changed");
            self.ctx.record_op(op, Some(interval_id));
        }
        Ok(changed.is_some())
    }

    fn anchor_zero_starts(
        &mut self,
        integration_id: &str,
        issue_id: &str,
        created_at: DateTime<Utc>,
    ) -> Result<usize> {
        let created = to_ts(created_at);
        let candidates = {
            let mut stmt = self.conn.prepare(
                "SELECT id, value, end_at, field_type FROM timeline_intervals
                 WHERE integration_id = ?1 AND issue_id = ?2 AND start_at = 0 AND synthetic = 1
                   AND (end_at IS NULL OR end_at > ?3)",
            )?;
            let rows = stmt
                .query_map(params![integration_id, issue_id, created], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut moved = 0;
        for (id, value, end_at, field) in candidates {
            let field_type: FieldType = field.parse()?;
            moved += self.conn.execute(
                "UPDATE timeline_intervals SET start_at = ? WHERE id = ?",
                params![created, id],
            )?;
            let interval = TimelineInterval {
                id,
                integration_id: integration_id.to_string(),
                issue_id: issue_id.to_string(),
                field_type,
                value,
                start_at: DateTime::UNIX_EPOCH,
                end_at: end_at.map(from_ts),
                synthetic: true,
            };
            self.ctx.record_anchor(&interval, created_at);
        }
        Ok(moved)
    }
}

impl MetadataStore for IssueTx<'_> {
    fn resolve_sprint(&self, integration_id: &str, parent_key: &str, name: &str) -> Result<Option<Sprint>> {
        read_sprint(self.conn, integration_id, parent_key, name)
    }

    fn resolve_status_category(&self, integration_id: &str, status: &str) -> Result<Option<String>> {
        read_status_category(self.conn, integration_id, status)
    }
}

/// Run one timeline operation. Returns the affected row id when something changed.
fn execute_op(conn: &Connection, op: &TimelineOp) -> Result<Option<i64>> {
    match op {
        TimelineOp::Insert(iv) => {
            let inserted = conn.execute(
                "INSERT INTO timeline_intervals
                    (integration_id, issue_id, field_type, value, start_at, end_at, synthetic)
                 VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(integration_id, issue_id, field_type, start_at) DO NOTHING",
                params![
                    iv.integration_id,
                    iv.issue_id,
                    iv.field_type.as_str(),
                    iv.value,
                    to_ts(iv.start_at),
                    iv.end_at.map(to_ts),
                    iv.synthetic,
                ],
            )?;
            Ok((inserted > 0).then(|| conn.last_insert_rowid()))
        }
        TimelineOp::Upsert(iv) => {
            let changed = conn.execute(
                "INSERT INTO timeline_intervals
                    (integration_id, issue_id, field_type, value, start_at, end_at, synthetic)
                 VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(integration_id, issue_id, field_type, start_at) DO UPDATE SET
                    value = excluded.value,
                    end_at = excluded.end_at,
                    synthetic = excluded.synthetic
                 WHERE value IS NOT excluded.value
                    OR end_at IS NOT excluded.end_at
                    OR synthetic IS NOT excluded.synthetic",
                params![
                    iv.integration_id,
                    iv.issue_id,
                    iv.field_type.as_str(),
                    iv.value,
                    to_ts(iv.start_at),
                    iv.end_at.map(to_ts),
                    iv.synthetic,
                ],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            let id = conn.query_row(
                "SELECT id FROM timeline_intervals
                 WHERE integration_id = ? AND issue_id = ? AND field_type = ? AND start_at = ?",
                params![iv.integration_id, iv.issue_id, iv.field_type.as_str(), to_ts(iv.start_at)],
                |row| row.get(0),
            )?;
            Ok(Some(id))
        }
        TimelineOp::UpdateEnd { interval, end_at } => {
            if to_ts(*end_at) < to_ts(interval.start_at) {
                return Err(TimelineError::validation(
                    "end_at",
                    format!("{end_at} precedes start of interval {}", interval.id),
                ));
            }
            let updated = conn.execute(
                "UPDATE timeline_intervals SET end_at = ?1 WHERE id = ?2 AND end_at IS NOT ?1",
                params![to_ts(*end_at), interval.id],
            )?;
            Ok((updated > 0).then_some(interval.id))
        }
        TimelineOp::Delete(iv) => {
            let deleted = conn.execute("DELETE FROM timeline_intervals WHERE id = ?", params![iv.id])?;
            Ok((deleted > 0).then_some(iv.id))
        }
    }
}

fn select_one(
    conn: &Connection,
    key: &TimelineKey,
    filter: &str,
    order: &str,
    at: i64,
) -> Result<Option<TimelineInterval>> {
    let sql = format!(
        "SELECT {INTERVAL_COLUMNS} FROM timeline_intervals
         WHERE integration_id = ?1 AND issue_id = ?2 AND field_type = ?3 AND {filter}
         ORDER BY start_at {order}
         LIMIT 1"
    );
    conn.query_row(
        &sql,
        params![key.integration_id, key.issue_id, key.field_type.as_str(), at],
        |row| interval_from_row(row, key),
    )
    .optional()
    .map_err(TimelineError::from)
}

fn select_intervals(conn: &Connection, key: &TimelineKey) -> Result<Vec<TimelineInterval>> {
    let sql = format!(
        "SELECT {INTERVAL_COLUMNS} FROM timeline_intervals
         WHERE integration_id = ?1 AND issue_id = ?2 AND field_type = ?3
         ORDER BY start_at, id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let intervals = stmt
        .query_map(
            params![key.integration_id, key.issue_id, key.field_type.as_str()],
            |row| interval_from_row(row, key),
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(intervals)
}

fn interval_from_row(row: &rusqlite::Row<'_>, key: &TimelineKey) -> rusqlite::Result<TimelineInterval> {
    Ok(TimelineInterval {
        id: row.get(0)?,
        integration_id: key.integration_id.clone(),
        issue_id: key.issue_id.clone(),
        field_type: key.field_type,
        value: row.get(1)?,
        start_at: from_ts(row.get(2)?),
        end_at: row.get::<_, Option<i64>>(3)?.map(from_ts),
        synthetic: row.get(4)?,
    })
}

fn read_issue_record(conn: &Connection, integration_id: &str, issue_id: &str) -> Result<Option<IssueRecord>> {
    conn.query_row(
        "SELECT issue_type, status, assignee, created_at, updated_at, resolved_at, hops, bounces
         FROM issues WHERE integration_id = ? AND issue_id = ?",
        params![integration_id, issue_id],
        |row| {
            Ok(IssueRecord {
                integration_id: integration_id.to_string(),
                issue_id: issue_id.to_string(),
                issue_type: row.get(0)?,
                status: row.get(1)?,
                assignee: row.get(2)?,
                created_at: from_ts(row.get(3)?),
                updated_at: from_ts(row.get(4)?),
                resolved_at: row.get::<_, Option<i64>>(5)?.map(from_ts),
                hops: row.get(6)?,
                bounces: row.get(7)?,
            })
        },
    )
    .optional()
    .map_err(TimelineError::from)
}

#[allow(clippy::cast_possible_truncation)]
fn read_memberships(conn: &Connection, integration_id: &str, issue_id: &str) -> Result<Vec<SprintMembership>> {
    let mut stmt = conn.prepare(
        "SELECT sprint_id, added_at, removed_at, planned, outside_of_sprint, delivered,
                story_points_planned, story_points_delivered, ignorable
         FROM sprint_memberships
         WHERE integration_id = ? AND issue_id = ?
         ORDER BY sprint_id",
    )?;
    let memberships = stmt
        .query_map(params![integration_id, issue_id], |row| {
            Ok(SprintMembership {
                integration_id: integration_id.to_string(),
                issue_id: issue_id.to_string(),
                sprint_id: row.get(0)?,
                added_at: from_ts(row.get(1)?),
                removed_at: row.get::<_, Option<i64>>(2)?.map(from_ts),
                planned: row.get(3)?,
                outside_of_sprint: row.get(4)?,
                delivered: row.get(5)?,
                story_points_planned: row.get::<_, f64>(6)? as f32,
                story_points_delivered: row.get::<_, f64>(7)? as f32,
                ignorable: row.get(8)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(memberships)
}

fn read_sprint(conn: &Connection, integration_id: &str, parent_key: &str, name: &str) -> Result<Option<Sprint>> {
    conn.query_row(
        "SELECT id, parent_key, name, start_at, end_at, completed_at FROM sprints
         WHERE integration_id = ? AND parent_key = ? AND name = ?",
        params![integration_id, parent_key, name],
        |row| {
            Ok(Sprint {
                id: row.get(0)?,
                integration_id: integration_id.to_string(),
                parent_key: row.get(1)?,
                name: row.get(2)?,
                start_at: from_ts(row.get(3)?),
                end_at: from_ts(row.get(4)?),
                completed_at: row.get::<_, Option<i64>>(5)?.map(from_ts),
            })
        },
    )
    .optional()
    .map_err(TimelineError::from)
}

fn read_status_category(conn: &Connection, integration_id: &str, status: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT category FROM status_categories WHERE integration_id = ? AND status = ?",
        params![integration_id, status.trim()],
        |row| row.get(0),
    )
    .optional()
    .map_err(TimelineError::from)
}

fn to_ts(at: DateTime<Utc>) -> i64 {
    at.timestamp()
}

fn from_ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn status_key() -> TimelineKey {
        TimelineKey::new("1", "WI-1", FieldType::Status)
    }

    #[test]
    fn test_open_memory() {
        let storage = SqliteStorage::open_memory();
        assert!(storage.is_ok());
    }

    #[test]
    fn test_insert_is_noop_on_occupied_start() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let key = status_key();
        let (first, second) = storage
            .mutate("test", "1", |tx, ctx| {
                let mut store = IssueTx::new(tx, ctx);
                let first = store.apply(&TimelineOp::Insert(key.interval("New", at(100), None, false)))?;
                let second = store.apply(&TimelineOp::Insert(key.interval("Active", at(100), None, false)))?;
                Ok((first, second))
            })
            .unwrap();
        assert!(first);
        assert!(!second);

        let intervals = storage.intervals(&key).unwrap();
        assert_eq!(intervals.len(), 1);
        assert_eq!(intervals[0].value, "New");
    }

    #[test]
    fn test_upsert_replaces_and_detects_identical() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let key = status_key();
        let changes = storage
            .mutate("test", "1", |tx, ctx| {
                let mut store = IssueTx::new(tx, ctx);
                let a = store.apply(&TimelineOp::Upsert(key.interval("New", at(100), None, true)))?;
                let b = store.apply(&TimelineOp::Upsert(key.interval("Active", at(100), Some(at(200)), false)))?;
                let c = store.apply(&TimelineOp::Upsert(key.interval("Active", at(100), Some(at(200)), false)))?;
                Ok([a, b, c])
            })
            .unwrap();
        assert_eq!(changes, [true, true, false]);

        let intervals = storage.intervals(&key).unwrap();
        assert_eq!(intervals.len(), 1);
        assert_eq!(intervals[0].value, "Active");
        assert_eq!(intervals[0].end_at, Some(at(200)));
        assert!(!intervals[0].synthetic);
    }

    #[test]
    fn test_point_queries() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let key = status_key();
        storage
            .mutate("test", "1", |tx, ctx| {
                let mut store = IssueTx::new(tx, ctx);
                store.apply(&TimelineOp::Insert(key.interval("New", at(0), Some(at(100)), true)))?;
                store.apply(&TimelineOp::Insert(key.interval("Active", at(100), Some(at(200)), false)))?;
                store.apply(&TimelineOp::Insert(key.interval("Done", at(200), None, false)))?;

                assert_eq!(store.first_interval(&key)?.unwrap().value, "New");
                assert_eq!(store.last_interval_before(&key, at(200))?.unwrap().value, "Active");
                assert_eq!(store.last_interval_before(&key, at(150))?.unwrap().value, "Active");
                assert!(store.last_interval_before(&key, at(0))?.is_none());
                assert_eq!(store.first_interval_after(&key, at(100))?.unwrap().value, "Done");
                assert!(store.first_interval_after(&key, at(200))?.is_none());
                assert_eq!(store.field_types_present("1", "WI-1")?, vec![FieldType::Status]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_update_end_and_delete_are_audited() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let key = status_key();
        storage
            .mutate("test", "1", |tx, ctx| {
                let mut store = IssueTx::new(tx, ctx);
                store.apply(&TimelineOp::Insert(key.interval("New", at(100), None, false)))?;
                let stored = store.first_interval(&key)?.unwrap();
                assert!(store.apply(&TimelineOp::UpdateEnd {
                    interval: stored.clone(),
                    end_at: at(150),
                })?);
                // Same end again changes nothing.
                assert!(!store.apply(&TimelineOp::UpdateEnd {
                    interval: stored.clone(),
                    end_at: at(150),
                })?);
                assert!(store.apply(&TimelineOp::Delete(stored))?);
                Ok(())
            })
            .unwrap();

        assert!(storage.intervals(&key).unwrap().is_empty());
        let ops: Vec<String> = storage
            .audit_entries("1", "WI-1")
            .unwrap()
            .into_iter()
            .map(|e| e.op)
            .collect();
        assert_eq!(ops, vec!["insert", "update_end", "delete"]);
    }

    #[test]
    fn test_update_end_before_start_is_rejected() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let key = status_key();
        let result = storage.mutate("test", "1", |tx, ctx| {
            let mut store = IssueTx::new(tx, ctx);
            store.apply(&TimelineOp::Insert(key.interval("New", at(100), None, false)))?;
            let stored = store.first_interval(&key)?.unwrap();
            store.apply(&TimelineOp::UpdateEnd {
                interval: stored,
                end_at: at(50),
            })
        });
        assert!(matches!(result, Err(TimelineError::Validation { .. })));
    }

    #[test]
    fn test_transaction_rollback_on_error() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let key = status_key();

        let result: Result<()> = storage.mutate("test_fail", "1", |tx, ctx| {
            let mut store = IssueTx::new(tx, ctx);
            store.apply(&TimelineOp::Insert(key.interval("New", at(100), None, false)))?;
            Err(TimelineError::malformed("forced"))
        });

        assert!(result.is_err());
        assert!(storage.intervals(&key).unwrap().is_empty(), "interval should not exist after rollback");
        assert!(
            storage.audit_entries("1", "WI-1").unwrap().is_empty(),
            "audit should not exist after rollback"
        );
    }

    #[test]
    fn test_anchor_moves_only_synthetic_epoch_starts() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let status = status_key();
        let assignee = TimelineKey::new("1", "WI-1", FieldType::Assignee);
        let moved = storage
            .mutate("test", "1", |tx, ctx| {
                let mut store = IssueTx::new(tx, ctx);
                store.apply(&TimelineOp::Insert(status.interval("New", DateTime::UNIX_EPOCH, Some(at(500)), true)))?;
                // Would become empty: ends before creation.
                store.apply(&TimelineOp::Insert(assignee.interval("alice", DateTime::UNIX_EPOCH, Some(at(50)), true)))?;
                store.anchor_zero_starts("1", "WI-1", at(100))
            })
            .unwrap();
        assert_eq!(moved, 1);
        assert_eq!(storage.intervals(&status).unwrap()[0].start_at, at(100));
        assert_eq!(storage.intervals(&assignee).unwrap()[0].start_at, DateTime::UNIX_EPOCH);
        let audit = storage.audit_entries("1", "WI-1").unwrap();
        assert_eq!(audit.last().unwrap().op, "anchor");
    }

    #[test]
    fn test_issue_record_round_trip() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let record = IssueRecord {
            integration_id: "1".to_string(),
            issue_id: "WI-1".to_string(),
            issue_type: "Bug".to_string(),
            status: Some("Active".to_string()),
            assignee: Some("alice".to_string()),
            created_at: at(100),
            updated_at: at(200),
            resolved_at: None,
            hops: 2,
            bounces: 1,
        };
        storage
            .mutate("test", "1", |tx, ctx| IssueTx::new(tx, ctx).upsert_issue_record(&record))
            .unwrap();
        assert_eq!(storage.get_issue_record("1", "WI-1").unwrap(), Some(record));
        assert!(storage.get_issue_record("1", "WI-2").unwrap().is_none());
    }

    #[test]
    fn test_memberships_upsert_and_prune() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let membership = |sprint: &str, delivered: bool| SprintMembership {
            integration_id: "1".to_string(),
            issue_id: "WI-1".to_string(),
            sprint_id: sprint.to_string(),
            added_at: at(100),
            removed_at: None,
            planned: true,
            outside_of_sprint: false,
            delivered,
            story_points_planned: 3.0,
            story_points_delivered: 5.5,
            ignorable: false,
        };
        storage
            .mutate("test", "1", |tx, ctx| {
                let mut store = IssueTx::new(tx, ctx);
                store.upsert_sprint_membership(&membership("P\\S1", false))?;
                store.upsert_sprint_membership(&membership("P\\S2", false))?;
                store.upsert_sprint_membership(&membership("P\\S1", true))?;
                let removed = store.prune_sprint_memberships("1", "WI-1", &["P\\S1".to_string()])?;
                assert_eq!(removed, 1);
                Ok(())
            })
            .unwrap();

        let rows = storage.get_sprint_memberships("1", "WI-1").unwrap();
        assert_eq!(rows, vec![membership("P\\S1", true)]);
    }

    #[test]
    fn test_metadata_lookups() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let sprint = Sprint {
            id: "Proj\\Sprint 1".to_string(),
            integration_id: "1".to_string(),
            parent_key: "Proj".to_string(),
            name: "Sprint 1".to_string(),
            start_at: at(1000),
            end_at: at(2000),
            completed_at: Some(at(1900)),
        };
        storage.upsert_sprint(&sprint).unwrap();
        storage.set_status_category("1", "Done", "Completed").unwrap();

        assert_eq!(storage.resolve_sprint("1", "Proj", "Sprint 1").unwrap(), Some(sprint));
        assert!(storage.resolve_sprint("2", "Proj", "Sprint 1").unwrap().is_none());
        assert_eq!(
            storage.resolve_status_category("1", "done").unwrap().as_deref(),
            Some("Completed")
        );
        assert!(storage.resolve_status_category("1", "Active").unwrap().is_none());
    }
}
