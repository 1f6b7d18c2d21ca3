//! Database schema definitions.

use rusqlite::{Connection, Result};

pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// The complete SQL schema for the timeline database.
///
/// All timestamps are Unix seconds (UTC). Epoch zero marks a leading
/// interval whose true start is unknown.
pub const SCHEMA_SQL: &str = r"
    -- Field timelines: one row per [start_at, end_at) interval
    CREATE TABLE IF NOT EXISTS timeline_intervals (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        integration_id TEXT NOT NULL,
        issue_id TEXT NOT NULL,
        field_type TEXT NOT NULL CHECK(field_type IN ('status', 'assignee', 'sprint', 'story_points')),
        value TEXT NOT NULL,
        start_at INTEGER NOT NULL,
        end_at INTEGER,
        synthetic INTEGER NOT NULL DEFAULT 0,
        UNIQUE (integration_id, issue_id, field_type, start_at),
        CHECK (end_at IS NULL OR end_at >= start_at)
    );
    CREATE INDEX IF NOT EXISTS idx_timeline_issue ON timeline_intervals(integration_id, issue_id);

    -- Every change made to a timeline, in application order
    CREATE TABLE IF NOT EXISTS timeline_audit (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        integration_id TEXT NOT NULL,
        issue_id TEXT NOT NULL,
        field_type TEXT NOT NULL,
        op TEXT NOT NULL,
        interval_id INTEGER,
        value TEXT,
        start_at INTEGER,
        end_at INTEGER,
        batch_op TEXT NOT NULL DEFAULT '',
        recorded_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_timeline_audit_issue ON timeline_audit(integration_id, issue_id);

    -- Issue summaries with derived reassignment metrics
    CREATE TABLE IF NOT EXISTS issues (
        integration_id TEXT NOT NULL,
        issue_id TEXT NOT NULL,
        issue_type TEXT NOT NULL DEFAULT '',
        status TEXT,
        assignee TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        resolved_at INTEGER,
        hops INTEGER NOT NULL DEFAULT 0,
        bounces INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (integration_id, issue_id)
    );

    -- Sprint metadata (maintained by the connectors)
    CREATE TABLE IF NOT EXISTS sprints (
        integration_id TEXT NOT NULL,
        id TEXT NOT NULL,
        parent_key TEXT NOT NULL,
        name TEXT NOT NULL,
        start_at INTEGER NOT NULL,
        end_at INTEGER NOT NULL,
        completed_at INTEGER,
        PRIMARY KEY (integration_id, id),
        UNIQUE (integration_id, parent_key, name)
    );

    -- Status to status category mapping
    CREATE TABLE IF NOT EXISTS status_categories (
        integration_id TEXT NOT NULL,
        status TEXT NOT NULL COLLATE NOCASE,
        category TEXT NOT NULL,
        PRIMARY KEY (integration_id, status)
    );

    -- Derived: one row per (issue, sprint) membership
    CREATE TABLE IF NOT EXISTS sprint_memberships (
        integration_id TEXT NOT NULL,
        issue_id TEXT NOT NULL,
        sprint_id TEXT NOT NULL,
        added_at INTEGER NOT NULL,
        removed_at INTEGER,
        planned INTEGER NOT NULL DEFAULT 0,
        outside_of_sprint INTEGER NOT NULL DEFAULT 0,
        delivered INTEGER NOT NULL DEFAULT 0,
        story_points_planned REAL NOT NULL DEFAULT 0,
        story_points_delivered REAL NOT NULL DEFAULT 0,
        ignorable INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (integration_id, issue_id, sprint_id)
    );
";

/// Apply the schema to the database.
///
/// This uses `execute_batch` to run the entire DDL script.
/// It is idempotent because all statements use `IF NOT EXISTS`.
///
/// # Errors
///
/// Returns an error if the SQL execution fails or pragmas cannot be set.
pub fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    // NORMAL synchronous is safe with WAL: committed data survives OS crash
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "cache_size", "-8000")?;
    conn.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_apply_schema() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).expect("Failed to apply schema");

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        for table in [
            "timeline_intervals",
            "timeline_audit",
            "issues",
            "sprints",
            "status_categories",
            "sprint_memberships",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        // In-memory DBs use MEMORY journaling, regardless of what we set
        assert!(journal_mode.eq_ignore_ascii_case("WAL") || journal_mode.eq_ignore_ascii_case("MEMORY"));

        let version: i32 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_apply_schema_twice_is_noop() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();
        apply_schema(&conn).unwrap();
    }

    #[test]
    fn test_reapplying_schema_keeps_rows() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();
        conn.execute(
            "INSERT INTO timeline_intervals (integration_id, issue_id, field_type, value, start_at, synthetic)
             VALUES ('1', 'WI-1', 'status', 'New', 0, 1)",
            [],
        )
        .unwrap();

        apply_schema(&conn).unwrap();

        let (value, synthetic): (String, bool) = conn
            .query_row("SELECT value, synthetic FROM timeline_intervals", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(value, "New");
        assert!(synthetic);
        let version: i32 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_unique_start_per_timeline() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();
        let insert = "INSERT INTO timeline_intervals (integration_id, issue_id, field_type, value, start_at)
                      VALUES ('1', 'WI-1', 'status', ?, 100)";
        conn.execute(insert, ["New"]).unwrap();
        assert!(conn.execute(insert, ["Active"]).is_err());
    }
}
