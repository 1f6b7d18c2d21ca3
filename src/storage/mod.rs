//! `SQLite` storage layer for `issue_timeline`.
//!
//! The reconstructor and classifier only see the two traits defined here:
//! - [`TimelineStore`] - point queries and mutations on one field timeline
//! - [`MetadataStore`] - sprint and status category lookups
//!
//! [`SqliteStorage`] implements both on top of a bundled `SQLite` database
//! with WAL mode, a busy timeout for parallel workers and one transaction
//! per processed issue.
//!
//! # Submodules
//!
//! - [`schema`] - Database schema definitions
//! - [`sqlite`] - Main `SQLite` storage implementation

pub mod schema;
pub mod sqlite;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{FieldType, Sprint, TimelineInterval, TimelineKey};
use crate::timeline::TimelineOp;

pub use sqlite::{AuditEntry, IssueTx, MutationContext, SqliteStorage};

/// Ordered interval storage for field timelines.
///
/// Every query is scoped to a single (integration, issue, field) timeline.
/// Implementations must keep at most one interval per start instant.
pub trait TimelineStore {
    /// Interval with the earliest start.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn first_interval(&self, key: &TimelineKey) -> Result<Option<TimelineInterval>>;

    /// Interval with the latest start strictly before `at`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn last_interval_before(
        &self,
        key: &TimelineKey,
        at: DateTime<Utc>,
    ) -> Result<Option<TimelineInterval>>;

    /// Interval with the earliest start strictly after `at`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn first_interval_after(
        &self,
        key: &TimelineKey,
        at: DateTime<Utc>,
    ) -> Result<Option<TimelineInterval>>;

    /// All intervals in stored order (by start).
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn intervals(&self, key: &TimelineKey) -> Result<Vec<TimelineInterval>>;

    /// Field types with at least one stored interval for an issue.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn field_types_present(&self, integration_id: &str, issue_id: &str) -> Result<Vec<FieldType>>;

    /// Execute one operation. Returns `false` when it changed nothing
    /// (insert on an occupied start, or an upsert with identical content).
    ///
    /// # Errors
    ///
    /// Returns an error if the mutation fails.
    fn apply(&mut self, op: &TimelineOp) -> Result<bool>;

    /// Move synthetic intervals starting at epoch zero to `created_at`,
    /// skipping any that would end up empty. Returns the number moved.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    fn anchor_zero_starts(
        &mut self,
        integration_id: &str,
        issue_id: &str,
        created_at: DateTime<Utc>,
    ) -> Result<usize>;
}

/// Read-only reference data owned by the tracker connectors.
pub trait MetadataStore {
    /// Look up a sprint by its parsed path components.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn resolve_sprint(
        &self,
        integration_id: &str,
        parent_key: &str,
        name: &str,
    ) -> Result<Option<Sprint>>;

    /// Map a status value to its category (e.g. `closed`, `in progress`).
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn resolve_status_category(&self, integration_id: &str, status: &str) -> Result<Option<String>>;
}
