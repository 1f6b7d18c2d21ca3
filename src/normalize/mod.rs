//! Event normalization: raw tracker history records to [`ChangeEvent`]s.
//!
//! Every tracker adapter implements [`EventNormalizer`]. The batch runner
//! picks one through [`normalizer_for`] based on configuration; adapters do
//! not share state and never touch storage.

pub mod azure;
pub mod jira;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::PipelineConfig;
use crate::error::{Result, TimelineError};
use crate::model::ChangeEvent;

pub use azure::AzureDevopsNormalizer;
pub use jira::JiraNormalizer;

/// Issue identity passed alongside each raw record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueContext {
    pub issue_id: String,
    pub created_at: DateTime<Utc>,
}

/// Converts one connector-specific history record into change events.
pub trait EventNormalizer: Send + Sync {
    fn tracker(&self) -> TrackerKind;

    /// Normalize one record.
    ///
    /// Returns one event per tracked field that changed; untracked fields are
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns [`TimelineError::MalformedRecord`] when the record has no
    /// resolvable timestamp or is not an object.
    fn normalize(&self, record: &Value, issue: &IssueContext) -> Result<Vec<ChangeEvent>>;
}

/// Supported upstream trackers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrackerKind {
    AzureDevops,
    Jira,
}

impl TrackerKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AzureDevops => "azure-devops",
            Self::Jira => "jira",
        }
    }
}

impl fmt::Display for TrackerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrackerKind {
    type Err = TimelineError;

    fn from_str(input: &str) -> std::result::Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "azure-devops" | "azure_devops" | "azuredevops" | "ado" => Ok(Self::AzureDevops),
            "jira" => Ok(Self::Jira),
            other => Err(TimelineError::Config(format!(
                "Invalid tracker: {other}. Must be one of: azure-devops, jira"
            ))),
        }
    }
}

/// Build the normalizer configured for this run.
#[must_use]
pub fn normalizer_for(config: &PipelineConfig) -> Box<dyn EventNormalizer> {
    match config.tracker {
        TrackerKind::AzureDevops => Box::new(AzureDevopsNormalizer::from_config(config)),
        TrackerKind::Jira => Box::new(JiraNormalizer::from_config(config)),
    }
}

/// Parse a tracker timestamp (RFC 3339, or Jira's `+0000` offset form).
///
/// Timelines are kept at second precision, so fractions are dropped here.
pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .ok()
        .and_then(|dt| dt.with_timezone(&Utc).with_nanosecond(0))
}

/// Render a scalar JSON value as a timeline value. Blank strings are `None`.
pub(crate) fn scalar_to_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Value::Number(n) => n.as_f64().map_or_else(
            || Some(n.to_string()),
            |f| {
                if f.fract() == 0.0 && f.abs() < 1e15 {
                    Some(format!("{f:.0}"))
                } else {
                    Some(f.to_string())
                }
            },
        ),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}
