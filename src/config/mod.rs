//! Configuration management for `issue_timeline`.
//!
//! Configuration sources and precedence (highest wins):
//! 1. Explicit overrides from the embedding job
//! 2. Environment variables (`TIMELINE_*`)
//! 3. Project config file (`timeline.yaml`)
//! 4. Defaults
//!
//! Startup keys (database path, worker count) are kept apart from runtime
//! keys that tune normalization and classification.

use crate::error::{Result, TimelineError};
use crate::normalize::TrackerKind;
use crate::sprint::OverlapPolicy;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Default config filename looked up next to the database.
pub const DEFAULT_CONFIG_FILENAME: &str = "timeline.yaml";
/// Assignee value trackers use for "nobody".
pub const DEFAULT_UNASSIGNED: &str = "UNASSIGNED";
/// Bounded size of each per-run lookup cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 250;

const ENV_PREFIX: &str = "TIMELINE_";
/// Sections whose keys are dotted, e.g. `sprint.path-separator`.
const SECTIONS: &[&str] = &["sprint"];

/// A configuration layer split into startup-only and runtime keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigLayer {
    pub startup: HashMap<String, String>,
    pub runtime: HashMap<String, String>,
}

impl ConfigLayer {
    /// Merge another layer on top of this one (higher precedence wins).
    pub fn merge_from(&mut self, other: &Self) {
        for (key, value) in &other.startup {
            self.startup.insert(key.clone(), value.clone());
        }
        for (key, value) in &other.runtime {
            self.runtime.insert(key.clone(), value.clone());
        }
    }

    /// Merge multiple layers in precedence order (lowest to highest).
    #[must_use]
    pub fn merge_layers(layers: &[Self]) -> Self {
        let mut merged = Self::default();
        for layer in layers {
            merged.merge_from(layer);
        }
        merged
    }

    /// Build a layer from a YAML file path. Missing files return empty config.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn from_yaml(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)?;
        let value: serde_yaml::Value = serde_yaml::from_str(&contents)?;
        Ok(layer_from_yaml_value(&value))
    }

    /// Build a layer from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_env_vars(env::vars())
    }

    /// Build a layer from `(name, value)` pairs, keeping `TIMELINE_*` names.
    pub fn from_env_vars<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut layer = Self::default();
        for (key, value) in vars {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                insert_key_value(&mut layer, &env_key(stripped), value);
            }
        }
        layer
    }

    fn get(&self, key: &str) -> Option<&String> {
        let key = normalize_key(key);
        self.runtime.get(&key).or_else(|| self.startup.get(&key))
    }
}

/// Overrides supplied directly by the embedding batch job.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub db: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub workers: Option<usize>,
    pub tracker: Option<TrackerKind>,
    pub overlap_policy: Option<OverlapPolicy>,
}

impl ConfigOverrides {
    #[must_use]
    pub fn as_layer(&self) -> ConfigLayer {
        let mut layer = ConfigLayer::default();

        if let Some(path) = &self.db {
            insert_key_value(&mut layer, "db", path.to_string_lossy().to_string());
        }
        if let Some(path) = &self.log_file {
            insert_key_value(&mut layer, "log-file", path.to_string_lossy().to_string());
        }
        if let Some(workers) = self.workers {
            insert_key_value(&mut layer, "workers", workers.to_string());
        }
        if let Some(tracker) = self.tracker {
            insert_key_value(&mut layer, "tracker", tracker.as_str().to_string());
        }
        if let Some(policy) = self.overlap_policy {
            insert_key_value(&mut layer, "overlap-policy", policy.as_str().to_string());
        }

        layer
    }
}

/// Default config layer (lowest precedence).
#[must_use]
pub fn default_config_layer() -> ConfigLayer {
    let mut layer = ConfigLayer::default();
    for (key, value) in [
        ("tracker", "azure-devops"),
        ("unassigned", DEFAULT_UNASSIGNED),
        ("ignorable-issue-types", "sub-task"),
        ("closed-status-categories", "closed,completed"),
        ("overlap-policy", "first-match"),
        ("sprint.path-separator", "\\"),
        ("workers", "1"),
    ] {
        insert_key_value(&mut layer, key, value.to_string());
    }
    insert_key_value(
        &mut layer,
        "cache-capacity",
        DEFAULT_CACHE_CAPACITY.to_string(),
    );
    layer
}

/// Load configuration with the standard precedence order.
///
/// # Errors
///
/// Returns an error if the config file cannot be read or parsed, or the
/// merged values fail validation.
pub fn load_config(config_dir: &Path, overrides: &ConfigOverrides) -> Result<PipelineConfig> {
    let merged = ConfigLayer::merge_layers(&[
        default_config_layer(),
        ConfigLayer::from_yaml(&config_dir.join(DEFAULT_CONFIG_FILENAME))?,
        ConfigLayer::from_env(),
        overrides.as_layer(),
    ]);
    PipelineConfig::from_layer(&merged)
}

/// Typed settings consumed by the normalizers, classifier and batch runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub db_path: Option<PathBuf>,
    /// JSON log file for [`crate::logging::init_logging`].
    pub log_file: Option<PathBuf>,
    pub tracker: TrackerKind,
    /// Assignee value excluded from hops and bounces.
    pub unassigned: String,
    /// Lowercased issue types whose memberships are marked ignorable.
    pub ignorable_issue_types: Vec<String>,
    /// Lowercased status categories that count as delivered.
    pub closed_status_categories: Vec<String>,
    pub overlap_policy: OverlapPolicy,
    pub sprint_path_separator: String,
    /// Tracker field carrying story points; `None` uses the tracker default.
    pub story_points_field: Option<String>,
    pub cache_capacity: usize,
    pub workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        // The default layer only holds valid values.
        Self::from_layer(&default_config_layer()).unwrap_or_else(|_| Self {
            db_path: None,
            log_file: None,
            tracker: TrackerKind::AzureDevops,
            unassigned: DEFAULT_UNASSIGNED.to_string(),
            ignorable_issue_types: vec!["sub-task".to_string()],
            closed_status_categories: vec!["closed".to_string(), "completed".to_string()],
            overlap_policy: OverlapPolicy::FirstMatch,
            sprint_path_separator: "\\".to_string(),
            story_points_field: None,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            workers: 1,
        })
    }
}

impl PipelineConfig {
    /// Build typed config from a merged layer.
    ///
    /// # Errors
    ///
    /// Returns an error if a value cannot be parsed or is out of range.
    pub fn from_layer(layer: &ConfigLayer) -> Result<Self> {
        let tracker: TrackerKind = layer
            .get("tracker")
            .map_or(Ok(TrackerKind::AzureDevops), |v| v.parse::<TrackerKind>())?;
        let overlap_policy: OverlapPolicy = layer
            .get("overlap-policy")
            .map_or(Ok(OverlapPolicy::FirstMatch), |v| v.parse::<OverlapPolicy>())?;

        let cache_capacity = parse_usize(layer, "cache-capacity")?.unwrap_or(DEFAULT_CACHE_CAPACITY);
        if cache_capacity == 0 {
            return Err(TimelineError::validation(
                "cache-capacity",
                "must be at least 1",
            ));
        }
        let workers = parse_usize(layer, "workers")?.unwrap_or(1);
        if workers == 0 {
            return Err(TimelineError::validation("workers", "must be at least 1"));
        }

        let sprint_path_separator = layer
            .get("sprint.path-separator")
            .cloned()
            .unwrap_or_else(|| "\\".to_string());
        if sprint_path_separator.is_empty() {
            return Err(TimelineError::validation(
                "sprint.path-separator",
                "must not be empty",
            ));
        }

        Ok(Self {
            db_path: layer.get("db").map(PathBuf::from),
            log_file: layer.get("log-file").map(PathBuf::from),
            tracker,
            unassigned: layer
                .get("unassigned")
                .cloned()
                .unwrap_or_else(|| DEFAULT_UNASSIGNED.to_string()),
            ignorable_issue_types: parse_list(layer, "ignorable-issue-types"),
            closed_status_categories: parse_list(layer, "closed-status-categories"),
            overlap_policy,
            sprint_path_separator,
            story_points_field: layer
                .get("story-points-field")
                .filter(|v| !v.trim().is_empty())
                .cloned(),
            cache_capacity,
            workers,
        })
    }

    /// True if memberships for this issue type should be flagged ignorable.
    #[must_use]
    pub fn is_ignorable_type(&self, issue_type: &str) -> bool {
        let lowered = issue_type.trim().to_lowercase();
        self.ignorable_issue_types.iter().any(|t| *t == lowered)
    }

    /// True if the status category counts as closed.
    #[must_use]
    pub fn is_closed_category(&self, category: &str) -> bool {
        let lowered = category.trim().to_lowercase();
        self.closed_status_categories.iter().any(|c| *c == lowered)
    }
}

/// Determine if a key is startup-only.
fn is_startup_key(key: &str) -> bool {
    matches!(normalize_key(key).as_str(), "db" | "workers" | "log-file")
}

fn insert_key_value(layer: &mut ConfigLayer, key: &str, value: String) {
    let key = normalize_key(key);
    if is_startup_key(&key) {
        layer.startup.insert(key, value);
    } else {
        layer.runtime.insert(key, value);
    }
}

fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase().replace('_', "-")
}

/// `SPRINT_PATH_SEPARATOR` becomes `sprint.path-separator`.
fn env_key(name: &str) -> String {
    let key = normalize_key(name);
    for section in SECTIONS {
        if let Some(rest) = key.strip_prefix(*section).and_then(|r| r.strip_prefix('-')) {
            return format!("{section}.{rest}");
        }
    }
    key
}

fn parse_usize(layer: &ConfigLayer, key: &str) -> Result<Option<usize>> {
    layer
        .get(key)
        .map(|value| {
            value
                .trim()
                .parse::<usize>()
                .map_err(|e| TimelineError::validation(key, e.to_string()))
        })
        .transpose()
}

fn parse_list(layer: &ConfigLayer, key: &str) -> Vec<String> {
    layer
        .get(key)
        .map(|value| {
            value
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn layer_from_yaml_value(value: &serde_yaml::Value) -> ConfigLayer {
    let mut layer = ConfigLayer::default();
    let mut flat = HashMap::new();
    flatten_yaml(value, "", &mut flat);

    for (key, value) in flat {
        insert_key_value(&mut layer, &key, value);
    }

    layer
}

fn flatten_yaml(value: &serde_yaml::Value, prefix: &str, out: &mut HashMap<String, String>) {
    match value {
        serde_yaml::Value::Mapping(map) => {
            for (key, value) in map {
                let Some(key_str) = key.as_str() else {
                    continue;
                };
                let next_prefix = if prefix.is_empty() {
                    key_str.to_string()
                } else {
                    format!("{prefix}.{key_str}")
                };
                flatten_yaml(value, &next_prefix, out);
            }
        }
        serde_yaml::Value::Sequence(values) => {
            let joined = values
                .iter()
                .filter_map(yaml_scalar_to_string)
                .collect::<Vec<_>>()
                .join(",");
            out.insert(prefix.to_string(), joined);
        }
        _ => {
            if let Some(value) = yaml_scalar_to_string(value) {
                out.insert(prefix.to_string(), value);
            }
        }
    }
}

fn yaml_scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::Bool(v) => Some(v.to_string()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Null
        | serde_yaml::Value::Sequence(_)
        | serde_yaml::Value::Mapping(_) => None,
        serde_yaml::Value::Tagged(tagged) => yaml_scalar_to_string(&tagged.value),
    }
}
