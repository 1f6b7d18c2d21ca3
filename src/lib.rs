//! `issue_timeline` - field timelines and sprint delivery metrics for issues
//!
//! Connectors deliver issues from a work tracker (Azure DevOps or Jira) as a
//! current snapshot plus raw change history. This crate turns that history
//! into continuous per-field timelines, keeps them consistent as late or
//! duplicate updates arrive, and derives reassignment and sprint delivery
//! metrics from them.
//!
//! # Architecture
//!
//! - [`normalize`] - Tracker history records to [`model::ChangeEvent`]s
//! - [`timeline`] - Stitching events into gap-free interval timelines
//! - [`metrics`] - Hops and bounces from assignee timelines
//! - [`sprint`] - Sprint membership classification and lookup caches
//! - [`pipeline`] - Per-issue orchestration and batch runners
//! - [`storage`] - `SQLite` persistence for timelines and derived rows
//! - [`config`] - Layered configuration
//! - [`model`] - Shared data types
//! - [`error`] - Error types

#![forbid(unsafe_code)]
#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod sprint;
pub mod storage;
pub mod timeline;

pub use config::PipelineConfig;
pub use error::{Result, TimelineError};
pub use pipeline::{BatchReport, IssueBatch, IssueInput, process_issue, run_batch, run_batch_parallel};
pub use storage::SqliteStorage;
