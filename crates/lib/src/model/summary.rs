//! Reconcile outcome summaries.
//!
//! A [`SummarySpec`] is the machine-readable account of one reconcile: how
//! many targets were addressed, how many succeeded, and the per-target,
//! per-component results. The persisted [`SummaryResult`] wraps it with the
//! spec generation and a timestamp so external watchers can judge both
//! convergence and staleness.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use maestro_core::Status;
use serde::{Deserialize, Serialize};

/// Target result status for a fully applied step.
pub const TARGET_STATUS_OK: &str = "OK";

/// Target result status after a failed step.
pub const TARGET_STATUS_ERROR: &str = "Error";

/// Per-component outcome on one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentResultSpec {
    pub status: Status,
    #[serde(default)]
    pub message: String,
}

/// Per-target outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TargetResultSpec {
    pub status: String,
    pub message: String,
    pub component_results: BTreeMap<String, ComponentResultSpec>,
}

/// The outcome of one reconcile call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SummarySpec {
    pub target_count: usize,
    pub success_count: usize,
    pub all_assigned_deployed: bool,
    pub skipped: bool,
    pub is_removal: bool,
    pub summary_message: String,
    pub target_results: BTreeMap<String, TargetResultSpec>,
}

impl SummarySpec {
    /// A fresh summary for a deployment addressing `target_count` targets.
    pub fn for_targets(target_count: usize) -> Self {
        Self {
            target_count,
            ..Default::default()
        }
    }

    /// Records (or replaces) the result for one target.
    pub fn update_target_result(&mut self, target: &str, result: TargetResultSpec) {
        self.target_results.insert(target.to_string(), result);
    }
}

/// The persisted summary record, keyed `"summary-" + instance name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryResult {
    pub summary: SummarySpec,
    /// The input spec generation, echoed as-is.
    #[serde(default)]
    pub generation: String,
    pub time: DateTime<Utc>,
}
