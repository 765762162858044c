//! Persisted record types for pipeline steps and retry context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Lifecycle status of a pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Running => write!(f, "running"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Which subset of the prior artifact is forwarded to the next iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReprocessStrategy {
    /// Entire previous output, no item filtering.
    FullReprocess,
    /// Only the items that failed validation.
    IncrementalFix,
    /// Everything not yet in the locked set.
    TargetedReprocess,
}

impl std::fmt::Display for ReprocessStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReprocessStrategy::FullReprocess => write!(f, "full_reprocess"),
            ReprocessStrategy::IncrementalFix => write!(f, "incremental_fix"),
            ReprocessStrategy::TargetedReprocess => write!(f, "targeted_reprocess"),
        }
    }
}

/// What an executor or validator did to a single item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModificationKind {
    Rewrite,
    Reformat,
    Remove,
    Insert,
}

/// Append-only log entry describing one item-level change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModificationRecord {
    pub item_id: String,
    pub kind: ModificationKind,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

/// Record of a single retry iteration. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryIteration {
    pub iteration: usize,
    pub score: f64,
    pub failing_categories: Vec<String>,
    pub failing_items: Vec<String>,
    /// Snapshot of the locked-item set at the end of this iteration.
    pub locked_snapshot: BTreeSet<String>,
    #[serde(default)]
    pub modifications: Vec<ModificationRecord>,
    pub timestamp: DateTime<Utc>,
}

/// Cross-iteration retry state for one step.
///
/// Created lazily on the first retry of a step and mutated every iteration.
/// Once the owning step is persisted as `Completed` the context is frozen
/// until an explicit reset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryContext {
    pub step_id: String,
    pub target_score: f64,
    pub max_iterations: usize,
    pub iteration_count: usize,
    pub iterations: Vec<RetryIteration>,
    pub locked_items: BTreeSet<String>,
    pub failing_categories: Vec<String>,
    pub strategy: Option<ReprocessStrategy>,
    #[serde(default)]
    pub category_weights: BTreeMap<String, f64>,
    pub score_history: Vec<f64>,
    #[serde(default)]
    pub modifications: Vec<ModificationRecord>,
}

impl RetryContext {
    pub fn new(step_id: impl Into<String>, target_score: f64, max_iterations: usize) -> Self {
        Self {
            step_id: step_id.into(),
            target_score,
            max_iterations,
            iteration_count: 0,
            iterations: Vec::new(),
            locked_items: BTreeSet::new(),
            failing_categories: Vec::new(),
            strategy: None,
            category_weights: BTreeMap::new(),
            score_history: Vec::new(),
            modifications: Vec::new(),
        }
    }

    /// Last recorded score, if any iteration has run.
    pub fn last_score(&self) -> Option<f64> {
        self.score_history.last().copied()
    }

    pub fn budget_spent(&self) -> bool {
        self.iteration_count >= self.max_iterations
    }
}

/// Persisted state for one pipeline step. Overwritten on every save.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub step_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: StepStatus,
    /// The step's artifact, opaque to the store.
    pub payload: serde_json::Value,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub retry: Option<RetryContext>,
}

/// Receipt returned by a save. Purely informational.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateHandle {
    pub id: String,
    pub step_id: String,
    pub saved_at: DateTime<Utc>,
}

impl StateHandle {
    pub(crate) fn new(step_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            step_id: step_id.to_string(),
            saved_at: Utc::now(),
        }
    }
}

/// Full-store snapshot used by checkpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub steps: BTreeMap<String, StepState>,
    pub locked_items: BTreeSet<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_starts_empty() {
        let ctx = RetryContext::new("draft", 90.0, 5);
        assert_eq!(ctx.iteration_count, 0);
        assert!(ctx.last_score().is_none());
        assert!(!ctx.budget_spent());
    }

    #[test]
    fn test_status_round_trip() {
        let json = serde_json::to_string(&StepStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
        let back: StepStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, StepStatus::Completed);
    }

    #[test]
    fn test_strategy_display() {
        assert_eq!(
            ReprocessStrategy::IncrementalFix.to_string(),
            "incremental_fix"
        );
    }
}
