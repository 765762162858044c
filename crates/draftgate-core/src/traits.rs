use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Errors raised by an executor implementation
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Executor process failed: {0}")]
    ProcessFailed(String),

    #[error("Executor produced unparseable output: {0}")]
    BadOutput(String),

    #[error("Executor configuration error: {0}")]
    ConfigError(String),
}

/// Errors raised by a validator implementation
#[derive(Error, Debug)]
pub enum ValidatorError {
    #[error("Validator process failed: {0}")]
    ProcessFailed(String),

    #[error("Validator produced unparseable report: {0}")]
    BadReport(String),
}

/// One addressable unit of a step's artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: String,
    pub content: String,
}

/// The artifact a step produces: an ordered collection of items
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepArtifact {
    pub items: Vec<ContentItem>,
}

impl StepArtifact {
    pub fn new(items: Vec<ContentItem>) -> Self {
        Self { items }
    }

    /// Ids of every item in the artifact
    pub fn item_ids(&self) -> BTreeSet<String> {
        self.items.iter().map(|i| i.id.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Input handed to the executor each iteration.
///
/// Locked items are already validated as passing; the executor must leave
/// them untouched. Guidance carries category-specific instructions derived
/// from the previous iteration's failures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepInput {
    pub items: Vec<ContentItem>,
    #[serde(default)]
    pub guidance: Vec<String>,
    #[serde(default)]
    pub locked_items: BTreeSet<String>,
}

impl StepInput {
    pub fn new(items: Vec<ContentItem>) -> Self {
        Self {
            items,
            guidance: Vec::new(),
            locked_items: BTreeSet::new(),
        }
    }
}

/// A single issue reported by the validator, optionally tied to an item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub category: String,
    pub message: String,
    pub item_id: Option<String>,
}

/// The validator's verdict: an aggregate score (0-100), per-category
/// sub-scores, and an issue list
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub score: f64,
    #[serde(default)]
    pub categories: BTreeMap<String, f64>,
    #[serde(default)]
    pub issues: Vec<ValidationIssue>,
}

/// Produces an artifact from a step input. May fail; a failure aborts the
/// current run.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Human-readable name, for logs
    fn name(&self) -> &str;

    async fn execute(&self, input: &StepInput) -> Result<StepArtifact, ExecutorError>;
}

/// Scores an artifact and reports per-category failures
#[async_trait]
pub trait StepValidator: Send + Sync {
    /// Human-readable name, for logs
    fn name(&self) -> &str;

    async fn validate(&self, artifact: &StepArtifact) -> Result<ValidationReport, ValidatorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_ids() {
        let artifact = StepArtifact::new(vec![
            ContentItem {
                id: "b".into(),
                content: String::new(),
            },
            ContentItem {
                id: "a".into(),
                content: String::new(),
            },
        ]);
        let ids: Vec<_> = artifact.item_ids().into_iter().collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_report_deserializes_with_defaults() {
        let report: ValidationReport = serde_json::from_str(r#"{"score": 88.0}"#).unwrap();
        assert_eq!(report.score, 88.0);
        assert!(report.categories.is_empty());
        assert!(report.issues.is_empty());
    }
}
