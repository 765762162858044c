//! Failure classification.
//!
//! Classification is a total function over structured condition data: every
//! `FailureCondition` maps to exactly one `ErrorKind`. Nothing here inspects
//! the runtime type of a raised value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Structured description of something that went wrong during a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "condition", rename_all = "snake_case")]
pub enum FailureCondition {
    /// A validation category scored below the pass threshold.
    CategoryBelowThreshold {
        step_id: String,
        category: String,
        score: f64,
        threshold: f64,
    },
    /// A required structural element is missing from the artifact.
    MissingStructure { step_id: String, element: String },
    /// An upstream step has not completed yet.
    UpstreamIncomplete {
        step_id: String,
        upstream: String,
        status: String,
    },
    /// The state store could not read or write a record.
    PersistenceFailure {
        step_id: String,
        operation: String,
        message: String,
    },
    /// The executor callback returned an error.
    ExecutorFailure { step_id: String, message: String },
}

/// Closed set of error kinds. One per condition family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationBelowThreshold,
    MissingStructuralElement,
    UpstreamIncomplete,
    PersistenceFailure,
    ExecutorFailure,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::ValidationBelowThreshold => write!(f, "validation_below_threshold"),
            ErrorKind::MissingStructuralElement => write!(f, "missing_structural_element"),
            ErrorKind::UpstreamIncomplete => write!(f, "upstream_incomplete"),
            ErrorKind::PersistenceFailure => write!(f, "persistence_failure"),
            ErrorKind::ExecutorFailure => write!(f, "executor_failure"),
        }
    }
}

/// Classified pipeline error, suitable for persistence and run logs.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("[{kind}] step '{step_id}': {message}")]
pub struct PipelineError {
    pub kind: ErrorKind,
    pub message: String,
    pub step_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
    pub recoverable: bool,
}

/// Map a failure condition to its classified error. Total and deterministic.
pub fn classify(condition: &FailureCondition) -> PipelineError {
    let timestamp = Utc::now();
    match condition {
        FailureCondition::CategoryBelowThreshold {
            step_id,
            category,
            score,
            threshold,
        } => PipelineError {
            kind: ErrorKind::ValidationBelowThreshold,
            message: format!(
                "category '{category}' scored {score:.1}, below threshold {threshold:.1}"
            ),
            step_id: step_id.clone(),
            timestamp,
            details: BTreeMap::from([
                ("category".to_string(), category.clone()),
                ("score".to_string(), format!("{score:.1}")),
                ("threshold".to_string(), format!("{threshold:.1}")),
            ]),
            recoverable: true,
        },
        FailureCondition::MissingStructure { step_id, element } => PipelineError {
            kind: ErrorKind::MissingStructuralElement,
            message: format!("required element '{element}' is missing"),
            step_id: step_id.clone(),
            timestamp,
            details: BTreeMap::from([("element".to_string(), element.clone())]),
            recoverable: true,
        },
        FailureCondition::UpstreamIncomplete {
            step_id,
            upstream,
            status,
        } => PipelineError {
            kind: ErrorKind::UpstreamIncomplete,
            message: format!("upstream step '{upstream}' is {status}, not completed"),
            step_id: step_id.clone(),
            timestamp,
            details: BTreeMap::from([
                ("upstream".to_string(), upstream.clone()),
                ("status".to_string(), status.clone()),
            ]),
            recoverable: true,
        },
        FailureCondition::PersistenceFailure {
            step_id,
            operation,
            message,
        } => PipelineError {
            kind: ErrorKind::PersistenceFailure,
            message: format!("persistence {operation} failed: {message}"),
            step_id: step_id.clone(),
            timestamp,
            details: BTreeMap::from([("operation".to_string(), operation.clone())]),
            recoverable: true,
        },
        FailureCondition::ExecutorFailure { step_id, message } => PipelineError {
            kind: ErrorKind::ExecutorFailure,
            message: format!("executor failed: {message}"),
            step_id: step_id.clone(),
            timestamp,
            details: BTreeMap::new(),
            recoverable: false,
        },
    }
}
