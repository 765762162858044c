//! Static recovery-strategy table: one entry per error kind.
//!
//! Strategies are advisory. The retry loop consumes validation failures
//! directly; structural and dependency errors are classified and returned to
//! the caller with a strategy attached, never auto-executed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::condition::ErrorKind;

/// Primary (or fallback) action a caller may take to recover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Re-run the whole step through the retry loop.
    RetryStep,
    /// Re-run only the items that failed validation.
    ReprocessFailedItems,
    /// Drive the named upstream step to completion first.
    RerunUpstream,
    /// Continue with the in-memory store, skip durable writes.
    UseMemoryStore,
    /// Stop the run and surface the error.
    AbortRun,
}

/// Recovery policy for one error kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStrategy {
    pub action: RecoveryAction,
    pub target_step: Option<String>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// Bounded attempts for the primary action.
    pub max_attempts: u32,
    /// Tried once after the primary's attempts are exhausted.
    pub fallback: Option<RecoveryAction>,
}

/// Look up the statically registered strategy for an error kind.
pub fn recovery_strategy(kind: ErrorKind) -> RecoveryStrategy {
    match kind {
        ErrorKind::ValidationBelowThreshold => RecoveryStrategy {
            action: RecoveryAction::ReprocessFailedItems,
            target_step: None,
            params: BTreeMap::from([("scope".to_string(), "failing_items".to_string())]),
            max_attempts: 3,
            fallback: Some(RecoveryAction::RetryStep),
        },
        ErrorKind::MissingStructuralElement => RecoveryStrategy {
            action: RecoveryAction::RetryStep,
            target_step: None,
            params: BTreeMap::from([("scope".to_string(), "full_artifact".to_string())]),
            max_attempts: 2,
            fallback: Some(RecoveryAction::AbortRun),
        },
        ErrorKind::UpstreamIncomplete => RecoveryStrategy {
            action: RecoveryAction::RerunUpstream,
            target_step: None,
            params: BTreeMap::new(),
            max_attempts: 1,
            fallback: Some(RecoveryAction::AbortRun),
        },
        ErrorKind::PersistenceFailure => RecoveryStrategy {
            action: RecoveryAction::UseMemoryStore,
            target_step: None,
            params: BTreeMap::new(),
            max_attempts: 1,
            fallback: None,
        },
        ErrorKind::ExecutorFailure => RecoveryStrategy {
            action: RecoveryAction::AbortRun,
            target_step: None,
            params: BTreeMap::new(),
            max_attempts: 1,
            fallback: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_KINDS: [ErrorKind; 5] = [
        ErrorKind::ValidationBelowThreshold,
        ErrorKind::MissingStructuralElement,
        ErrorKind::UpstreamIncomplete,
        ErrorKind::PersistenceFailure,
        ErrorKind::ExecutorFailure,
    ];

    #[test]
    fn test_every_kind_has_a_strategy() {
        for kind in ALL_KINDS {
            let strategy = recovery_strategy(kind);
            assert!(strategy.max_attempts >= 1, "{kind} has no attempt budget");
        }
    }

    #[test]
    fn test_executor_failure_aborts() {
        let strategy = recovery_strategy(ErrorKind::ExecutorFailure);
        assert_eq!(strategy.action, RecoveryAction::AbortRun);
        assert!(strategy.fallback.is_none());
    }

    #[test]
    fn test_persistence_failure_degrades_to_memory() {
        let strategy = recovery_strategy(ErrorKind::PersistenceFailure);
        assert_eq!(strategy.action, RecoveryAction::UseMemoryStore);
    }
}
