use serde::{Deserialize, Serialize};

use draftgate_store::RetryContext;

use crate::traits::StepArtifact;

/// Why a retry run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// Target met, or no failing categories remain
    Success,
    /// Iteration budget spent without meeting the target
    MaxIterations,
    /// Scores stopped improving while still short of the target
    Stalled,
    /// The executor (or validator) failed; never retried within the run
    CriticalError,
    /// Cooperative cancellation between iterations
    Interrupted,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::Success => "success",
            TerminationReason::MaxIterations => "max_iterations",
            TerminationReason::Stalled => "stalled",
            TerminationReason::CriticalError => "critical_error",
            TerminationReason::Interrupted => "interrupted",
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The final result of one retry run.
///
/// On any non-success outcome the last good artifact and the full
/// per-iteration context are retained for diagnosis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryResult {
    pub success: bool,
    pub final_score: f64,
    pub iterations_used: usize,
    pub reason: TerminationReason,
    pub artifact: Option<StepArtifact>,
    pub context: RetryContext,
}

impl RetryResult {
    pub fn success(
        final_score: f64,
        iterations_used: usize,
        artifact: StepArtifact,
        context: RetryContext,
    ) -> Self {
        Self {
            success: true,
            final_score,
            iterations_used,
            reason: TerminationReason::Success,
            artifact: Some(artifact),
            context,
        }
    }

    pub fn failed(
        reason: TerminationReason,
        final_score: f64,
        iterations_used: usize,
        artifact: Option<StepArtifact>,
        context: RetryContext,
    ) -> Self {
        Self {
            success: false,
            final_score,
            iterations_used,
            reason,
            artifact,
            context,
        }
    }

    /// Process exit code for CLI use
    pub fn exit_code(&self) -> i32 {
        match self.reason {
            TerminationReason::Success => 0,
            TerminationReason::MaxIterations | TerminationReason::Stalled => 1,
            TerminationReason::CriticalError => 2,
            TerminationReason::Interrupted => 130,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_strings() {
        assert_eq!(TerminationReason::Success.as_str(), "success");
        assert_eq!(TerminationReason::MaxIterations.as_str(), "max_iterations");
        assert_eq!(TerminationReason::Stalled.as_str(), "stalled");
        assert_eq!(TerminationReason::CriticalError.as_str(), "critical_error");
    }

    #[test]
    fn test_exit_codes() {
        let ctx = RetryContext::new("s", 90.0, 3);
        let ok = RetryResult::success(93.0, 3, StepArtifact::default(), ctx.clone());
        assert_eq!(ok.exit_code(), 0);

        let stalled =
            RetryResult::failed(TerminationReason::Stalled, 68.0, 3, None, ctx.clone());
        assert_eq!(stalled.exit_code(), 1);

        let aborted =
            RetryResult::failed(TerminationReason::CriticalError, 70.0, 1, None, ctx);
        assert_eq!(aborted.exit_code(), 2);
    }
}
