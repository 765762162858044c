//! # draftgate-core
//!
//! The retry-and-state orchestration loop: drive an executor/validator pair
//! until the artifact meets its quality target, the iteration budget runs
//! out, or improvement stalls. Cross-iteration context lives in
//! `draftgate-store`; failure typing in `draftgate-faults`.

mod error;
mod outcome;
mod policy;
mod runner;
mod traits;

pub use error::RunnerError;
pub use outcome::{RetryResult, TerminationReason};
pub use policy::{
    category_policy, failing_categories, failing_items, guidance_for, select_strategy,
    CategoryPolicy, CATEGORY_PASS_THRESHOLD,
};
pub use runner::{RetryRunner, RunRequest};
pub use traits::{
    ContentItem, ExecutorError, StepArtifact, StepExecutor, StepInput, StepValidator,
    ValidationIssue, ValidationReport, ValidatorError,
};
