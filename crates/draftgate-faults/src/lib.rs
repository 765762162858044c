//! # draftgate-faults
//!
//! Failure classification for the retry pipeline: a closed error-kind enum,
//! a total `classify` function over structured condition data, and a static
//! recovery-strategy table.

mod condition;
mod strategy;

pub use condition::{classify, ErrorKind, FailureCondition, PipelineError};
pub use strategy::{recovery_strategy, RecoveryAction, RecoveryStrategy};
