//! # draftgate-store
//!
//! Durable, keyed storage for pipeline step state and retry context.
//!
//! The store owns the shared locked-item set and each step's score history.
//! Persistence is best-effort: backend failures degrade to in-memory
//! operation with a logged warning and are never surfaced to callers.

mod backend;
mod store;
mod types;

pub use backend::{SqliteBackend, StateBackend, StoreError};
pub use store::StateStore;
pub use types::{
    ModificationKind, ModificationRecord, ReprocessStrategy, RetryContext, RetryIteration,
    StateHandle, StepState, StepStatus, StoreSnapshot,
};
