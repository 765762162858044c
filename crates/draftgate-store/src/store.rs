//! The state store: in-memory authoritative state with best-effort durable
//! backing.
//!
//! Persistence failures never propagate to callers. A failed backend write
//! degrades the store to memory-only operation for that record, with a
//! warning; a missing or corrupt backend record reads as absent.

use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::backend::{StateBackend, StoreError};
use crate::types::{
    ModificationKind, ModificationRecord, ReprocessStrategy, RetryContext, RetryIteration,
    StateHandle, StepState, StepStatus, StoreSnapshot,
};

struct Inner {
    steps: BTreeMap<String, StepState>,
    locked_items: BTreeSet<String>,
    checkpoints: BTreeMap<String, StoreSnapshot>,
}

/// Keyed storage for per-step state and retry context.
///
/// Owns the shared locked-item set and the per-step score history. One
/// instance is created by the caller and handed to each runner; there is no
/// process-wide singleton.
pub struct StateStore {
    inner: Mutex<Inner>,
    backend: Option<Box<dyn StateBackend>>,
}

impl StateStore {
    /// Memory-only store, no durable backing.
    pub fn in_memory() -> Self {
        Self::new(None)
    }

    /// Store with a durable backend. Existing records are loaded lazily.
    pub fn with_backend(backend: Box<dyn StateBackend>) -> Self {
        Self::new(Some(backend))
    }

    fn new(backend: Option<Box<dyn StateBackend>>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                steps: BTreeMap::new(),
                locked_items: BTreeSet::new(),
                checkpoints: BTreeMap::new(),
            }),
            backend,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("state store lock poisoned")
    }

    /// Best-effort write-through to the backend.
    fn persist(&self, state: &StepState) {
        if let Some(backend) = &self.backend {
            if let Err(e) = backend.save_step(state) {
                warn!(step = %state.step_id, error = %e, "persistence degraded to memory-only");
            }
        }
    }

    /// Pull a record from the backend into memory if it is not cached yet.
    /// Missing and corrupt records both read as absent.
    fn hydrate(&self, inner: &mut Inner, step_id: &str) {
        if inner.steps.contains_key(step_id) {
            return;
        }
        let Some(backend) = &self.backend else {
            return;
        };
        match backend.load_step(step_id) {
            Ok(Some(state)) => {
                inner.steps.insert(step_id.to_string(), state);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(step = step_id, error = %e, "unreadable persisted record treated as absent");
            }
        }
    }

    /// Persist a step's state. Never fails the caller.
    pub fn save_state(
        &self,
        step_id: &str,
        payload: Value,
        status: StepStatus,
        metadata: BTreeMap<String, String>,
    ) -> StateHandle {
        let mut inner = self.lock();
        self.hydrate(&mut inner, step_id);

        let retry = inner.steps.get(step_id).and_then(|s| s.retry.clone());
        let state = StepState {
            step_id: step_id.to_string(),
            timestamp: Utc::now(),
            status,
            payload,
            metadata,
            retry,
        };
        self.persist(&state);
        inner.steps.insert(step_id.to_string(), state);

        StateHandle::new(step_id)
    }

    /// Load a step's payload. Missing and corrupt records are both `None`.
    pub fn load_state(&self, step_id: &str) -> Option<Value> {
        let mut inner = self.lock();
        self.hydrate(&mut inner, step_id);
        inner.steps.get(step_id).map(|s| s.payload.clone())
    }

    /// Full step record, for inspection.
    pub fn get_step(&self, step_id: &str) -> Option<StepState> {
        let mut inner = self.lock();
        self.hydrate(&mut inner, step_id);
        inner.steps.get(step_id).cloned()
    }

    /// All known steps, memory taking precedence over the backend.
    pub fn list_steps(&self) -> Vec<StepState> {
        let inner = self.lock();
        let mut by_id: BTreeMap<String, StepState> = BTreeMap::new();

        if let Some(backend) = &self.backend {
            match backend.list_steps() {
                Ok(steps) => {
                    for s in steps {
                        by_id.insert(s.step_id.clone(), s);
                    }
                }
                Err(e) => warn!(error = %e, "backend listing unavailable"),
            }
        }
        for (id, s) in inner.steps.iter() {
            by_id.insert(id.clone(), s.clone());
        }
        by_id.into_values().collect()
    }

    /// Start a fresh retry context for a step. Replaces any prior context
    /// unless the step is completed (frozen until an explicit reset).
    pub fn init_retry_context(&self, step_id: &str, target_score: f64, max_iterations: usize) {
        self.with_step(step_id, |state| {
            state.retry = Some(RetryContext::new(state.step_id.clone(), target_score, max_iterations));
        });
    }

    pub fn get_retry_context(&self, step_id: &str) -> Option<RetryContext> {
        let mut inner = self.lock();
        self.hydrate(&mut inner, step_id);
        inner.steps.get(step_id).and_then(|s| s.retry.clone())
    }

    /// Advance the context: bump the iteration counter (when asked), replace
    /// the failing-category list, and snapshot the current locked set.
    pub fn set_retry_context(
        &self,
        step_id: &str,
        failing_categories: Vec<String>,
        increment_iteration: bool,
    ) {
        let mut inner = self.lock();
        self.hydrate(&mut inner, step_id);
        let locked = inner.locked_items.clone();
        let Some(state) = inner.steps.get_mut(step_id) else {
            debug!(step = step_id, "set_retry_context on unknown step ignored");
            return;
        };
        if state.status == StepStatus::Completed {
            debug!(step = step_id, "retry context frozen; update ignored");
            return;
        }
        let Some(ctx) = state.retry.as_mut() else {
            debug!(step = step_id, "set_retry_context without context ignored");
            return;
        };
        if increment_iteration {
            ctx.iteration_count += 1;
        }
        ctx.failing_categories = failing_categories;
        ctx.locked_items = locked;
        let snapshot = state.clone();
        drop(inner);
        self.persist(&snapshot);
    }

    pub fn set_strategy(&self, step_id: &str, strategy: ReprocessStrategy) {
        self.with_context(step_id, |ctx| ctx.strategy = Some(strategy));
    }

    pub fn set_category_weights(&self, step_id: &str, weights: BTreeMap<String, f64>) {
        self.with_context(step_id, |ctx| ctx.category_weights = weights);
    }

    /// Add items to the shared locked set. Re-locking an id is a no-op.
    pub fn lock_items<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut inner = self.lock();
        for id in ids {
            inner.locked_items.insert(id.into());
        }
    }

    /// Remove specific items from the locked set.
    pub fn unlock_items<'a, I>(&self, ids: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut inner = self.lock();
        for id in ids {
            inner.locked_items.remove(id);
        }
    }

    pub fn unlock_all(&self) {
        self.lock().locked_items.clear();
    }

    pub fn locked_items(&self) -> BTreeSet<String> {
        self.lock().locked_items.clone()
    }

    /// Append a score to the step's history.
    pub fn record_score(&self, step_id: &str, value: f64) {
        self.with_context(step_id, |ctx| ctx.score_history.push(value));
    }

    /// Append an item-level modification entry.
    pub fn record_modification(
        &self,
        step_id: &str,
        item_id: &str,
        kind: ModificationKind,
        details: BTreeMap<String, String>,
    ) {
        self.with_context(step_id, |ctx| {
            ctx.modifications.push(ModificationRecord {
                item_id: item_id.to_string(),
                kind,
                details,
                timestamp: Utc::now(),
            });
        });
    }

    /// Append a completed iteration record.
    pub fn push_iteration(&self, step_id: &str, iteration: RetryIteration) {
        self.with_context(step_id, |ctx| ctx.iterations.push(iteration));
    }

    /// Whether another iteration is worth running.
    ///
    /// False when the iteration budget is spent, when no failing categories
    /// remain, or when the last two scores are non-increasing. True
    /// otherwise, including when no context exists yet.
    pub fn should_retry(&self, step_id: &str) -> bool {
        let Some(ctx) = self.get_retry_context(step_id) else {
            return true;
        };
        if ctx.budget_spent() {
            return false;
        }
        if ctx.failing_categories.is_empty() {
            return false;
        }
        let n = ctx.score_history.len();
        if n >= 2 && ctx.score_history[n - 1] <= ctx.score_history[n - 2] {
            return false;
        }
        true
    }

    /// Snapshot the whole store (steps and locked set) under a name.
    pub fn create_checkpoint(&self, name: &str) {
        let mut inner = self.lock();
        let snapshot = StoreSnapshot {
            steps: inner.steps.clone(),
            locked_items: inner.locked_items.clone(),
        };
        if let Some(backend) = &self.backend {
            if let Err(e) = backend.save_checkpoint(name, &snapshot) {
                warn!(checkpoint = name, error = %e, "checkpoint kept in memory only");
            }
        }
        inner.checkpoints.insert(name.to_string(), snapshot);
    }

    /// Replace the entire store contents from a named checkpoint.
    /// Returns false when the checkpoint does not exist.
    pub fn restore_checkpoint(&self, name: &str) -> bool {
        let mut inner = self.lock();
        let snapshot = match inner.checkpoints.get(name).cloned() {
            Some(s) => Some(s),
            None => match &self.backend {
                Some(backend) => match backend.load_checkpoint(name) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(checkpoint = name, error = %e, "checkpoint unreadable");
                        None
                    }
                },
                None => None,
            },
        };

        let Some(snapshot) = snapshot else {
            return false;
        };
        inner.steps = snapshot.steps.clone();
        inner.locked_items = snapshot.locked_items.clone();
        drop(inner);

        if let Some(backend) = &self.backend {
            for state in snapshot.steps.values() {
                if let Err(e) = backend.save_step(state) {
                    warn!(step = %state.step_id, error = %e, "restored record not re-persisted");
                }
            }
        }
        true
    }

    /// Remove one step's record and context.
    pub fn clear_step(&self, step_id: &str) {
        let mut inner = self.lock();
        inner.steps.remove(step_id);
        if let Some(backend) = &self.backend {
            if let Err(e) = backend.delete_step(step_id) {
                warn!(step = step_id, error = %e, "backend delete failed");
            }
        }
    }

    /// Remove everything, including the locked set.
    pub fn clear_all(&self) {
        let mut inner = self.lock();
        inner.steps.clear();
        inner.locked_items.clear();
        if let Some(backend) = &self.backend {
            if let Err(e) = backend.clear() {
                warn!(error = %e, "backend clear failed");
            }
        }
    }

    /// Unfreeze a completed step: drop its context and mark it pending.
    pub fn reset_context(&self, step_id: &str) {
        let mut inner = self.lock();
        self.hydrate(&mut inner, step_id);
        if let Some(state) = inner.steps.get_mut(step_id) {
            state.retry = None;
            state.status = StepStatus::Pending;
            state.timestamp = Utc::now();
            let snapshot = state.clone();
            drop(inner);
            self.persist(&snapshot);
        }
    }

    /// Run a closure against a step record, creating a pending one if absent,
    /// then write through. Frozen (completed) steps are left untouched.
    fn with_step<F>(&self, step_id: &str, f: F)
    where
        F: FnOnce(&mut StepState),
    {
        let mut inner = self.lock();
        self.hydrate(&mut inner, step_id);
        let state = inner
            .steps
            .entry(step_id.to_string())
            .or_insert_with(|| StepState {
                step_id: step_id.to_string(),
                timestamp: Utc::now(),
                status: StepStatus::Pending,
                payload: Value::Null,
                metadata: BTreeMap::new(),
                retry: None,
            });
        if state.status == StepStatus::Completed {
            debug!(step = step_id, "completed step is frozen; mutation ignored");
            return;
        }
        f(state);
        state.timestamp = Utc::now();
        let snapshot = state.clone();
        drop(inner);
        self.persist(&snapshot);
    }

    fn with_context<F>(&self, step_id: &str, f: F)
    where
        F: FnOnce(&mut RetryContext),
    {
        self.with_step(step_id, |state| {
            if let Some(ctx) = state.retry.as_mut() {
                f(ctx);
            } else {
                debug!(step = %state.step_id, "context mutation without retry context ignored");
            }
        });
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_save_load_round_trip() {
        let store = StateStore::in_memory();
        let payload = json!({"items": [{"id": "a", "content": "hello"}]});
        store.save_state("draft", payload.clone(), StepStatus::Running, BTreeMap::new());
        assert_eq!(store.load_state("draft"), Some(payload));
    }

    #[test]
    fn test_missing_state_is_absent() {
        let store = StateStore::in_memory();
        assert!(store.load_state("nope").is_none());
    }

    #[test]
    fn test_lock_is_idempotent_and_grows() {
        let store = StateStore::in_memory();
        store.lock_items(["a", "b"]);
        store.lock_items(["b", "c"]);
        let locked = store.locked_items();
        assert_eq!(locked.len(), 3);

        store.unlock_items(["b"]);
        assert_eq!(store.locked_items().len(), 2);
        store.unlock_all();
        assert!(store.locked_items().is_empty());
    }

    #[test]
    fn test_should_retry_no_context() {
        let store = StateStore::in_memory();
        assert!(store.should_retry("fresh"));
    }

    #[test]
    fn test_should_retry_budget_spent() {
        let store = StateStore::in_memory();
        store.init_retry_context("s", 90.0, 2);
        store.set_retry_context("s", vec!["formatting".into()], true);
        store.record_score("s", 50.0);
        store.set_retry_context("s", vec!["formatting".into()], true);
        store.record_score("s", 60.0);
        assert!(!store.should_retry("s"));
    }

    #[test]
    fn test_should_retry_non_increasing_scores() {
        let store = StateStore::in_memory();
        store.init_retry_context("s", 90.0, 10);
        store.set_retry_context("s", vec!["formatting".into()], true);
        store.record_score("s", 70.0);
        store.set_retry_context("s", vec!["formatting".into()], true);
        store.record_score("s", 69.0);
        assert!(!store.should_retry("s"));
    }

    #[test]
    fn test_should_retry_improving() {
        let store = StateStore::in_memory();
        store.init_retry_context("s", 90.0, 10);
        store.set_retry_context("s", vec!["formatting".into()], true);
        store.record_score("s", 70.0);
        store.set_retry_context("s", vec!["formatting".into()], true);
        store.record_score("s", 80.0);
        assert!(store.should_retry("s"));
    }

    #[test]
    fn test_should_retry_no_failing_categories() {
        let store = StateStore::in_memory();
        store.init_retry_context("s", 90.0, 10);
        store.set_retry_context("s", vec![], true);
        store.record_score("s", 70.0);
        assert!(!store.should_retry("s"));
    }

    #[test]
    fn test_completed_step_context_is_frozen() {
        let store = StateStore::in_memory();
        store.init_retry_context("s", 90.0, 5);
        store.set_retry_context("s", vec!["layout".into()], true);
        store.record_score("s", 70.0);
        store.save_state("s", json!({}), StepStatus::Completed, BTreeMap::new());

        store.record_score("s", 95.0);
        store.set_retry_context("s", vec!["other".into()], true);

        let ctx = store.get_retry_context("s").unwrap();
        assert_eq!(ctx.score_history, vec![70.0]);
        assert_eq!(ctx.iteration_count, 1);
        assert_eq!(ctx.failing_categories, vec!["layout".to_string()]);

        store.reset_context("s");
        assert!(store.get_retry_context("s").is_none());
        assert_eq!(store.get_step("s").unwrap().status, StepStatus::Pending);
    }

    #[test]
    fn test_context_snapshot_includes_locked_set() {
        let store = StateStore::in_memory();
        store.init_retry_context("s", 90.0, 5);
        store.lock_items(["a", "b"]);
        store.set_retry_context("s", vec!["formatting".into()], true);

        let ctx = store.get_retry_context("s").unwrap();
        assert!(ctx.locked_items.contains("a"));
        assert!(ctx.locked_items.contains("b"));
    }

    #[test]
    fn test_modifications_and_weights_accumulate() {
        let store = StateStore::in_memory();
        store.init_retry_context("s", 90.0, 5);
        store.record_modification(
            "s",
            "item-3",
            ModificationKind::Rewrite,
            BTreeMap::from([("category".to_string(), "clarity".to_string())]),
        );
        store.record_modification("s", "item-4", ModificationKind::Remove, BTreeMap::new());
        store.set_category_weights("s", BTreeMap::from([("clarity".to_string(), 2.0)]));

        let ctx = store.get_retry_context("s").unwrap();
        assert_eq!(ctx.modifications.len(), 2);
        assert_eq!(ctx.modifications[0].item_id, "item-3");
        assert_eq!(ctx.modifications[0].kind, ModificationKind::Rewrite);
        assert_eq!(ctx.category_weights.get("clarity"), Some(&2.0));
    }

    #[test]
    fn test_checkpoint_restore() {
        let store = StateStore::in_memory();
        store.save_state("a", json!(1), StepStatus::Running, BTreeMap::new());
        store.lock_items(["x"]);
        store.create_checkpoint("before");

        store.save_state("a", json!(2), StepStatus::Failed, BTreeMap::new());
        store.lock_items(["y"]);

        assert!(store.restore_checkpoint("before"));
        assert_eq!(store.load_state("a"), Some(json!(1)));
        assert_eq!(store.locked_items().len(), 1);

        assert!(!store.restore_checkpoint("never-made"));
    }

    #[test]
    fn test_clear_step_and_all() {
        let store = StateStore::in_memory();
        store.save_state("a", json!(1), StepStatus::Running, BTreeMap::new());
        store.save_state("b", json!(2), StepStatus::Running, BTreeMap::new());
        store.clear_step("a");
        assert!(store.load_state("a").is_none());
        assert!(store.load_state("b").is_some());
        store.clear_all();
        assert!(store.load_state("b").is_none());
    }

    #[test]
    fn test_consecutive_context_reads_identical() {
        let store = StateStore::in_memory();
        store.init_retry_context("s", 90.0, 5);
        store.set_retry_context("s", vec!["clarity".into()], true);
        store.record_score("s", 77.0);

        let first = store.get_retry_context("s").unwrap();
        let second = store.get_retry_context("s").unwrap();
        assert_eq!(
            serde_json::to_value(&first).unwrap(),
            serde_json::to_value(&second).unwrap()
        );
    }
}
