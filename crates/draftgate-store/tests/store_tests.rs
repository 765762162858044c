use std::collections::BTreeMap;

use draftgate_store::{
    SqliteBackend, StateBackend, StateStore, StepState, StepStatus, StoreError, StoreSnapshot,
};
use serde_json::json;
use tempfile::TempDir;

fn sqlite_store(dir: &TempDir) -> StateStore {
    let backend = SqliteBackend::open_at(&dir.path().join("state.db")).unwrap();
    StateStore::with_backend(Box::new(backend))
}

// ============================================================
// Durability
// ============================================================

#[test]
fn test_state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let payload = json!({"items": [{"id": "p1", "content": "first paragraph"}]});

    {
        let store = sqlite_store(&dir);
        store.save_state(
            "body",
            payload.clone(),
            StepStatus::Running,
            BTreeMap::from([("section".to_string(), "main".to_string())]),
        );
        store.init_retry_context("body", 90.0, 5);
        store.set_retry_context("body", vec!["formatting".into()], true);
        store.record_score("body", 72.5);
    }

    let store = sqlite_store(&dir);
    assert_eq!(store.load_state("body"), Some(payload));

    let ctx = store.get_retry_context("body").unwrap();
    assert_eq!(ctx.iteration_count, 1);
    assert_eq!(ctx.score_history, vec![72.5]);
    assert_eq!(ctx.failing_categories, vec!["formatting".to_string()]);
}

#[test]
fn test_checkpoint_survives_reopen() {
    let dir = TempDir::new().unwrap();

    {
        let store = sqlite_store(&dir);
        store.save_state("intro", json!("v1"), StepStatus::Completed, BTreeMap::new());
        store.create_checkpoint("published");
        store.save_state("intro", json!("v2"), StepStatus::Running, BTreeMap::new());
    }

    let store = sqlite_store(&dir);
    assert!(store.restore_checkpoint("published"));
    assert_eq!(store.load_state("intro"), Some(json!("v1")));
}

#[test]
fn test_corrupt_record_reads_as_absent() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("state.db");

    {
        let store = sqlite_store(&dir);
        store.save_state("fine", json!(1), StepStatus::Running, BTreeMap::new());
    }
    {
        let conn = rusqlite::Connection::open(&db_path).unwrap();
        conn.execute(
            "UPDATE steps SET record = '{broken' WHERE step_id = 'fine'",
            [],
        )
        .unwrap();
    }

    let backend = SqliteBackend::open_at(&db_path).unwrap();
    let store = StateStore::with_backend(Box::new(backend));
    assert!(store.load_state("fine").is_none());
}

// ============================================================
// Degraded persistence
// ============================================================

/// A backend whose writes always fail, to exercise memory-only degrade.
struct BrokenBackend;

impl StateBackend for BrokenBackend {
    fn save_step(&self, _: &StepState) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("disk full".into()))
    }
    fn load_step(&self, _: &str) -> Result<Option<StepState>, StoreError> {
        Err(StoreError::Unavailable("disk full".into()))
    }
    fn delete_step(&self, _: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("disk full".into()))
    }
    fn list_steps(&self) -> Result<Vec<StepState>, StoreError> {
        Err(StoreError::Unavailable("disk full".into()))
    }
    fn save_checkpoint(&self, _: &str, _: &StoreSnapshot) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("disk full".into()))
    }
    fn load_checkpoint(&self, _: &str) -> Result<Option<StoreSnapshot>, StoreError> {
        Err(StoreError::Unavailable("disk full".into()))
    }
    fn clear(&self) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("disk full".into()))
    }
}

#[test]
fn test_broken_backend_never_fails_the_caller() {
    let store = StateStore::with_backend(Box::new(BrokenBackend));

    let handle = store.save_state("draft", json!({"ok": true}), StepStatus::Running, BTreeMap::new());
    assert_eq!(handle.step_id, "draft");

    // Memory still serves reads and context updates.
    assert_eq!(store.load_state("draft"), Some(json!({"ok": true})));
    store.init_retry_context("draft", 85.0, 3);
    store.record_score("draft", 60.0);
    assert_eq!(
        store.get_retry_context("draft").unwrap().score_history,
        vec![60.0]
    );

    // Checkpoints stay available in memory too.
    store.create_checkpoint("cp");
    store.save_state("draft", json!({"ok": false}), StepStatus::Failed, BTreeMap::new());
    assert!(store.restore_checkpoint("cp"));
    assert_eq!(store.load_state("draft"), Some(json!({"ok": true})));
}

// ============================================================
// Listing
// ============================================================

#[test]
fn test_list_steps_merges_backend_and_memory() {
    let dir = TempDir::new().unwrap();

    {
        let store = sqlite_store(&dir);
        store.save_state("one", json!(1), StepStatus::Completed, BTreeMap::new());
    }

    let store = sqlite_store(&dir);
    store.save_state("two", json!(2), StepStatus::Running, BTreeMap::new());

    let steps = store.list_steps();
    let mut ids: Vec<_> = steps.iter().map(|s| s.step_id.as_str()).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec!["one", "two"]);
}
