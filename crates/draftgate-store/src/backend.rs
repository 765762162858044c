//! Persistence backends for the state store.
//!
//! The backend seam distinguishes "record not found" (`Ok(None)`) from
//! "store unavailable" and "record corrupt" (`Err(...)`), so the store can
//! decide how to degrade instead of guessing from a caught error.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

use crate::types::{StepState, StoreSnapshot};

/// Errors surfaced by a persistence backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt record for key '{key}': {message}")]
    Corrupt { key: String, message: String },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Keyed storage of serialized step records and named checkpoints.
///
/// Backends need not support cross-key transactions; the store serializes
/// access itself.
pub trait StateBackend: Send + Sync {
    fn save_step(&self, state: &StepState) -> Result<(), StoreError>;
    fn load_step(&self, step_id: &str) -> Result<Option<StepState>, StoreError>;
    fn delete_step(&self, step_id: &str) -> Result<(), StoreError>;
    fn list_steps(&self) -> Result<Vec<StepState>, StoreError>;
    fn save_checkpoint(&self, name: &str, snapshot: &StoreSnapshot) -> Result<(), StoreError>;
    fn load_checkpoint(&self, name: &str) -> Result<Option<StoreSnapshot>, StoreError>;
    fn clear(&self) -> Result<(), StoreError>;
}

/// SQLite-backed implementation. Records are stored as JSON blobs keyed by
/// step id; checkpoints as whole-store JSON snapshots keyed by name.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open or create a database at the default location
    /// (`~/.local/share/draftgate/draftgate.db`).
    pub fn open() -> Result<Self, StoreError> {
        let db_path = Self::default_path();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        Self::open_at(&db_path)
    }

    /// Open or create a database at a specific path.
    pub fn open_at(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Get the default database path.
    pub fn default_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("draftgate")
            .join("draftgate.db")
    }

    fn init_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS steps (
                step_id TEXT PRIMARY KEY,
                record TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS checkpoints (
                name TEXT PRIMARY KEY,
                snapshot TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_steps_updated_at ON steps(updated_at DESC);
            "#,
        )
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection lock poisoned".to_string()))
    }
}

impl StateBackend for SqliteBackend {
    fn save_step(&self, state: &StepState) -> Result<(), StoreError> {
        let record = serde_json::to_string(state)
            .map_err(|e| StoreError::Unavailable(format!("serialize failed: {e}")))?;
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO steps (step_id, record, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(step_id) DO UPDATE SET
                record = excluded.record,
                updated_at = excluded.updated_at
            "#,
            params![state.step_id, record, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn load_step(&self, step_id: &str) -> Result<Option<StepState>, StoreError> {
        let conn = self.lock()?;
        let record: Option<String> = conn
            .query_row(
                "SELECT record FROM steps WHERE step_id = ?1",
                params![step_id],
                |row| row.get(0),
            )
            .optional()?;

        match record {
            None => Ok(None),
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| StoreError::Corrupt {
                    key: step_id.to_string(),
                    message: e.to_string(),
                }),
        }
    }

    fn delete_step(&self, step_id: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM steps WHERE step_id = ?1", params![step_id])?;
        Ok(())
    }

    fn list_steps(&self) -> Result<Vec<StepState>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT step_id, record FROM steps ORDER BY updated_at DESC")?;
        let rows = stmt.query_map([], |row| {
            let step_id: String = row.get(0)?;
            let record: String = row.get(1)?;
            Ok((step_id, record))
        })?;

        let mut steps = Vec::new();
        for row in rows {
            let (step_id, json) = row?;
            let state =
                serde_json::from_str(&json).map_err(|e| StoreError::Corrupt {
                    key: step_id,
                    message: e.to_string(),
                })?;
            steps.push(state);
        }
        Ok(steps)
    }

    fn save_checkpoint(&self, name: &str, snapshot: &StoreSnapshot) -> Result<(), StoreError> {
        let blob = serde_json::to_string(snapshot)
            .map_err(|e| StoreError::Unavailable(format!("serialize failed: {e}")))?;
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO checkpoints (name, snapshot, created_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(name) DO UPDATE SET
                snapshot = excluded.snapshot,
                created_at = excluded.created_at
            "#,
            params![name, blob, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn load_checkpoint(&self, name: &str) -> Result<Option<StoreSnapshot>, StoreError> {
        let conn = self.lock()?;
        let blob: Option<String> = conn
            .query_row(
                "SELECT snapshot FROM checkpoints WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;

        match blob {
            None => Ok(None),
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| StoreError::Corrupt {
                    key: name.to_string(),
                    message: e.to_string(),
                }),
        }
    }

    fn clear(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM steps", [])?;
        Ok(())
    }
}
