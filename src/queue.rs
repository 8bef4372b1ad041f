//! Durable pending-queue state.
//!
//! The whole continuation of a run is an ordered list of row ids stored as a
//! JSON array under a single property key. Absence of the key means idle.

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};

use crate::rows::RowId;
use crate::storage::Pool;

/// Property key holding the pending list.
pub const QUEUE_KEY: &str = "url_queue";

/// Persistence of the FIFO list of pending rows.
pub trait QueueStore: Send + Sync {
    /// The pending list, `None` when no run is active.
    fn load(&self) -> Result<Option<Vec<RowId>>>;

    /// Replace the pending list.
    fn save(&self, pending: &[RowId]) -> Result<()>;

    /// Drop the pending list. No-op when absent.
    fn delete(&self) -> Result<()>;
}

/// [`QueueStore`] kept in the `properties` table.
#[derive(Clone)]
pub struct SqliteQueueStore {
    pool: Pool,
}

impl SqliteQueueStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

impl QueueStore for SqliteQueueStore {
    fn load(&self) -> Result<Option<Vec<RowId>>> {
        let conn = self.pool.get()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM properties WHERE key = ?1",
                params![QUEUE_KEY],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read queue state")?;

        raw.map(|json| {
            serde_json::from_str::<Vec<RowId>>(&json)
                .with_context(|| format!("Corrupt queue state: {}", json))
        })
        .transpose()
    }

    fn save(&self, pending: &[RowId]) -> Result<()> {
        let json = serde_json::to_string(pending)?;
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO properties (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![QUEUE_KEY, json],
        )
        .context("Failed to save queue state")?;
        Ok(())
    }

    fn delete(&self) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute("DELETE FROM properties WHERE key = ?1", params![QUEUE_KEY])
            .context("Failed to delete queue state")?;
        Ok(())
    }
}
