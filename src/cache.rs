//! Result cache with per-entry expiration.
//!
//! Keeps successful per-profile results around so a restarted run does not
//! spend API quota on URLs it has already measured.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::storage::Pool;

/// Key/value store whose entries expire.
pub trait ResultCache: Send + Sync {
    /// The stored value, `None` if absent or expired.
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Remove every entry. Returns how many were removed.
    fn clear(&self) -> Result<usize>;
}

/// [`ResultCache`] stored in the `result_cache` table.
#[derive(Clone)]
pub struct SqliteCache {
    pool: Pool,
}

impl SqliteCache {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Drop entries that have already expired.
    pub fn purge_expired(&self) -> Result<usize> {
        let conn = self.pool.get()?;
        let removed = conn.execute(
            "DELETE FROM result_cache WHERE expires_at_ms <= ?1",
            params![Utc::now().timestamp_millis()],
        )?;
        Ok(removed)
    }
}

impl ResultCache for SqliteCache {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.pool.get()?;
        let entry: Option<(String, i64)> = conn
            .query_row(
                "SELECT value, expires_at_ms FROM result_cache WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to read cache entry")?;

        match entry {
            Some((value, expires_at_ms)) if expires_at_ms > Utc::now().timestamp_millis() => {
                Ok(Some(value))
            }
            Some(_) => {
                conn.execute("DELETE FROM result_cache WHERE key = ?1", params![key])?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at_ms = Utc::now().timestamp_millis().saturating_add(ttl_ms);

        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO result_cache (key, value, expires_at_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at_ms = excluded.expires_at_ms",
            params![key, value, expires_at_ms],
        )
        .context("Failed to write cache entry")?;
        Ok(())
    }

    fn clear(&self) -> Result<usize> {
        let conn = self.pool.get()?;
        let removed = conn
            .execute("DELETE FROM result_cache", [])
            .context("Failed to clear cache")?;
        Ok(removed)
    }
}
