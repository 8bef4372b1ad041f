//! Durable one-shot triggers.
//!
//! A trigger names a handler and a firing time. Triggers live in SQLite so a
//! run resumes after the worker process restarts; the worker loop in
//! [`engine`] claims due triggers and invokes the handler.

pub mod engine;

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::params;
use rusqlite::types::Type;
use serde::Serialize;
use uuid::Uuid;

use crate::storage::Pool;

pub use self::engine::run_worker;

/// Handler name of the queue-advance step.
pub const STEP_HANDLER: &str = "process_queue";

/// A scheduled single-shot invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Trigger {
    pub id: Uuid,
    pub handler: String,
    pub fire_at: DateTime<Utc>,
}

/// Arranges future invocations of named handlers.
pub trait TriggerScheduler: Send + Sync {
    /// Schedule `handler` to fire once after `delay`.
    fn after(&self, delay: Duration, handler: &str) -> Result<Trigger>;

    /// Remove every outstanding trigger for `handler`. Returns how many were removed.
    fn cancel_all(&self, handler: &str) -> Result<usize>;

    /// Outstanding triggers for `handler`, earliest first.
    fn pending(&self, handler: &str) -> Result<Vec<Trigger>>;

    /// Claim (remove and return) triggers for `handler` due at `now`.
    fn take_due(&self, handler: &str, now: DateTime<Utc>) -> Result<Vec<Trigger>>;
}

/// A scheduler that persists triggers in SQLite.
#[derive(Clone)]
pub struct SqliteScheduler {
    pool: Pool,
}

impl SqliteScheduler {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    fn map_trigger(row: &rusqlite::Row<'_>) -> rusqlite::Result<Trigger> {
        let id: String = row.get(0)?;
        let fire_at_ms: i64 = row.get(2)?;
        let id = Uuid::parse_str(&id)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;
        let fire_at = Utc
            .timestamp_millis_opt(fire_at_ms)
            .single()
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(2, fire_at_ms))?;
        Ok(Trigger {
            id,
            handler: row.get(1)?,
            fire_at,
        })
    }
}

impl TriggerScheduler for SqliteScheduler {
    fn after(&self, delay: Duration, handler: &str) -> Result<Trigger> {
        let delay = chrono::Duration::from_std(delay)
            .with_context(|| format!("Trigger delay out of range: {:?}", delay))?;
        let trigger = Trigger {
            id: Uuid::new_v4(),
            handler: handler.to_string(),
            fire_at: Utc::now() + delay,
        };

        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO triggers (id, handler, fire_at_ms) VALUES (?1, ?2, ?3)",
            params![
                trigger.id.to_string(),
                trigger.handler,
                trigger.fire_at.timestamp_millis()
            ],
        )
        .context("Failed to insert trigger")?;

        tracing::debug!(handler = %handler, fire_at = %trigger.fire_at.to_rfc3339(), "Trigger armed");
        Ok(trigger)
    }

    fn cancel_all(&self, handler: &str) -> Result<usize> {
        let conn = self.pool.get()?;
        let removed = conn
            .execute("DELETE FROM triggers WHERE handler = ?1", params![handler])
            .context("Failed to delete triggers")?;
        Ok(removed)
    }

    fn pending(&self, handler: &str) -> Result<Vec<Trigger>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, handler, fire_at_ms FROM triggers WHERE handler = ?1 ORDER BY fire_at_ms",
        )?;
        let triggers = stmt
            .query_map(params![handler], Self::map_trigger)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(triggers)
    }

    fn take_due(&self, handler: &str, now: DateTime<Utc>) -> Result<Vec<Trigger>> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        let due = {
            let mut stmt = tx.prepare(
                "SELECT id, handler, fire_at_ms FROM triggers
                 WHERE handler = ?1 AND fire_at_ms <= ?2 ORDER BY fire_at_ms",
            )?;
            // Bound first so the row iterator drops before `stmt`
            let rows = stmt
                .query_map(params![handler, now.timestamp_millis()], Self::map_trigger)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        if !due.is_empty() {
            tx.execute(
                "DELETE FROM triggers WHERE handler = ?1 AND fire_at_ms <= ?2",
                params![handler, now.timestamp_millis()],
            )?;
        }

        tx.commit().context("Failed to claim due triggers")?;
        Ok(due)
    }
}
