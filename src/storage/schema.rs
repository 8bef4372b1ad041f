//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

pub const SCHEMA_VERSION: i64 = 1;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS rows (
            id INTEGER PRIMARY KEY,
            url TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT '',
            last_checked TEXT NOT NULL DEFAULT '',
            mobile_perf TEXT NOT NULL DEFAULT '',
            mobile_fcp TEXT NOT NULL DEFAULT '',
            mobile_si TEXT NOT NULL DEFAULT '',
            mobile_lcp TEXT NOT NULL DEFAULT '',
            mobile_tbt TEXT NOT NULL DEFAULT '',
            mobile_cls TEXT NOT NULL DEFAULT '',
            desktop_perf TEXT NOT NULL DEFAULT '',
            desktop_fcp TEXT NOT NULL DEFAULT '',
            desktop_si TEXT NOT NULL DEFAULT '',
            desktop_lcp TEXT NOT NULL DEFAULT '',
            desktop_tbt TEXT NOT NULL DEFAULT '',
            desktop_cls TEXT NOT NULL DEFAULT '',
            mobile_issues TEXT NOT NULL DEFAULT '',
            desktop_issues TEXT NOT NULL DEFAULT '',
            report_link TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS properties (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS triggers (
            id TEXT PRIMARY KEY,
            handler TEXT NOT NULL,
            fire_at_ms INTEGER NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS result_cache (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            expires_at_ms INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_triggers_handler_fire ON triggers(handler, fire_at_ms);
        CREATE INDEX IF NOT EXISTS idx_result_cache_expires ON result_cache(expires_at_ms);",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}
