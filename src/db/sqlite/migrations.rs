//! SQLite migrations for the engine's bookkeeping tables.
//!
//! Per-series candle tables are not migrated here; the registry creates them
//! on first write.

use crate::error::Result;
use rusqlite::Connection;

/// Run all database migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    // Only takes effect before the first table exists
    conn.execute_batch("PRAGMA auto_vacuum = INCREMENTAL;")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    run_migration(conn, "001_series_registry", CREATE_SERIES_REGISTRY_TABLE)?;
    run_migration(conn, "002_sync_log", CREATE_SYNC_LOG_TABLE)?;

    tracing::info!("Database migrations completed");
    Ok(())
}

fn run_migration(conn: &Connection, name: &str, sql: &str) -> Result<()> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM migrations WHERE name = ?)",
        [name],
        |row| row.get(0),
    )?;

    if !exists {
        tracing::info!("Running migration: {}", name);
        conn.execute_batch(sql)?;
        conn.execute("INSERT INTO migrations (name) VALUES (?)", [name])?;
    }

    Ok(())
}

const CREATE_SERIES_REGISTRY_TABLE: &str = r#"
CREATE TABLE series_registry (
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    table_name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (symbol, timeframe)
);
"#;

const CREATE_SYNC_LOG_TABLE: &str = r#"
CREATE TABLE sync_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    range_start INTEGER NOT NULL,
    range_end INTEGER NOT NULL,
    status TEXT NOT NULL,
    upstream_calls INTEGER NOT NULL DEFAULT 0,
    served_from_store INTEGER NOT NULL DEFAULT 0,
    failed_ranges TEXT,
    cancelled INTEGER NOT NULL DEFAULT 0,
    finished_at TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_sync_log_series ON sync_log(symbol, timeframe);
"#;
