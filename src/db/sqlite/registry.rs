//! Series table registry
//!
//! Maps each (symbol, timeframe) to its physical table. Tables are allocated
//! lazily on first write; the existence cache is reloaded on a fixed interval
//! instead of being checked per query.

use crate::error::{Result, SyncError};
use crate::models::{SeriesKey, Timeframe};
use dashmap::DashMap;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::time::{Duration, Instant};

/// Attempts at claiming a free table name before giving up
const MAX_NAME_ATTEMPTS: usize = 64;

pub struct SeriesRegistry {
    tables: DashMap<SeriesKey, String>,
    last_refresh: Mutex<Option<Instant>>,
    refresh_interval: Duration,
}

impl SeriesRegistry {
    pub fn new(refresh_interval: Duration) -> Self {
        Self {
            tables: DashMap::new(),
            last_refresh: Mutex::new(None),
            refresh_interval,
        }
    }

    /// Reload the cache from the registry table
    pub fn load(&self, conn: &Connection) -> Result<usize> {
        let mut stmt =
            conn.prepare("SELECT symbol, timeframe, table_name FROM series_registry")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        for (symbol, timeframe, table) in rows {
            match timeframe.parse::<Timeframe>() {
                Ok(tf) => {
                    self.tables.insert(SeriesKey::new(symbol, tf), table);
                }
                Err(_) => {
                    tracing::warn!("Skipping registry row {} with unknown timeframe {}", table, timeframe);
                }
            }
        }

        *self.last_refresh.lock() = Some(Instant::now());
        Ok(self.tables.len())
    }

    /// Table for an existing series, or None if it has never been written
    pub fn lookup(&self, conn: &Connection, key: &SeriesKey) -> Result<Option<String>> {
        if let Some(table) = self.tables.get(key) {
            return Ok(Some(table.clone()));
        }
        if self.refresh_due() {
            self.load(conn)?;
            return Ok(self.tables.get(key).map(|t| t.clone()));
        }
        Ok(None)
    }

    /// Table for a series, creating both the registry row and the table if needed
    pub fn resolve_or_create(&self, conn: &mut Connection, key: &SeriesKey) -> Result<String> {
        if let Some(table) = self.tables.get(key) {
            return Ok(table.clone());
        }

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let base = table_name_for(key);
        let mut resolved = None;

        for attempt in 0..MAX_NAME_ATTEMPTS {
            if let Some(existing) = registered_table(&tx, key)? {
                resolved = Some(existing);
                break;
            }
            let candidate = if attempt == 0 {
                base.clone()
            } else {
                format!("{}_{}", base, attempt)
            };
            tx.execute(
                "INSERT OR IGNORE INTO series_registry (symbol, timeframe, table_name)
                 VALUES (?1, ?2, ?3)",
                params![key.symbol, key.timeframe.as_str(), candidate],
            )?;
        }

        let table = resolved.ok_or_else(|| {
            SyncError::Internal(format!("Could not allocate a table for series {}", key))
        })?;
        tx.execute_batch(&create_series_table_sql(&table))?;
        tx.commit()?;

        tracing::info!("Allocated table {} for series {}", table, key);
        self.tables.insert(key.clone(), table.clone());
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    fn refresh_due(&self) -> bool {
        match *self.last_refresh.lock() {
            Some(at) => at.elapsed() >= self.refresh_interval,
            None => true,
        }
    }
}

fn registered_table(conn: &Connection, key: &SeriesKey) -> Result<Option<String>> {
    let table = conn
        .query_row(
            "SELECT table_name FROM series_registry WHERE symbol = ?1 AND timeframe = ?2",
            params![key.symbol, key.timeframe.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(table)
}

/// Deterministic base name: `candles_<symbol>_<timeframe>` with the symbol
/// reduced to lowercase ASCII alphanumerics and underscores
pub fn table_name_for(key: &SeriesKey) -> String {
    let symbol: String = key
        .symbol
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("candles_{}_{}", symbol, key.timeframe.as_str())
}

fn create_series_table_sql(table: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS "{table}" (
            open_time INTEGER PRIMARY KEY,
            symbol TEXT NOT NULL,
            timeframe TEXT NOT NULL,
            open REAL NOT NULL,
            high REAL NOT NULL,
            low REAL NOT NULL,
            close REAL NOT NULL,
            quote_volume REAL NOT NULL,
            base_volume REAL NOT NULL,
            sequence INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        "#
    )
}
