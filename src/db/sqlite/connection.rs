//! SQLite connection pool

use crate::config::StoreConfig;
use crate::error::Result;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Create the shared connection pool.
///
/// Every pooled connection runs in WAL mode so readers keep working while a
/// batch commit holds the write lock.
pub fn create_pool(config: &StoreConfig) -> Result<DbPool> {
    let busy_timeout_ms = config.busy_timeout_ms;
    let manager = SqliteConnectionManager::file(&config.db_path).with_init(move |conn| {
        conn.execute_batch(&format!(
            "PRAGMA busy_timeout={};
             PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA temp_store=MEMORY;",
            busy_timeout_ms
        ))
    });

    let pool = Pool::builder()
        .max_size(config.pool_size)
        .build(manager)?;

    tracing::debug!(
        "Opened pool of {} connections for {:?}",
        config.pool_size,
        config.db_path
    );
    Ok(pool)
}
