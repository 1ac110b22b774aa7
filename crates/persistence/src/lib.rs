//! Persistence layer for Pair Scout
//!
//! SQLite storage for OHLCV candles, the tradable symbol universe, completed
//! backtest runs, the watchlist and saved baskets. File databases run in WAL
//! mode; every connection enforces foreign keys.

pub mod repository;
pub mod schema;

use std::path::Path;
use std::time::Duration;

pub use sqlx::sqlite::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use thiserror::Error;
use tracing::info;

use repository::{BacktestRepository, BasketRepository, CandleRepository, WatchlistRepository};

const FILE_CONNECTIONS: u32 = 5;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Cannot open database at {location}: {reason}")]
    Open { location: String, reason: String },

    #[error("Schema statement failed: {0}")]
    Schema(String),

    /// Rejected before reaching SQLite
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type DbResult<T> = Result<T, DbError>;

/// Pooled handle on the Pair Scout database
pub struct Database {
    pool: SqlitePool,
    location: String,
}

impl Database {
    /// Open the database file, creating it and its directory when missing
    pub async fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref();
        let location = path.display().to_string();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| DbError::Open {
                location: location.clone(),
                reason: e.to_string(),
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        Self::connect(options, FILE_CONNECTIONS, location).await
    }

    /// Private in-memory database; a single connection keeps it alive
    pub async fn in_memory() -> DbResult<Self> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);
        Self::connect(options, 1, ":memory:".to_string()).await
    }

    async fn connect(options: SqliteConnectOptions, connections: u32, location: String) -> DbResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(connections)
            .connect_with(options)
            .await
            .map_err(|e| DbError::Open {
                location: location.clone(),
                reason: e.to_string(),
            })?;

        let statements = schema::apply(&pool).await?;
        info!(location = %location, statements, "Database ready");
        Ok(Self { pool, location })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Owned pool handle for stores and spawned tasks
    pub fn pool_clone(&self) -> SqlitePool {
        self.pool.clone()
    }

    pub fn candles(&self) -> CandleRepository<'_> {
        CandleRepository::new(&self.pool)
    }

    pub fn backtests(&self) -> BacktestRepository<'_> {
        BacktestRepository::new(&self.pool)
    }

    pub fn watchlist(&self) -> WatchlistRepository<'_> {
        WatchlistRepository::new(&self.pool)
    }

    pub fn baskets(&self) -> BasketRepository<'_> {
        BasketRepository::new(&self.pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn table_names(db: &Database) -> Vec<String> {
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .fetch_all(db.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_in_memory_applies_schema_and_enforces_foreign_keys() {
        let db = Database::in_memory().await.unwrap();
        let tables = table_names(&db).await;
        for expected in ["backtest_runs", "ohlcv_candles", "saved_basket_members", "saved_baskets", "symbols", "watchlist"] {
            assert!(tables.iter().any(|t| t == expected), "missing {expected}");
        }

        let fk: i64 = sqlx::query_scalar("PRAGMA foreign_keys").fetch_one(db.pool()).await.unwrap();
        assert_eq!(fk, 1);

        let orphan = sqlx::query("INSERT INTO saved_basket_members (basket_id, position, symbol, weight) VALUES (99, 0, 'BTCUSDT', 1.0)")
            .execute(db.pool())
            .await;
        assert!(orphan.is_err());
    }

    #[tokio::test]
    async fn test_open_creates_file_in_wal_mode_and_reopens() {
        let dir = std::env::temp_dir().join(format!("pair-scout-db-{}", std::process::id()));
        let path = dir.join("nested").join("scout.db");

        {
            let db = Database::open(&path).await.unwrap();
            assert!(path.exists());
            assert_eq!(db.location(), path.display().to_string());
            let mode: String = sqlx::query_scalar("PRAGMA journal_mode").fetch_one(db.pool()).await.unwrap();
            assert_eq!(mode, "wal");
            assert!(db.watchlist().add("ETHUSDT/BTCUSDT").await.unwrap());
            db.pool().close().await;
        }

        // reapplying the schema keeps existing rows
        let db = Database::open(&path).await.unwrap();
        assert_eq!(db.watchlist().list().await.unwrap().len(), 1);
        db.pool().close().await;
        std::fs::remove_dir_all(&dir).ok();
    }
}
