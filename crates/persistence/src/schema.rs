//! Database schema
//!
//! Prices, volumes and report metrics are TEXT so `rust_decimal::Decimal`
//! values round-trip exactly. Times are Unix milliseconds unless the column
//! defaults to `strftime('%s')`. Basket weights are REAL: they are user
//! tuning, not market data.

use sqlx::SqlitePool;
use tracing::debug;

use crate::{DbError, DbResult};

/// Idempotent DDL, applied in order on every open
pub const STATEMENTS: &[&str] = &[
    // one row per symbol / timeframe / bar
    r#"CREATE TABLE IF NOT EXISTS ohlcv_candles (
        symbol TEXT NOT NULL,
        timeframe TEXT NOT NULL,
        open_time INTEGER NOT NULL,
        open TEXT NOT NULL,
        high TEXT NOT NULL,
        low TEXT NOT NULL,
        close TEXT NOT NULL,
        volume TEXT NOT NULL,
        PRIMARY KEY (symbol, timeframe, open_time)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS symbols (
        symbol TEXT PRIMARY KEY,
        category TEXT,
        tradable INTEGER NOT NULL DEFAULT 1,
        updated_at INTEGER DEFAULT (strftime('%s', 'now'))
    )"#,
    r#"CREATE TABLE IF NOT EXISTS backtest_runs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        params_hash TEXT NOT NULL UNIQUE,
        pair TEXT NOT NULL,
        timeframe TEXT NOT NULL,
        start_time INTEGER NOT NULL,
        end_time INTEGER NOT NULL,
        config TEXT NOT NULL,
        bars INTEGER NOT NULL DEFAULT 0,
        total_return TEXT NOT NULL DEFAULT '0',
        sharpe_ratio TEXT NOT NULL DEFAULT '0',
        max_drawdown TEXT NOT NULL DEFAULT '0',
        win_rate TEXT NOT NULL DEFAULT '0',
        total_trades INTEGER NOT NULL DEFAULT 0,
        profitable_trades INTEGER NOT NULL DEFAULT 0,
        trades TEXT NOT NULL DEFAULT '[]',
        created_at INTEGER DEFAULT (strftime('%s', 'now'))
    )"#,
    // pair keys in display form, ordered by position
    r#"CREATE TABLE IF NOT EXISTS watchlist (
        pair TEXT PRIMARY KEY,
        position INTEGER NOT NULL,
        added_at INTEGER DEFAULT (strftime('%s', 'now'))
    )"#,
    r#"CREATE TABLE IF NOT EXISTS saved_baskets (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        description TEXT,
        created_at INTEGER DEFAULT (strftime('%s', 'now'))
    )"#,
    r#"CREATE TABLE IF NOT EXISTS saved_basket_members (
        basket_id INTEGER NOT NULL REFERENCES saved_baskets(id) ON DELETE CASCADE,
        position INTEGER NOT NULL,
        symbol TEXT NOT NULL,
        weight REAL NOT NULL CHECK (weight > 0),
        PRIMARY KEY (basket_id, position)
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_symbols_category ON symbols(category, tradable)",
    "CREATE INDEX IF NOT EXISTS idx_backtest_pair ON backtest_runs(pair, timeframe)",
    "CREATE INDEX IF NOT EXISTS idx_backtest_created ON backtest_runs(created_at DESC)",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_watchlist_position ON watchlist(position)",
];

/// Run every statement; returns how many were applied
pub async fn apply(pool: &SqlitePool) -> DbResult<usize> {
    for sql in STATEMENTS {
        sqlx::query(sql)
            .execute(pool)
            .await
            .map_err(|e| DbError::Schema(format!("{e}: {sql}")))?;
    }
    debug!(statements = STATEMENTS.len(), "Schema applied");
    Ok(STATEMENTS.len())
}
