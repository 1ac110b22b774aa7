//! OHLCV candle and symbol-universe repository

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// One stored candle. Prices are decimal strings, `open_time` is Unix ms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct CandleRecord {
    pub symbol: String,
    pub timeframe: String,
    pub open_time: i64,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct SymbolRecord {
    pub symbol: String,
    pub category: Option<String>,
    pub tradable: bool,
}

/// Repository for candles and the symbol universe
pub struct CandleRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> CandleRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace candles in a single transaction. Returns rows written.
    pub async fn upsert_candles(&self, candles: &[CandleRecord]) -> DbResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0;

        for c in candles {
            let result = sqlx::query(
                r#"
                INSERT OR REPLACE INTO ohlcv_candles (
                    symbol, timeframe, open_time, open, high, low, close, volume
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&c.symbol)
            .bind(&c.timeframe)
            .bind(c.open_time)
            .bind(&c.open)
            .bind(&c.high)
            .bind(&c.low)
            .bind(&c.close)
            .bind(&c.volume)
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected();
        }

        tx.commit().await?;
        Ok(written)
    }

    /// Candles with `start_ms <= open_time <= end_ms`, ascending
    pub async fn get_range(
        &self,
        symbol: &str,
        timeframe: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> DbResult<Vec<CandleRecord>> {
        let records = sqlx::query_as::<_, CandleRecord>(
            r#"
            SELECT symbol, timeframe, open_time, open, high, low, close, volume
            FROM ohlcv_candles
            WHERE symbol = ? AND timeframe = ? AND open_time >= ? AND open_time <= ?
            ORDER BY open_time ASC
            "#,
        )
        .bind(symbol)
        .bind(timeframe)
        .bind(start_ms)
        .bind(end_ms)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }

    /// Open time of the newest stored candle, if any
    pub async fn latest_open_time(&self, symbol: &str, timeframe: &str) -> DbResult<Option<i64>> {
        let row: (Option<i64>,) = sqlx::query_as(
            "SELECT MAX(open_time) FROM ohlcv_candles WHERE symbol = ? AND timeframe = ?",
        )
        .bind(symbol)
        .bind(timeframe)
        .fetch_one(self.pool)
        .await?;

        Ok(row.0)
    }

    pub async fn count(&self, symbol: &str, timeframe: &str) -> DbResult<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM ohlcv_candles WHERE symbol = ? AND timeframe = ?",
        )
        .bind(symbol)
        .bind(timeframe)
        .fetch_one(self.pool)
        .await?;

        Ok(row.0)
    }

    /// Add a symbol to the universe, or update its category and tradable flag
    pub async fn register_symbol(
        &self,
        symbol: &str,
        category: Option<&str>,
        tradable: bool,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO symbols (symbol, category, tradable) VALUES (?, ?, ?)
            ON CONFLICT(symbol) DO UPDATE SET
                category = excluded.category,
                tradable = excluded.tradable,
                updated_at = strftime('%s', 'now')
            "#,
        )
        .bind(symbol)
        .bind(category)
        .bind(tradable)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Tradable symbols, optionally restricted to one category, sorted by name
    pub async fn list_tradable(&self, category: Option<&str>) -> DbResult<Vec<String>> {
        let rows: Vec<(String,)> = match category {
            Some(cat) => {
                sqlx::query_as(
                    "SELECT symbol FROM symbols WHERE tradable = 1 AND category = ? ORDER BY symbol",
                )
                .bind(cat)
                .fetch_all(self.pool)
                .await?
            }
            None => {
                sqlx::query_as("SELECT symbol FROM symbols WHERE tradable = 1 ORDER BY symbol")
                    .fetch_all(self.pool)
                    .await?
            }
        };

        Ok(rows.into_iter().map(|(s,)| s).collect())
    }

    pub async fn list_symbols(&self) -> DbResult<Vec<SymbolRecord>> {
        let records = sqlx::query_as::<_, SymbolRecord>(
            "SELECT symbol, category, tradable FROM symbols ORDER BY symbol",
        )
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn candle(symbol: &str, open_time: i64, close: &str) -> CandleRecord {
        CandleRecord {
            symbol: symbol.to_string(),
            timeframe: "1h".to_string(),
            open_time,
            open: close.to_string(),
            high: close.to_string(),
            low: close.to_string(),
            close: close.to_string(),
            volume: "10".to_string(),
        }
    }

    #[tokio::test]
    async fn test_upsert_and_range_query() {
        let db = Database::in_memory().await.unwrap();
        let repo = CandleRepository::new(db.pool());

        let candles = vec![
            candle("BTCUSDT", 7_200_000, "101.5"),
            candle("BTCUSDT", 0, "100.0"),
            candle("BTCUSDT", 3_600_000, "100.25"),
        ];
        assert_eq!(repo.upsert_candles(&candles).await.unwrap(), 3);

        // replacing an existing bar keeps one row per key
        repo.upsert_candles(&[candle("BTCUSDT", 0, "99.9")]).await.unwrap();
        assert_eq!(repo.count("BTCUSDT", "1h").await.unwrap(), 3);

        let range = repo.get_range("BTCUSDT", "1h", 0, 3_600_000).await.unwrap();
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].close, "99.9");
        assert_eq!(range[1].open_time, 3_600_000);

        assert_eq!(
            repo.latest_open_time("BTCUSDT", "1h").await.unwrap(),
            Some(7_200_000)
        );
        assert_eq!(repo.latest_open_time("ETHUSDT", "1h").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_tradable_symbols_by_category() {
        let db = Database::in_memory().await.unwrap();
        let repo = CandleRepository::new(db.pool());

        repo.register_symbol("ETHUSDT", Some("USDT"), true).await.unwrap();
        repo.register_symbol("BTCUSDT", Some("USDT"), true).await.unwrap();
        repo.register_symbol("ETHBTC", Some("BTC"), true).await.unwrap();
        repo.register_symbol("LUNAUSDT", Some("USDT"), false).await.unwrap();

        assert_eq!(
            repo.list_tradable(Some("USDT")).await.unwrap(),
            vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
        );
        assert_eq!(repo.list_tradable(None).await.unwrap().len(), 3);

        repo.register_symbol("LUNAUSDT", Some("USDT"), true).await.unwrap();
        assert_eq!(repo.list_tradable(Some("USDT")).await.unwrap().len(), 3);
        assert_eq!(repo.list_symbols().await.unwrap().len(), 4);
    }
}
