//! Backtest run repository: completed reports cached by parameter hash

use crate::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// A persisted backtest summary. `config` and `trades` hold JSON documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct BacktestRunRecord {
    pub id: Option<i64>,
    pub params_hash: String,
    pub pair: String,
    pub timeframe: String,
    pub start_time: i64,
    pub end_time: i64,
    pub config: String,
    pub bars: i64,
    pub total_return: String,
    pub sharpe_ratio: String,
    pub max_drawdown: String,
    pub win_rate: String,
    pub total_trades: i64,
    pub profitable_trades: i64,
    pub trades: String,
    pub created_at: Option<i64>,
}

pub struct BacktestRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> BacktestRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Save a run (INSERT OR IGNORE — skips if params_hash already exists)
    pub async fn save(&self, record: &BacktestRunRecord) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO backtest_runs (
                params_hash, pair, timeframe, start_time, end_time, config, bars,
                total_return, sharpe_ratio, max_drawdown, win_rate,
                total_trades, profitable_trades, trades
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.params_hash)
        .bind(&record.pair)
        .bind(&record.timeframe)
        .bind(record.start_time)
        .bind(record.end_time)
        .bind(&record.config)
        .bind(record.bars)
        .bind(&record.total_return)
        .bind(&record.sharpe_ratio)
        .bind(&record.max_drawdown)
        .bind(&record.win_rate)
        .bind(record.total_trades)
        .bind(record.profitable_trades)
        .bind(&record.trades)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_by_hash(&self, hash: &str) -> DbResult<Option<BacktestRunRecord>> {
        let record = sqlx::query_as::<_, BacktestRunRecord>(
            r#"
            SELECT id, params_hash, pair, timeframe, start_time, end_time, config, bars,
                   total_return, sharpe_ratio, max_drawdown, win_rate,
                   total_trades, profitable_trades, trades, created_at
            FROM backtest_runs
            WHERE params_hash = ?
            "#,
        )
        .bind(hash)
        .fetch_optional(self.pool)
        .await?;

        Ok(record)
    }

    /// Most recent runs first, optionally for a single pair
    pub async fn recent(&self, limit: i64, pair: Option<&str>) -> DbResult<Vec<BacktestRunRecord>> {
        if limit <= 0 {
            return Err(DbError::InvalidArgument(format!("limit must be positive, got {limit}")));
        }

        let mut sql = String::from(
            r#"
            SELECT id, params_hash, pair, timeframe, start_time, end_time, config, bars,
                   total_return, sharpe_ratio, max_drawdown, win_rate,
                   total_trades, profitable_trades, trades, created_at
            FROM backtest_runs
            "#,
        );
        if pair.is_some() {
            sql.push_str(" WHERE pair = ?");
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");

        let mut query = sqlx::query_as::<_, BacktestRunRecord>(&sql);
        if let Some(p) = pair {
            query = query.bind(p);
        }
        let records = query.bind(limit).fetch_all(self.pool).await?;

        Ok(records)
    }

    pub async fn count(&self) -> DbResult<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM backtest_runs")
            .fetch_one(self.pool)
            .await?;
        Ok(row.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn record(hash: &str, pair: &str) -> BacktestRunRecord {
        BacktestRunRecord {
            id: None,
            params_hash: hash.to_string(),
            pair: pair.to_string(),
            timeframe: "1h".to_string(),
            start_time: 0,
            end_time: 86_400_000,
            config: "{}".to_string(),
            bars: 24,
            total_return: "1.25".to_string(),
            sharpe_ratio: "0.80".to_string(),
            max_drawdown: "0.5".to_string(),
            win_rate: "50".to_string(),
            total_trades: 2,
            profitable_trades: 1,
            trades: "[]".to_string(),
            created_at: None,
        }
    }

    #[tokio::test]
    async fn test_save_is_idempotent_per_hash() {
        let db = Database::in_memory().await.unwrap();
        let repo = BacktestRepository::new(db.pool());

        assert!(repo.save(&record("abc", "ETHUSDT/BTCUSDT")).await.unwrap());
        assert!(!repo.save(&record("abc", "ETHUSDT/BTCUSDT")).await.unwrap());
        assert_eq!(repo.count().await.unwrap(), 1);

        let stored = repo.get_by_hash("abc").await.unwrap().unwrap();
        assert_eq!(stored.total_return, "1.25");
        assert!(stored.id.is_some());
        assert!(stored.created_at.is_some());
        assert!(repo.get_by_hash("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recent_filters_by_pair() {
        let db = Database::in_memory().await.unwrap();
        let repo = BacktestRepository::new(db.pool());

        repo.save(&record("h1", "ETHUSDT/BTCUSDT")).await.unwrap();
        repo.save(&record("h2", "SOLUSDT/BTCUSDT")).await.unwrap();
        repo.save(&record("h3", "ETHUSDT/BTCUSDT")).await.unwrap();

        let all = repo.recent(10, None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].params_hash, "h3");

        let eth = repo.recent(10, Some("ETHUSDT/BTCUSDT")).await.unwrap();
        assert_eq!(eth.len(), 2);
        assert!(repo.recent(0, None).await.is_err());
    }
}
