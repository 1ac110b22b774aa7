//! Watchlist repository: pairs the user follows, in the order they were added

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct WatchlistEntry {
    /// Pair key in display form, e.g. `ETHUSDT/BTCUSDT`
    pub pair: String,
    pub position: i64,
    pub added_at: Option<i64>,
}

pub struct WatchlistRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> WatchlistRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Append a pair. Returns false when it is already listed.
    pub async fn add(&self, pair: &str) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO watchlist (pair, position)
            VALUES (?, (SELECT COALESCE(MAX(position), 0) + 1 FROM watchlist))
            "#,
        )
        .bind(pair)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn remove(&self, pair: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM watchlist WHERE pair = ?")
            .bind(pair)
            .execute(self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list(&self) -> DbResult<Vec<WatchlistEntry>> {
        let entries = sqlx::query_as::<_, WatchlistEntry>(
            "SELECT pair, position, added_at FROM watchlist ORDER BY position ASC",
        )
        .fetch_all(self.pool)
        .await?;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    #[tokio::test]
    async fn test_add_is_idempotent_and_keeps_order() {
        let db = Database::in_memory().await.unwrap();
        let repo = WatchlistRepository::new(db.pool());

        assert!(repo.add("ETHUSDT/BTCUSDT").await.unwrap());
        assert!(repo.add("SOLUSDT/ETHUSDT").await.unwrap());
        assert!(!repo.add("ETHUSDT/BTCUSDT").await.unwrap());

        let pairs: Vec<String> = repo.list().await.unwrap().into_iter().map(|e| e.pair).collect();
        assert_eq!(pairs, vec!["ETHUSDT/BTCUSDT", "SOLUSDT/ETHUSDT"]);
    }

    #[tokio::test]
    async fn test_remove_then_re_add_goes_last() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.watchlist();

        repo.add("A/B").await.unwrap();
        repo.add("C/D").await.unwrap();
        assert!(repo.remove("A/B").await.unwrap());
        assert!(!repo.remove("A/B").await.unwrap());
        repo.add("A/B").await.unwrap();

        let entries = repo.list().await.unwrap();
        assert_eq!(entries[0].pair, "C/D");
        assert_eq!(entries[1].pair, "A/B");
        assert!(entries[1].position > entries[0].position);
        assert!(entries[0].added_at.is_some());
    }
}
