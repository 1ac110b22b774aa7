//! Saved basket repository: named symbol sets with per-member weights

use crate::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct SavedBasketRecord {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub created_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct BasketMemberRecord {
    pub symbol: String,
    pub weight: f64,
}

pub struct BasketRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> BasketRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Store a basket and its members in one transaction.
    ///
    /// A name that is already taken returns the existing id untouched, with
    /// `false` as the second element.
    pub async fn create(
        &self,
        name: &str,
        description: Option<&str>,
        members: &[BasketMemberRecord],
    ) -> DbResult<(i64, bool)> {
        if members.is_empty() {
            return Err(DbError::InvalidArgument(format!("basket {name} has no members")));
        }

        let mut tx = self.pool.begin().await?;

        let existing: Option<(i64,)> = sqlx::query_as("SELECT id FROM saved_baskets WHERE name = ?")
            .bind(name)
            .fetch_optional(&mut *tx)
            .await?;
        if let Some((id,)) = existing {
            return Ok((id, false));
        }

        let id = sqlx::query("INSERT INTO saved_baskets (name, description) VALUES (?, ?)")
            .bind(name)
            .bind(description)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

        for (position, member) in members.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO saved_basket_members (basket_id, position, symbol, weight)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(id)
            .bind(position as i64)
            .bind(&member.symbol)
            .bind(member.weight)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok((id, true))
    }

    pub async fn get_by_name(&self, name: &str) -> DbResult<Option<SavedBasketRecord>> {
        let record = sqlx::query_as::<_, SavedBasketRecord>(
            "SELECT id, name, description, created_at FROM saved_baskets WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(self.pool)
        .await?;
        Ok(record)
    }

    /// Every saved basket, by name
    pub async fn list(&self) -> DbResult<Vec<SavedBasketRecord>> {
        let records = sqlx::query_as::<_, SavedBasketRecord>(
            "SELECT id, name, description, created_at FROM saved_baskets ORDER BY name ASC",
        )
        .fetch_all(self.pool)
        .await?;
        Ok(records)
    }

    /// Members in the order they were saved
    pub async fn members(&self, basket_id: i64) -> DbResult<Vec<BasketMemberRecord>> {
        let members = sqlx::query_as::<_, BasketMemberRecord>(
            r#"
            SELECT symbol, weight FROM saved_basket_members
            WHERE basket_id = ?
            ORDER BY position ASC
            "#,
        )
        .bind(basket_id)
        .fetch_all(self.pool)
        .await?;
        Ok(members)
    }

    /// Delete a basket; its members go with it
    pub async fn delete(&self, name: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM saved_baskets WHERE name = ?")
            .bind(name)
            .execute(self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
