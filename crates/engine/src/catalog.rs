//! Saved pairs and baskets: the watchlist and named baskets kept in SQLite
//!
//! A saved basket can stand in for a leg anywhere a pair key is typed by
//! writing its name after `@`, e.g. `@majors/SOLUSDT`.

use persistence::repository::{BasketMemberRecord, BasketRepository, SavedBasketRecord, WatchlistRepository};
use persistence::SqlitePool;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::EngineError;
use crate::types::{Basket, BasketMember, PairKey};

/// Baskets with more members than this display by name and size
const MAX_LISTED_MEMBERS: usize = 5;

/// Marks a leg that names a saved basket
pub const SAVED_BASKET_PREFIX: char = '@';

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedBasket {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub basket: Basket,
    pub created_at: Option<i64>,
}

impl SavedBasket {
    fn from_record(record: SavedBasketRecord, members: Vec<BasketMemberRecord>) -> Result<Self, EngineError> {
        let basket = Basket::new(
            members
                .into_iter()
                .map(|m| BasketMember {
                    symbol: m.symbol,
                    weight: m.weight,
                })
                .collect(),
        )?;
        Ok(Self {
            id: record.id,
            name: record.name,
            description: record.description,
            basket,
            created_at: record.created_at,
        })
    }

    /// Members joined with `+`, or `name (N coins)` for large baskets
    pub fn display_name(&self) -> String {
        let count = self.basket.members().len();
        if count <= MAX_LISTED_MEMBERS {
            self.basket.symbols().collect::<Vec<_>>().join("+")
        } else {
            format!("{} ({count} coins)", self.name)
        }
    }
}

fn validate_name(name: &str) -> Result<&str, EngineError> {
    let name = name.trim();
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(name)
    } else {
        Err(EngineError::InvalidRange(format!(
            "basket name '{name}' must be non-empty and use only letters, digits, '-', '_' or '.'"
        )))
    }
}

/// Watchlist and saved baskets over one database pool
#[derive(Clone)]
pub struct PairCatalog {
    pool: SqlitePool,
}

impl PairCatalog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ========================================================================
    // Watchlist
    // ========================================================================

    /// Watched pairs in the order they were added. Rows that no longer parse
    /// are skipped with a warning.
    pub async fn watchlist(&self) -> Result<Vec<PairKey>, EngineError> {
        let entries = WatchlistRepository::new(&self.pool).list().await?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| match entry.pair.parse::<PairKey>() {
                Ok(pair) => Some(pair),
                Err(e) => {
                    warn!(pair = %entry.pair, error = %e, "Skipping unreadable watchlist entry");
                    None
                }
            })
            .collect())
    }

    /// Returns false when the pair was already watched
    pub async fn watch(&self, pair: &PairKey) -> Result<bool, EngineError> {
        let added = WatchlistRepository::new(&self.pool).add(&pair.to_string()).await?;
        if added {
            info!(pair = %pair, "Added pair to watchlist");
        }
        Ok(added)
    }

    pub async fn unwatch(&self, pair: &PairKey) -> Result<bool, EngineError> {
        let removed = WatchlistRepository::new(&self.pool).remove(&pair.to_string()).await?;
        if removed {
            info!(pair = %pair, "Removed pair from watchlist");
        }
        Ok(removed)
    }

    // ========================================================================
    // Saved baskets
    // ========================================================================

    /// Save `basket` under `name`. A taken name returns the stored basket
    /// unchanged with `false`.
    pub async fn save_basket(
        &self,
        name: &str,
        basket: &Basket,
        description: Option<&str>,
    ) -> Result<(SavedBasket, bool), EngineError> {
        let name = validate_name(name)?;
        let members: Vec<BasketMemberRecord> = basket
            .members()
            .iter()
            .map(|m| BasketMemberRecord {
                symbol: m.symbol.to_uppercase(),
                weight: m.weight,
            })
            .collect();

        let (_, created) = BasketRepository::new(&self.pool)
            .create(name, description, &members)
            .await?;
        if created {
            info!(name, basket = %basket, "Saved basket");
        }

        let saved = self
            .basket(name)
            .await?
            .ok_or_else(|| EngineError::UpstreamUnavailable(format!("saved basket {name} vanished")))?;
        Ok((saved, created))
    }

    pub async fn basket(&self, name: &str) -> Result<Option<SavedBasket>, EngineError> {
        let repo = BasketRepository::new(&self.pool);
        let Some(record) = repo.get_by_name(name.trim()).await? else {
            return Ok(None);
        };
        let members = repo.members(record.id).await?;
        SavedBasket::from_record(record, members).map(Some)
    }

    pub async fn baskets(&self) -> Result<Vec<SavedBasket>, EngineError> {
        let repo = BasketRepository::new(&self.pool);
        let mut saved = Vec::new();
        for record in repo.list().await? {
            let members = repo.members(record.id).await?;
            saved.push(SavedBasket::from_record(record, members)?);
        }
        Ok(saved)
    }

    pub async fn delete_basket(&self, name: &str) -> Result<bool, EngineError> {
        let deleted = BasketRepository::new(&self.pool).delete(name.trim()).await?;
        if deleted {
            info!(name = name.trim(), "Deleted saved basket");
        }
        Ok(deleted)
    }

    // ========================================================================
    // Resolution
    // ========================================================================

    /// Parse a leg, looking up `@name` in the saved baskets
    pub async fn resolve_basket(&self, text: &str) -> Result<Basket, EngineError> {
        let text = text.trim();
        match text.strip_prefix(SAVED_BASKET_PREFIX) {
            Some(name) => self
                .basket(name)
                .await?
                .map(|saved| saved.basket)
                .ok_or_else(|| EngineError::InvalidRange(format!("no saved basket named '{name}'"))),
            None => text.parse(),
        }
    }

    /// Parse `LONG/SHORT` where either leg may be a saved basket
    pub async fn resolve_pair(&self, text: &str) -> Result<PairKey, EngineError> {
        match text.split_once('/') {
            Some((long, short)) if !short.contains('/') => Ok(PairKey::new(
                self.resolve_basket(long).await?,
                self.resolve_basket(short).await?,
            )),
            _ => Err(EngineError::InvalidRange(format!(
                "pair key must look like LONG/SHORT, got '{text}'"
            ))),
        }
    }
}
