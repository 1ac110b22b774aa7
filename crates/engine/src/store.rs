//! Time-series store abstraction and its SQLite / in-memory implementations

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use persistence::repository::{CandleRecord, CandleRepository};
use persistence::SqlitePool;
use rust_decimal::Decimal;
use tracing::debug;

use crate::basket::Leg;
use crate::config::BasketWeighting;
use crate::error::EngineError;
use crate::types::{Bar, Basket, Series, Timeframe};

/// Source of OHLCV history. Implementations return bars sorted ascending
/// with gaps simply absent.
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// Bars with `start <= timestamp <= end`
    async fn fetch_series(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Series, EngineError>;

    async fn list_tradable_symbols(
        &self,
        category: Option<&str>,
    ) -> Result<BTreeSet<String>, EngineError>;
}

/// Fetch every member of `basket` and aggregate them into one leg
pub async fn fetch_basket(
    store: &dyn TimeSeriesStore,
    basket: &Basket,
    timeframe: Timeframe,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    weighting: BasketWeighting,
) -> Result<Leg, EngineError> {
    let mut series = Vec::with_capacity(basket.members().len());
    for symbol in basket.symbols() {
        series.push(store.fetch_series(symbol, timeframe, start, end).await?);
    }
    Leg::aggregate(basket, &series, weighting)
}

// ============================================================================
// In-memory store
// ============================================================================

/// Store backed by a map; used by tests and for preloaded data
#[derive(Default)]
pub struct InMemoryStore {
    series: RwLock<HashMap<(String, Timeframe), Series>>,
    categories: RwLock<HashMap<String, Option<String>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a series and mark its symbol tradable
    pub fn insert(&self, series: Series, category: Option<&str>) {
        let symbol = series.symbol().to_string();
        self.categories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(symbol.clone(), category.map(str::to_string));
        self.series
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((symbol, series.timeframe()), series);
    }
}

#[async_trait]
impl TimeSeriesStore for InMemoryStore {
    async fn fetch_series(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Series, EngineError> {
        let map = self.series.read().unwrap_or_else(PoisonError::into_inner);
        let Some(series) = map.get(&(symbol.to_string(), timeframe)) else {
            return Ok(Series::empty(symbol, timeframe));
        };
        let bars: Vec<Bar> = series
            .bars()
            .iter()
            .filter(|b| b.timestamp >= start && b.timestamp <= end)
            .cloned()
            .collect();
        Series::new(symbol, timeframe, bars)
    }

    async fn list_tradable_symbols(
        &self,
        category: Option<&str>,
    ) -> Result<BTreeSet<String>, EngineError> {
        let categories = self.categories.read().unwrap_or_else(PoisonError::into_inner);
        Ok(categories
            .iter()
            .filter(|(_, cat)| category.map_or(true, |c| cat.as_deref() == Some(c)))
            .map(|(symbol, _)| symbol.clone())
            .collect())
    }
}

// ============================================================================
// SQLite store
// ============================================================================

/// Store reading candles synced into the local database
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn parse_decimal(record: &CandleRecord, field: &str, value: &str) -> Result<Decimal, EngineError> {
    Decimal::from_str(value).map_err(|e| {
        EngineError::InvalidSeries(format!(
            "{} {} at {}: bad {field} '{value}': {e}",
            record.symbol, record.timeframe, record.open_time
        ))
    })
}

/// Convert a stored candle back into a bar
pub fn bar_from_record(record: &CandleRecord) -> Result<Bar, EngineError> {
    let timestamp = DateTime::from_timestamp_millis(record.open_time).ok_or_else(|| {
        EngineError::InvalidSeries(format!("bad open_time {}", record.open_time))
    })?;
    Ok(Bar {
        timestamp,
        open: parse_decimal(record, "open", &record.open)?,
        high: parse_decimal(record, "high", &record.high)?,
        low: parse_decimal(record, "low", &record.low)?,
        close: parse_decimal(record, "close", &record.close)?,
        volume: parse_decimal(record, "volume", &record.volume)?,
    })
}

/// Convert a bar into its stored form
pub fn record_from_bar(symbol: &str, timeframe: Timeframe, bar: &Bar) -> CandleRecord {
    CandleRecord {
        symbol: symbol.to_string(),
        timeframe: timeframe.as_str().to_string(),
        open_time: bar.timestamp.timestamp_millis(),
        open: bar.open.to_string(),
        high: bar.high.to_string(),
        low: bar.low.to_string(),
        close: bar.close.to_string(),
        volume: bar.volume.to_string(),
    }
}

#[async_trait]
impl TimeSeriesStore for SqliteStore {
    async fn fetch_series(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Series, EngineError> {
        let repo = CandleRepository::new(&self.pool);
        let records = repo
            .get_range(
                symbol,
                timeframe.as_str(),
                start.timestamp_millis(),
                end.timestamp_millis(),
            )
            .await?;

        debug!(symbol, timeframe = %timeframe, rows = records.len(), "Loaded candles");

        let bars = records
            .iter()
            .map(bar_from_record)
            .collect::<Result<Vec<_>, _>>()?;
        Series::new(symbol, timeframe, bars)
    }

    async fn list_tradable_symbols(
        &self,
        category: Option<&str>,
    ) -> Result<BTreeSet<String>, EngineError> {
        let repo = CandleRepository::new(&self.pool);
        Ok(repo.list_tradable(category).await?.into_iter().collect())
    }
}
