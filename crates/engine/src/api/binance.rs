//! Binance public API client for market data (no authentication required)

use std::collections::BTreeSet;
use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::EngineError;
use crate::store::TimeSeriesStore;
use crate::types::{Bar, Series, Timeframe};

const DEFAULT_BASE_URL: &str = "https://api.binance.com";
const MAX_KLINES_PER_REQUEST: u32 = 1000;

/// Binance public market data client
#[derive(Clone)]
pub struct BinanceClient {
    client: Client,
    base_url: String,
}

/// Raw kline data from Binance API (array of arrays)
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct RawKline(
    i64,    // 0: Open time
    String, // 1: Open
    String, // 2: High
    String, // 3: Low
    String, // 4: Close
    String, // 5: Volume
    i64,    // 6: Close time
    String, // 7: Quote asset volume
    u64,    // 8: Number of trades
    String, // 9: Taker buy base
    String, // 10: Taker buy quote
    String, // 11: Ignore
);

impl RawKline {
    fn into_bar(self) -> Option<Bar> {
        Some(Bar {
            timestamp: DateTime::from_timestamp_millis(self.0)?,
            open: Decimal::from_str(&self.1).ok()?,
            high: Decimal::from_str(&self.2).ok()?,
            low: Decimal::from_str(&self.3).ok()?,
            close: Decimal::from_str(&self.4).ok()?,
            volume: Decimal::from_str(&self.5).ok()?,
        })
    }
}

/// Binance ticker price response
#[derive(Debug, Clone, Deserialize)]
pub struct TickerPrice {
    pub symbol: String,
    pub price: String,
}

impl BinanceClient {
    /// Create a new Binance client with default base URL
    pub fn new() -> Result<Self> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self> {
        Ok(Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Fetch klines (candlestick data) for a symbol
    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        start_time: Option<i64>,
        end_time: Option<i64>,
        limit: Option<u32>,
    ) -> Result<Vec<Bar>> {
        let mut url = format!(
            "{}/api/v3/klines?symbol={}&interval={}",
            self.base_url, symbol, interval
        );

        if let Some(start) = start_time {
            url.push_str(&format!("&startTime={}", start));
        }
        if let Some(end) = end_time {
            url.push_str(&format!("&endTime={}", end));
        }

        let limit = limit.unwrap_or(500).min(MAX_KLINES_PER_REQUEST);
        url.push_str(&format!("&limit={}", limit));

        debug!(symbol, interval, "Fetching klines from Binance");

        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Binance API error {}: {}", status, body);
        }

        let raw_klines: Vec<RawKline> = response.json().await?;
        let bars: Vec<Bar> = raw_klines.into_iter().filter_map(RawKline::into_bar).collect();

        debug!(count = bars.len(), "Fetched klines");
        Ok(bars)
    }

    /// Fetch klines with automatic pagination for ranges > 1000 bars
    pub async fn get_klines_paginated(
        &self,
        symbol: &str,
        interval: &str,
        start_time: i64,
        end_time: i64,
    ) -> Result<Vec<Bar>> {
        let mut all_bars: Vec<Bar> = Vec::new();
        let mut current_start = start_time;

        info!(symbol, interval, "Fetching paginated klines from Binance");

        while current_start <= end_time {
            let bars = self
                .get_klines(
                    symbol,
                    interval,
                    Some(current_start),
                    Some(end_time),
                    Some(MAX_KLINES_PER_REQUEST),
                )
                .await?;

            let Some(last_open) = bars.last().map(|b| b.timestamp.timestamp_millis()) else {
                break;
            };
            let page_len = bars.len();
            all_bars.extend(bars);

            if page_len < MAX_KLINES_PER_REQUEST as usize {
                break;
            }

            // Move start to after the last candle
            current_start = last_open + 1;

            // Small delay to respect rate limits
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }

        info!(total = all_bars.len(), "Paginated kline fetch complete");
        Ok(all_bars)
    }

    /// Latest price of every listed symbol
    pub async fn get_all_prices(&self) -> Result<Vec<TickerPrice>> {
        let url = format!("{}/api/v3/ticker/price", self.base_url);

        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Binance API error {}: {}", status, body);
        }

        let tickers: Vec<TickerPrice> = response.json().await?;
        Ok(tickers)
    }
}

/// Category on Binance is the quote asset: `USDT` matches `ETHUSDT`
fn matches_category(symbol: &str, category: Option<&str>) -> bool {
    category.map_or(true, |c| symbol.ends_with(&c.to_uppercase()))
}

/// Live store reading straight from the Binance public API
#[derive(Clone)]
pub struct BinanceStore {
    client: BinanceClient,
}

impl BinanceStore {
    pub fn new(client: BinanceClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TimeSeriesStore for BinanceStore {
    async fn fetch_series(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Series, EngineError> {
        let bars = self
            .client
            .get_klines_paginated(
                symbol,
                timeframe.binance_interval(),
                start.timestamp_millis(),
                end.timestamp_millis(),
            )
            .await
            .map_err(|e| EngineError::UpstreamUnavailable(format!("{symbol}: {e}")))?;

        let bars: Vec<Bar> = bars
            .into_iter()
            .filter(|b| b.timestamp >= start && b.timestamp <= end)
            .collect();
        Series::new(symbol, timeframe, bars)
    }

    async fn list_tradable_symbols(
        &self,
        category: Option<&str>,
    ) -> Result<BTreeSet<String>, EngineError> {
        let tickers = self
            .client
            .get_all_prices()
            .await
            .map_err(|e| EngineError::UpstreamUnavailable(e.to_string()))?;

        Ok(tickers
            .into_iter()
            .filter(|t| matches_category(&t.symbol, category))
            .filter(|t| Decimal::from_str(&t.price).map_or(false, |p| p > Decimal::ZERO))
            .map(|t| t.symbol)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_raw_kline_parses_into_bar() {
        let json = r#"[[1700000000000,"36500.10","36600.00","36400.00","36550.25","12.5",1700003599999,"456789.1",1200,"6.1","222.2","0"]]"#;
        let raw: Vec<RawKline> = serde_json::from_str(json).unwrap();
        let bar = raw.into_iter().next().unwrap().into_bar().unwrap();
        assert_eq!(bar.timestamp.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(bar.close, dec!(36550.25));
        assert_eq!(bar.volume, dec!(12.5));
    }

    #[test]
    fn test_malformed_kline_is_dropped() {
        let json = r#"[[1700000000000,"x","1","1","1","1",1700003599999,"1",1,"1","1","0"]]"#;
        let raw: Vec<RawKline> = serde_json::from_str(json).unwrap();
        assert!(raw.into_iter().next().unwrap().into_bar().is_none());
    }

    #[test]
    fn test_category_is_quote_suffix() {
        assert!(matches_category("ETHUSDT", Some("usdt")));
        assert!(!matches_category("ETHBTC", Some("USDT")));
        assert!(matches_category("ETHBTC", None));
    }
}
