//! Core market-data and pair types

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// A single OHLCV bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Decimal to f64 for analytics; `None` when the value has no finite f64 form
pub fn finite_f64(value: Decimal) -> Option<f64> {
    value.to_f64().filter(|v| v.is_finite())
}

// ============================================================================
// Timeframes & discovery windows
// ============================================================================

/// Bar granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "4h")]
    FourHours,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FiveMinutes => "5m",
            Self::OneHour => "1h",
            Self::FourHours => "4h",
        }
    }

    pub fn bar_duration(&self) -> Duration {
        match self {
            Self::FiveMinutes => Duration::minutes(5),
            Self::OneHour => Duration::hours(1),
            Self::FourHours => Duration::hours(4),
        }
    }

    /// Bars in a 365-day year, used to annualize volatility
    pub fn periods_per_year(&self) -> f64 {
        match self {
            Self::FiveMinutes => 105_120.0,
            Self::OneHour => 8_760.0,
            Self::FourHours => 2_190.0,
        }
    }

    /// History loaded for a single-pair analysis
    pub fn default_lookback(&self) -> Duration {
        match self {
            Self::FiveMinutes => Duration::days(1),
            Self::OneHour => Duration::days(7),
            Self::FourHours => Duration::days(60),
        }
    }

    /// Interval string understood by the Binance klines endpoint
    pub fn binance_interval(&self) -> &'static str {
        self.as_str()
    }

    pub fn all() -> &'static [Timeframe] {
        &[Self::FiveMinutes, Self::OneHour, Self::FourHours]
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "5m" | "5min" => Ok(Self::FiveMinutes),
            "1h" | "1hour" => Ok(Self::OneHour),
            "4h" | "4hour" => Ok(Self::FourHours),
            other => Err(EngineError::InvalidRange(format!("unknown timeframe '{other}'"))),
        }
    }
}

/// Lookback used by the discovery scanner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiscoveryWindow {
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "7d")]
    SevenDays,
    #[serde(rename = "60d")]
    SixtyDays,
}

impl DiscoveryWindow {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneDay => "1d",
            Self::SevenDays => "7d",
            Self::SixtyDays => "60d",
        }
    }

    pub fn lookback(&self) -> Duration {
        match self {
            Self::OneDay => Duration::days(1),
            Self::SevenDays => Duration::days(7),
            Self::SixtyDays => Duration::days(60),
        }
    }

    /// Bar size scanned for this window
    pub fn timeframe(&self) -> Timeframe {
        match self {
            Self::OneDay | Self::SevenDays => Timeframe::OneHour,
            Self::SixtyDays => Timeframe::FourHours,
        }
    }
}

impl Default for DiscoveryWindow {
    fn default() -> Self {
        Self::SevenDays
    }
}

impl fmt::Display for DiscoveryWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiscoveryWindow {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "1d" => Ok(Self::OneDay),
            "7d" => Ok(Self::SevenDays),
            "60d" => Ok(Self::SixtyDays),
            other => Err(EngineError::InvalidRange(format!("unknown discovery window '{other}'"))),
        }
    }
}

// ============================================================================
// Series
// ============================================================================

/// Validated, ascending bars for one symbol at one timeframe
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Series {
    symbol: String,
    timeframe: Timeframe,
    bars: Vec<Bar>,
}

impl Series {
    /// Build a series, rejecting unordered, duplicated or non-positive bars
    pub fn new(
        symbol: impl Into<String>,
        timeframe: Timeframe,
        bars: Vec<Bar>,
    ) -> Result<Self, EngineError> {
        let symbol = symbol.into();

        for (i, bar) in bars.iter().enumerate() {
            let prices = [bar.open, bar.high, bar.low, bar.close];
            if prices.iter().any(|p| *p <= Decimal::ZERO) {
                return Err(EngineError::InvalidSeries(format!(
                    "{symbol}: non-positive price at {}",
                    bar.timestamp
                )));
            }
            let fields = [bar.open, bar.high, bar.low, bar.close, bar.volume];
            if fields.iter().any(|d| finite_f64(*d).is_none()) {
                return Err(EngineError::InvalidSeries(format!(
                    "{symbol}: value not representable as f64 at {}",
                    bar.timestamp
                )));
            }
            if bar.volume < Decimal::ZERO {
                return Err(EngineError::InvalidSeries(format!(
                    "{symbol}: negative volume at {}",
                    bar.timestamp
                )));
            }
            if i > 0 && bar.timestamp <= bars[i - 1].timestamp {
                return Err(EngineError::InvalidSeries(format!(
                    "{symbol}: timestamps not strictly increasing at {}",
                    bar.timestamp
                )));
            }
        }

        Ok(Self {
            symbol,
            timeframe,
            bars,
        })
    }

    pub fn empty(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            bars: Vec::new(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.last()
    }
}

// ============================================================================
// Baskets & pair keys
// ============================================================================

fn default_weight() -> f64 {
    1.0
}

/// One constituent of a basket leg
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasketMember {
    pub symbol: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

impl BasketMember {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            weight: default_weight(),
        }
    }
}

/// One or more weighted symbols traded as a single leg.
///
/// Written as `BTCUSDT+ETHUSDT`; a non-unit weight is written `ETHUSDT*0.5`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Basket {
    members: Vec<BasketMember>,
}

impl Basket {
    pub fn new(members: Vec<BasketMember>) -> Result<Self, EngineError> {
        if members.is_empty() {
            return Err(EngineError::InvalidRange("basket has no members".to_string()));
        }
        for m in &members {
            if m.symbol.trim().is_empty() {
                return Err(EngineError::InvalidRange("basket member has no symbol".to_string()));
            }
            if !m.weight.is_finite() || m.weight <= 0.0 {
                return Err(EngineError::InvalidConfig(format!(
                    "basket weight for {} must be positive, got {}",
                    m.symbol, m.weight
                )));
            }
        }
        Ok(Self { members })
    }

    pub fn single(symbol: impl Into<String>) -> Self {
        Self {
            members: vec![BasketMember::new(symbol)],
        }
    }

    pub fn members(&self) -> &[BasketMember] {
        &self.members
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.members.iter().any(|m| m.symbol == symbol)
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(|m| m.symbol.as_str())
    }
}

impl fmt::Display for Basket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, m) in self.members.iter().enumerate() {
            if i > 0 {
                f.write_str("+")?;
            }
            if (m.weight - 1.0).abs() < f64::EPSILON {
                write!(f, "{}", m.symbol)?;
            } else {
                write!(f, "{}*{}", m.symbol, m.weight)?;
            }
        }
        Ok(())
    }
}

impl FromStr for Basket {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let members = s
            .split('+')
            .map(|part| {
                let part = part.trim();
                match part.split_once('*') {
                    Some((symbol, weight)) => {
                        let weight: f64 = weight.trim().parse().map_err(|_| {
                            EngineError::InvalidRange(format!("bad basket weight in '{part}'"))
                        })?;
                        Ok(BasketMember {
                            symbol: symbol.trim().to_uppercase(),
                            weight,
                        })
                    }
                    None => Ok(BasketMember::new(part.to_uppercase())),
                }
            })
            .collect::<Result<Vec<_>, EngineError>>()?;
        Self::new(members)
    }
}

impl From<Basket> for String {
    fn from(b: Basket) -> Self {
        b.to_string()
    }
}

impl TryFrom<String> for Basket {
    type Error = EngineError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Ordered pair of legs: long is the numerator and the regressand
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct PairKey {
    pub long: Basket,
    pub short: Basket,
}

impl PairKey {
    pub fn new(long: Basket, short: Basket) -> Self {
        Self { long, short }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.long, self.short)
    }
}

impl FromStr for PairKey {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(long), Some(short), None) => Ok(Self {
                long: long.parse()?,
                short: short.parse()?,
            }),
            _ => Err(EngineError::InvalidRange(format!(
                "pair key must look like LONG/SHORT, got '{s}'"
            ))),
        }
    }
}

impl From<PairKey> for String {
    fn from(p: PairKey) -> Self {
        p.to_string()
    }
}

impl TryFrom<String> for PairKey {
    type Error = EngineError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Trading signal for a pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Long,
    Short,
    Neutral,
}

impl Signal {
    pub fn is_actionable(&self) -> bool {
        !matches!(self, Signal::Neutral)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Signal::Long => "LONG",
            Signal::Short => "SHORT",
            Signal::Neutral => "NEUTRAL",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bar(ts: i64, close: Decimal) -> Bar {
        Bar {
            timestamp: DateTime::from_timestamp(ts, 0).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: dec!(1),
        }
    }

    #[test]
    fn test_series_rejects_unordered_bars() {
        let bars = vec![bar(3600, dec!(10)), bar(0, dec!(11))];
        let err = Series::new("BTCUSDT", Timeframe::OneHour, bars).unwrap_err();
        assert!(matches!(err, EngineError::InvalidSeries(_)));
    }

    #[test]
    fn test_series_rejects_duplicates_and_non_positive() {
        let dup = vec![bar(0, dec!(10)), bar(0, dec!(10))];
        assert!(Series::new("A", Timeframe::OneHour, dup).is_err());

        let zero = vec![bar(0, dec!(0))];
        assert!(Series::new("A", Timeframe::OneHour, zero).is_err());

        let ok = vec![bar(0, dec!(10)), bar(3600, dec!(10.5))];
        assert_eq!(Series::new("A", Timeframe::OneHour, ok).unwrap().len(), 2);
    }

    #[test]
    fn test_extreme_decimals_convert_without_falling_back_to_zero() {
        let min = finite_f64(dec!(0.0000000000000000000000000001)).unwrap();
        assert!((min / 1e-28 - 1.0).abs() < 1e-9);
        let max = finite_f64(Decimal::MAX).unwrap();
        assert!(max.is_finite() && max > 7.9e28);

        let tiny = vec![bar(0, dec!(0.0000000000000000000000000001)), bar(3600, Decimal::MAX)];
        let series = Series::new("A", Timeframe::OneHour, tiny).unwrap();
        assert!(series.bars().iter().all(|b| finite_f64(b.close).is_some_and(|v| v > 0.0)));
    }

    #[test]
    fn test_pair_key_round_trips_display() {
        let key: PairKey = "btcusdt+ETHUSDT/SOLUSDT".parse().unwrap();
        assert_eq!(key.long.members().len(), 2);
        assert_eq!(key.to_string(), "BTCUSDT+ETHUSDT/SOLUSDT");

        let weighted: PairKey = "BTCUSDT*2+ETHUSDT/SOLUSDT".parse().unwrap();
        assert_eq!(weighted.long.members()[0].weight, 2.0);
        assert_eq!(weighted.to_string(), "BTCUSDT*2+ETHUSDT/SOLUSDT");
    }

    #[test]
    fn test_pair_key_rejects_malformed() {
        assert!("BTCUSDT".parse::<PairKey>().is_err());
        assert!("A/B/C".parse::<PairKey>().is_err());
        assert!("A+/B".parse::<PairKey>().is_err());
        assert!(matches!(
            "A*0/B".parse::<PairKey>(),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_timeframe_constants() {
        assert_eq!("5min".parse::<Timeframe>().unwrap(), Timeframe::FiveMinutes);
        assert_eq!(Timeframe::FourHours.periods_per_year(), 2_190.0);
        assert_eq!(Timeframe::OneHour.default_lookback(), Duration::days(7));
        assert!("1w".parse::<Timeframe>().is_err());
    }

    #[test]
    fn test_discovery_window_mapping() {
        assert_eq!(DiscoveryWindow::OneDay.timeframe(), Timeframe::OneHour);
        assert_eq!(DiscoveryWindow::SevenDays.timeframe(), Timeframe::OneHour);
        assert_eq!(DiscoveryWindow::SixtyDays.timeframe(), Timeframe::FourHours);
        assert_eq!(DiscoveryWindow::SixtyDays.lookback(), Duration::days(60));
    }

    #[test]
    fn test_pair_key_serializes_as_display_string() {
        let key: PairKey = "ETHUSDT/BTCUSDT".parse().unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"ETHUSDT/BTCUSDT\"");
        let back: PairKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
