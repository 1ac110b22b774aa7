//! Basket aggregation and leg alignment

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::BasketWeighting;
use crate::error::EngineError;
use crate::types::{finite_f64, Bar, Basket, Series};

/// One effective OHLCV bar of a leg
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LegPoint {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl LegPoint {
    /// `None` when a field has no finite f64 form
    pub fn from_bar(bar: &Bar) -> Option<Self> {
        Some(Self {
            timestamp: bar.timestamp,
            open: finite_f64(bar.open)?,
            high: finite_f64(bar.high)?,
            low: finite_f64(bar.low)?,
            close: finite_f64(bar.close)?,
            volume: finite_f64(bar.volume)?,
        })
    }

    /// A bar whose open, high, low and close all equal `price`
    pub fn flat(timestamp: DateTime<Utc>, price: f64) -> Self {
        Self {
            timestamp,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 0.0,
        }
    }
}

/// Effective bars of one side of a pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leg {
    pub name: String,
    pub points: Vec<LegPoint>,
}

impl Leg {
    /// Bars that fail f64 conversion are skipped; `Series::new` already rejects them
    pub fn from_series(series: &Series) -> Self {
        Self {
            name: series.symbol().to_string(),
            points: series.bars().iter().filter_map(LegPoint::from_bar).collect(),
        }
    }

    /// Inner-join the constituents on timestamp and combine their bars.
    ///
    /// Open, high, low and close are combined with the weighting factors;
    /// volume is the plain sum. `series` must hold one series per basket
    /// member, in member order.
    pub fn aggregate(
        basket: &Basket,
        series: &[Series],
        weighting: BasketWeighting,
    ) -> Result<Self, EngineError> {
        let members = basket.members();
        if members.len() != series.len() {
            return Err(EngineError::InvalidSeries(format!(
                "basket {basket} has {} members but {} series were supplied",
                members.len(),
                series.len()
            )));
        }

        if let [only] = series {
            if weighting != BasketWeighting::PriceSum || (members[0].weight - 1.0).abs() < f64::EPSILON {
                let mut leg = Self::from_series(only);
                leg.name = basket.to_string();
                return Ok(leg);
            }
        }

        let count = members.len() as f64;
        let total_weight: f64 = members.iter().map(|m| m.weight).sum();
        let factors: Vec<f64> = members
            .iter()
            .map(|m| match weighting {
                BasketWeighting::Equal => 1.0 / count,
                BasketWeighting::Weighted => m.weight / total_weight,
                BasketWeighting::PriceSum => m.weight,
            })
            .collect();

        let lookups: Vec<HashMap<DateTime<Utc>, LegPoint>> = series[1..]
            .iter()
            .map(|s| {
                s.bars()
                    .iter()
                    .filter_map(LegPoint::from_bar)
                    .map(|p| (p.timestamp, p))
                    .collect()
            })
            .collect();

        let points = series[0]
            .bars()
            .iter()
            .filter_map(|bar| {
                let first = LegPoint::from_bar(bar)?;
                let mut point = scaled(&first, factors[0]);
                for (lookup, factor) in lookups.iter().zip(&factors[1..]) {
                    let other = scaled(lookup.get(&bar.timestamp)?, *factor);
                    point.open += other.open;
                    point.high += other.high;
                    point.low += other.low;
                    point.close += other.close;
                    point.volume += other.volume;
                }
                Some(point)
            })
            .collect();

        Ok(Self {
            name: basket.to_string(),
            points,
        })
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

fn scaled(point: &LegPoint, factor: f64) -> LegPoint {
    LegPoint {
        timestamp: point.timestamp,
        open: point.open * factor,
        high: point.high * factor,
        low: point.low * factor,
        close: point.close * factor,
        volume: point.volume,
    }
}

/// Two legs restricted to their common timestamps
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlignedLegs {
    pub timestamps: Vec<DateTime<Utc>>,
    /// Closes
    pub long: Vec<f64>,
    pub short: Vec<f64>,
    pub long_points: Vec<LegPoint>,
    pub short_points: Vec<LegPoint>,
}

impl AlignedLegs {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// Inner join of two ascending legs
pub fn align(long: &Leg, short: &Leg) -> AlignedLegs {
    let mut out = AlignedLegs::default();
    let (mut i, mut j) = (0, 0);
    while i < long.points.len() && j < short.points.len() {
        let (l, s) = (&long.points[i], &short.points[j]);
        match l.timestamp.cmp(&s.timestamp) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.timestamps.push(l.timestamp);
                out.long.push(l.close);
                out.short.push(s.close);
                out.long_points.push(*l);
                out.short_points.push(*s);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BasketMember, Timeframe};
    use rust_decimal::Decimal;

    fn decimal(v: f64) -> Decimal {
        Decimal::from_str_exact(&format!("{:.4}", v)).unwrap()
    }

    fn series(symbol: &str, hours: &[i64], closes: &[f64]) -> Series {
        let bars = hours
            .iter()
            .zip(closes)
            .map(|(&h, &c)| {
                let price = decimal(c);
                Bar {
                    timestamp: DateTime::from_timestamp(h * 3600, 0).unwrap(),
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                    volume: Decimal::ONE,
                }
            })
            .collect();
        Series::new(symbol, Timeframe::OneHour, bars).unwrap()
    }

    /// Bars given as (open, high, low, close, volume)
    fn ohlcv(symbol: &str, rows: &[(f64, f64, f64, f64, f64)]) -> Series {
        let bars = rows
            .iter()
            .enumerate()
            .map(|(h, &(o, hi, lo, c, v))| Bar {
                timestamp: DateTime::from_timestamp(h as i64 * 3600, 0).unwrap(),
                open: decimal(o),
                high: decimal(hi),
                low: decimal(lo),
                close: decimal(c),
                volume: decimal(v),
            })
            .collect();
        Series::new(symbol, Timeframe::OneHour, bars).unwrap()
    }

    fn weighted_basket() -> Basket {
        Basket::new(vec![
            BasketMember { symbol: "AAA".into(), weight: 2.0 },
            BasketMember { symbol: "BBB".into(), weight: 0.5 },
        ])
        .unwrap()
    }

    #[test]
    fn test_equal_weighting_is_mean_over_common_bars() {
        let basket: Basket = "AAA+BBB".parse().unwrap();
        let a = series("AAA", &[0, 1, 2, 3], &[10.0, 12.0, 14.0, 16.0]);
        let b = series("BBB", &[1, 2, 3, 4], &[20.0, 22.0, 24.0, 26.0]);

        let leg = Leg::aggregate(&basket, &[a, b], BasketWeighting::Equal).unwrap();
        assert_eq!(leg.name, "AAA+BBB");
        let closes: Vec<f64> = leg.points.iter().map(|p| p.close).collect();
        assert_eq!(closes, vec![16.0, 18.0, 20.0]);
    }

    #[test]
    fn test_equal_weighting_ignores_member_weights() {
        let a = series("AAA", &[0, 1], &[10.0, 11.0]);
        let b = series("BBB", &[0, 1], &[40.0, 42.0]);
        let leg = Leg::aggregate(&weighted_basket(), &[a, b], BasketWeighting::Equal).unwrap();
        assert_eq!(leg.points[0].close, 25.0);
        assert_eq!(leg.points[1].close, 26.5);
    }

    #[test]
    fn test_weighted_mean_and_price_sum() {
        let a = series("AAA", &[0, 1], &[10.0, 11.0]);
        let b = series("BBB", &[0, 1], &[40.0, 42.0]);

        let sum = Leg::aggregate(&weighted_basket(), &[a.clone(), b.clone()], BasketWeighting::PriceSum).unwrap();
        assert_eq!(sum.points[0].close, 40.0);

        let mean = Leg::aggregate(&weighted_basket(), &[a, b], BasketWeighting::Weighted).unwrap();
        assert!((mean.points[0].close - (0.8 * 10.0 + 0.2 * 40.0)).abs() < 1e-12);
    }

    #[test]
    fn test_aggregation_combines_every_bar_field() {
        let basket: Basket = "AAA+BBB".parse().unwrap();
        let a = ohlcv("AAA", &[(10.0, 12.0, 9.0, 11.0, 5.0)]);
        let b = ohlcv("BBB", &[(20.0, 26.0, 18.0, 25.0, 7.0)]);

        let leg = Leg::aggregate(&basket, &[a, b], BasketWeighting::Equal).unwrap();
        let p = leg.points[0];
        assert_eq!((p.open, p.high, p.low, p.close), (15.0, 19.0, 13.5, 18.0));
        assert_eq!(p.volume, 12.0);
        assert!(p.high >= p.open.max(p.close) && p.low <= p.open.min(p.close));
    }

    #[test]
    fn test_single_member_is_raw_bars() {
        let basket = Basket::single("AAA");
        let a = series("AAA", &[0, 1, 2], &[1.5, 2.5, 3.5]);
        for weighting in [BasketWeighting::Equal, BasketWeighting::Weighted, BasketWeighting::PriceSum] {
            let leg = Leg::aggregate(&basket, std::slice::from_ref(&a), weighting).unwrap();
            assert_eq!(leg, Leg::from_series(&a));
        }
    }

    #[test]
    fn test_align_drops_unmatched_bars() {
        let long = Leg::from_series(&series("L", &[0, 1, 3, 4, 6], &[1.0, 2.0, 3.0, 4.0, 5.0]));
        let short = Leg::from_series(&series("S", &[1, 2, 3, 6, 7], &[9.0, 8.0, 7.0, 6.0, 5.0]));
        let aligned = align(&long, &short);
        assert_eq!(aligned.len(), 3);
        assert_eq!(aligned.long, vec![2.0, 3.0, 5.0]);
        assert_eq!(aligned.short, vec![9.0, 7.0, 6.0]);
        assert_eq!(aligned.long_points.len(), 3);
        assert_eq!(aligned.short_points[2].timestamp, aligned.timestamps[2]);
    }

    #[test]
    fn test_member_count_mismatch_is_rejected() {
        let basket: Basket = "AAA+BBB".parse().unwrap();
        let a = series("AAA", &[0], &[1.0]);
        assert!(matches!(
            Leg::aggregate(&basket, &[a], BasketWeighting::Equal),
            Err(EngineError::InvalidSeries(_))
        ));
    }
}
