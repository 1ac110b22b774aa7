//! Pair metrics engine
//!
//! Pure transformation of two price legs into a [`MetricSnapshot`]: alignment,
//! hedge ratio, spread, z-score, cointegration, half-life, rolling correlation
//! and beta, spread volatility, ratio changes and ratio bands.
//!
//! The z-score at bar i uses a hedge ratio fitted on the trailing window
//! ending at i, so appending history never rewrites earlier values.

use std::f64::consts::LN_2;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};
use ta::indicators::{BollingerBands, ExponentialMovingAverage};
use ta::Next;
use tracing::debug;

use crate::basket::{align, Leg, LegPoint};
use crate::cointegration::{engle_granger, CointegrationResult};
use crate::config::AnalysisConfig;
use crate::stats::{
    linear_regression, log_returns, pct_changes, pearson, rolling_hedge, rolling_pearson,
    rolling_std, sample_std,
};
use crate::types::{PairKey, Timeframe};

/// Spread std below this fraction of the mean long price counts as flat
const FLAT_TOLERANCE: f64 = 1e-9;
const BOLLINGER_MULTIPLIER: f64 = 2.0;
const BETA_CONFIDENCE_QUANTILE: f64 = 0.975;

/// Aligned per-bar series published with a snapshot. `None` marks warm-up or
/// otherwise undefined points.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSeries {
    pub timestamps: Vec<DateTime<Utc>>,
    pub long_price: Vec<f64>,
    pub short_price: Vec<f64>,
    /// Base-100 index of each leg (first aligned value = 100)
    pub long_index: Vec<f64>,
    pub short_index: Vec<f64>,
    pub ratio: Vec<f64>,
    /// Long − β·short with β fitted on the whole range
    pub spread: Vec<Option<f64>>,
    /// Hedge ratio fitted on the trailing window ending at each bar
    pub rolling_hedge_ratio: Vec<Option<f64>>,
    pub zscore: Vec<Option<f64>>,
    pub rolling_correlation: Vec<Option<f64>>,
    pub rolling_beta: Vec<Option<f64>>,
    pub beta_lower: Vec<Option<f64>>,
    pub beta_upper: Vec<Option<f64>>,
    pub volatility: Vec<Option<f64>>,
    pub ratio_ema: Vec<Option<f64>>,
    pub ratio_upper_band: Vec<Option<f64>>,
    pub ratio_lower_band: Vec<Option<f64>>,
    pub spread_candles: Vec<SpreadCandle>,
}

/// Long − short price difference as an OHLC bar, in percent of the first
/// bar's close difference
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpreadCandle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Every metric for one pair at one timeframe, as of the last aligned bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub pair: PairKey,
    pub timeframe: Timeframe,
    pub as_of: Option<DateTime<Utc>>,
    pub bars: usize,
    /// Reported as 0 when undefined; see `correlation_defined`
    pub correlation: f64,
    pub correlation_defined: bool,
    pub cointegration: CointegrationResult,
    pub hedge_ratio: Option<f64>,
    pub current_ratio: Option<f64>,
    pub current_spread: Option<f64>,
    pub zscore: Option<f64>,
    pub half_life_days: Option<f64>,
    /// Annualized spread volatility over the whole window, in percent
    pub volatility: Option<f64>,
    pub change_24h: Option<f64>,
    pub change_7d: Option<f64>,
    pub series: MetricSeries,
}

/// Compute the full snapshot for `pair` from its two legs
pub fn compute_snapshot(
    pair: &PairKey,
    timeframe: Timeframe,
    long: &Leg,
    short: &Leg,
    config: &AnalysisConfig,
) -> MetricSnapshot {
    let aligned = align(long, short);
    let n = aligned.len();
    let window = config.rolling_window;
    let (l, s) = (&aligned.long, &aligned.short);

    let tolerance = FLAT_TOLERANCE * l.iter().map(|p| p.abs()).sum::<f64>() / n.max(1) as f64;

    let ratio: Vec<f64> = l.iter().zip(s).map(|(a, b)| a / b).collect();

    let fit = linear_regression(s, l);
    let hedge_ratio = fit.as_ref().map(|f| f.slope);
    let spread_values: Option<Vec<f64>> =
        hedge_ratio.map(|beta| l.iter().zip(s).map(|(a, b)| a - beta * b).collect());

    let (spread, volatility, whole_volatility, half_life_days) = match &spread_values {
        Some(values) => {
            let (rolling, whole) =
                spread_volatility(values, window, tolerance, timeframe.periods_per_year());
            let half_life = half_life_bars(values).map(|bars| {
                bars * timeframe.bar_duration().num_seconds() as f64 / 86_400.0
            });
            (values.iter().copied().map(Some).collect(), rolling, whole, half_life)
        }
        None => (vec![None; n], vec![None; n], None, None),
    };
    let hedge = rolling_hedge(s, l, window, FLAT_TOLERANCE);
    let spread_candles = spread_candles(&aligned.long_points, &aligned.short_points);

    let correlation = if config.correlation_on_returns {
        pearson(&log_returns(l), &log_returns(s))
    } else {
        pearson(l, s)
    };

    let cointegration = engle_granger(l, s, config.cointegration_p_max);
    let (rolling_beta, beta_lower, beta_upper) = rolling_beta(l, s, window);
    let (ratio_ema, ratio_upper_band, ratio_lower_band) = ratio_bands(&ratio, window);

    let rolling_correlation = rolling_pearson(l, s, window);
    let (long_index, short_index) = (base_100(l), base_100(s));

    let as_of = aligned.timestamps.last().copied();
    let change_24h = ratio_change(&aligned.timestamps, &ratio, Duration::hours(24));
    let change_7d = ratio_change(&aligned.timestamps, &ratio, Duration::days(7));

    debug!(
        pair = %pair,
        timeframe = %timeframe,
        bars = n,
        correlation = ?correlation,
        p_value = cointegration.p_value,
        "Computed pair snapshot"
    );

    MetricSnapshot {
        pair: pair.clone(),
        timeframe,
        as_of,
        bars: n,
        correlation: correlation.unwrap_or(0.0),
        correlation_defined: correlation.is_some(),
        cointegration,
        hedge_ratio,
        current_ratio: ratio.last().copied(),
        current_spread: spread.last().copied().flatten(),
        zscore: hedge.zscore.last().copied().flatten(),
        half_life_days,
        volatility: whole_volatility,
        change_24h,
        change_7d,
        series: MetricSeries {
            timestamps: aligned.timestamps,
            long_price: aligned.long,
            short_price: aligned.short,
            long_index,
            short_index,
            ratio,
            rolling_correlation,
            spread,
            rolling_hedge_ratio: hedge.slope,
            zscore: hedge.zscore,
            rolling_beta,
            beta_lower,
            beta_upper,
            volatility,
            ratio_ema,
            ratio_upper_band,
            ratio_lower_band,
            spread_candles,
        },
    }
}

fn base_100(prices: &[f64]) -> Vec<f64> {
    match prices.first() {
        Some(&first) if first != 0.0 => prices.iter().map(|p| p / first * 100.0).collect(),
        _ => Vec::new(),
    }
}

/// High and low bound the difference over the bar: long high − short low and
/// long low − short high. Empty when the first close difference is zero.
fn spread_candles(long: &[LegPoint], short: &[LegPoint]) -> Vec<SpreadCandle> {
    let Some(base) = long.first().zip(short.first()).map(|(l, s)| (l.close - s.close).abs()) else {
        return Vec::new();
    };
    if base == 0.0 {
        return Vec::new();
    }
    let pct = |v: f64| v / base * 100.0;
    long.iter()
        .zip(short)
        .map(|(l, s)| SpreadCandle {
            timestamp: l.timestamp,
            open: pct(l.open - s.open),
            high: pct(l.high - s.low),
            low: pct(l.low - s.high),
            close: pct(l.close - s.close),
        })
        .collect()
}

/// Mean-reversion half-life in bars from `Δsₜ = a + λ·sₜ₋₁`.
/// Defined only for λ in (−1, 0).
pub fn half_life_bars(spread: &[f64]) -> Option<f64> {
    if spread.len() < 3 {
        return None;
    }
    let lagged = &spread[..spread.len() - 1];
    let delta: Vec<f64> = spread.windows(2).map(|w| w[1] - w[0]).collect();
    let lambda = linear_regression(lagged, &delta)?.slope;
    if lambda <= -1.0 || lambda >= 0.0 {
        return None;
    }
    let half_life = -LN_2 / (1.0 + lambda).ln();
    half_life.is_finite().then_some(half_life)
}

/// Rolling and whole-window annualized volatility of spread returns, in percent
fn spread_volatility(
    spread: &[f64],
    window: usize,
    tolerance: f64,
    periods_per_year: f64,
) -> (Vec<Option<f64>>, Option<f64>) {
    let scale = periods_per_year.sqrt() * 100.0;
    let returns = pct_changes(spread, tolerance);

    let mut rolling = vec![None; spread.len()];
    for (k, sd) in rolling_std(&returns, window).into_iter().enumerate() {
        rolling[k + 1] = sd.map(|v| v * scale);
    }

    let whole = returns
        .iter()
        .copied()
        .collect::<Option<Vec<f64>>>()
        .and_then(|r| sample_std(&r))
        .map(|v| v * scale);

    (rolling, whole)
}

type BetaBands = (Vec<Option<f64>>, Vec<Option<f64>>, Vec<Option<f64>>);

/// Rolling OLS slope of long returns on short returns with a 95% interval.
/// The first `window` bars are undefined since returns start at bar 1.
fn rolling_beta(long: &[f64], short: &[f64], window: usize) -> BetaBands {
    let n = long.len();
    let mut beta = vec![None; n];
    let mut lower = vec![None; n];
    let mut upper = vec![None; n];
    if window < 3 || n <= window {
        return (beta, lower, upper);
    }

    let t_crit = StudentsT::new(0.0, 1.0, (window - 2) as f64)
        .map(|t| t.inverse_cdf(BETA_CONFIDENCE_QUANTILE))
        .ok();
    let long_ret = pct_changes(long, 0.0);
    let short_ret = pct_changes(short, 0.0);

    for i in window..n {
        let range = i - window..i;
        let x: Option<Vec<f64>> = short_ret[range.clone()].iter().copied().collect();
        let y: Option<Vec<f64>> = long_ret[range].iter().copied().collect();
        let (Some(x), Some(y)) = (x, y) else {
            continue;
        };
        let Some(fit) = linear_regression(&x, &y) else {
            continue;
        };
        beta[i] = Some(fit.slope);
        if let (Some(se), Some(t)) = (fit.slope_std_err, t_crit) {
            lower[i] = Some(fit.slope - t * se);
            upper[i] = Some(fit.slope + t * se);
        }
    }
    (beta, lower, upper)
}

type RatioBands = (Vec<Option<f64>>, Vec<Option<f64>>, Vec<Option<f64>>);

/// EMA of the ratio and its Bollinger bands (window, 2σ)
fn ratio_bands(ratio: &[f64], window: usize) -> RatioBands {
    let n = ratio.len();
    let (Ok(mut ema), Ok(mut bands)) = (
        ExponentialMovingAverage::new(window),
        BollingerBands::new(window, BOLLINGER_MULTIPLIER),
    ) else {
        return (vec![None; n], vec![None; n], vec![None; n]);
    };

    let mut ema_out = Vec::with_capacity(n);
    let mut upper = Vec::with_capacity(n);
    let mut lower = Vec::with_capacity(n);
    for (i, &r) in ratio.iter().enumerate() {
        ema_out.push(Some(ema.next(r)));
        let out = bands.next(r);
        let warm = i + 1 >= window;
        upper.push(warm.then_some(out.upper));
        lower.push(warm.then_some(out.lower));
    }
    (ema_out, upper, lower)
}

/// Percent change of the ratio since the last bar at or before `as_of − lag`
fn ratio_change(timestamps: &[DateTime<Utc>], ratio: &[f64], lag: Duration) -> Option<f64> {
    let as_of = *timestamps.last()?;
    let target = as_of - lag;
    let idx = timestamps.partition_point(|t| *t <= target).checked_sub(1)?;
    let (then, now) = (ratio[idx], *ratio.last()?);
    if then == 0.0 {
        return None;
    }
    let change = (now / then - 1.0) * 100.0;
    change.is_finite().then_some(change)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hour(i: usize) -> DateTime<Utc> {
        DateTime::from_timestamp(i as i64 * 3600, 0).unwrap()
    }

    fn leg(name: &str, prices: &[f64]) -> Leg {
        Leg {
            name: name.to_string(),
            points: prices
                .iter()
                .enumerate()
                .map(|(i, &price)| LegPoint::flat(hour(i), price))
                .collect(),
        }
    }

    fn scenario_prices(n: usize) -> Vec<f64> {
        let pattern = [100.0, 102.0, 99.0, 101.0];
        (0..n)
            .map(|i| pattern[i % 4] + (i / 4) as f64 * 0.5)
            .collect()
    }

    fn wavy(n: usize, phase: f64) -> Vec<f64> {
        (0..n)
            .map(|i| 50.0 + (i as f64 * 0.3 + phase).sin() * 2.0 + (i as f64 * 0.07).cos())
            .collect()
    }

    #[test]
    fn test_half_scaled_pair_scenario() {
        let a = scenario_prices(100);
        let b: Vec<f64> = a.iter().map(|p| p / 2.0).collect();
        let pair: PairKey = "AAA/BBB".parse().unwrap();

        let snap = compute_snapshot(
            &pair,
            Timeframe::OneHour,
            &leg("AAA", &a),
            &leg("BBB", &b),
            &AnalysisConfig::default(),
        );

        assert_eq!(snap.bars, 100);
        assert!(snap.correlation_defined);
        assert!((snap.correlation - 1.0).abs() < 1e-9);
        assert!(snap.series.ratio.iter().all(|r| (r - 2.0).abs() < 1e-12));
        assert!((snap.hedge_ratio.unwrap() - 2.0).abs() < 1e-9);
        for z in snap.series.zscore.iter().flatten() {
            assert!(z.abs() < 1e-6);
        }
        assert_eq!(snap.series.zscore.iter().filter(|z| z.is_some()).count(), 81);
        assert_eq!(snap.series.long_index[0], 100.0);
    }

    #[test]
    fn test_warmup_points_are_undefined() {
        let a = wavy(80, 0.0);
        let b = wavy(80, 0.4);
        let pair: PairKey = "AAA/BBB".parse().unwrap();
        let config = AnalysisConfig::default();
        let snap = compute_snapshot(&pair, Timeframe::OneHour, &leg("A", &a), &leg("B", &b), &config);

        let w = config.rolling_window;
        assert!(snap.series.zscore[..w - 1].iter().all(|z| z.is_none()));
        assert!(snap.series.zscore[w - 1].is_some());
        assert!(snap.series.rolling_beta[..w].iter().all(|b| b.is_none()));
        assert!(snap.series.rolling_beta[w].is_some());
        assert!(snap.series.beta_lower[w].unwrap() <= snap.series.rolling_beta[w].unwrap());
        assert!(snap.series.beta_upper[w].unwrap() >= snap.series.rolling_beta[w].unwrap());
        assert!(snap.series.ratio_upper_band[w - 2].is_none());
        assert!(snap.series.ratio_upper_band[w - 1].is_some());
        assert!(snap.series.ratio_ema[0].is_some());
        assert!(snap.series.volatility[..w].iter().all(|v| v.is_none()));
        assert!(snap.series.volatility[w].unwrap() > 0.0);
        assert!(snap.volatility.unwrap() > 0.0);
    }

    #[test]
    fn test_empty_and_short_legs_yield_partial_snapshot() {
        let pair: PairKey = "AAA/BBB".parse().unwrap();
        let config = AnalysisConfig::default();
        let empty = compute_snapshot(&pair, Timeframe::OneHour, &leg("A", &[]), &leg("B", &[]), &config);
        assert_eq!(empty.bars, 0);
        assert!(empty.as_of.is_none());
        assert!(!empty.correlation_defined);
        assert_eq!(empty.correlation, 0.0);
        assert!(!empty.cointegration.cointegrated);

        let a = wavy(8, 0.0);
        let b = wavy(8, 1.0);
        let short = compute_snapshot(&pair, Timeframe::OneHour, &leg("A", &a), &leg("B", &b), &config);
        assert_eq!(short.bars, 8);
        assert!(short.zscore.is_none());
        assert!(short.change_24h.is_none());
        assert_eq!(short.cointegration.p_value, 1.0);
    }

    #[test]
    fn test_half_life_of_geometric_decay() {
        let spread = [16.0, 8.0, 4.0, 2.0, 1.0, 0.5, 0.25, 0.125];
        let hl = half_life_bars(&spread).unwrap();
        assert!((hl - 1.0).abs() < 1e-9);

        let trending: Vec<f64> = (0..30).map(|i| 1.1f64.powi(i)).collect();
        assert!(half_life_bars(&trending).is_none());
    }

    #[test]
    fn test_ratio_changes_use_timestamp_lookup() {
        let n = 200;
        let b = vec![10.0; n];
        let a: Vec<f64> = (0..n).map(|i| 10.0 + i as f64 * 0.1).collect();
        let pair: PairKey = "AAA/BBB".parse().unwrap();
        let snap = compute_snapshot(
            &pair,
            Timeframe::OneHour,
            &leg("A", &a),
            &leg("B", &b),
            &AnalysisConfig::default(),
        );

        let ratio = &snap.series.ratio;
        let expected_24h = (ratio[n - 1] / ratio[n - 25] - 1.0) * 100.0;
        assert!((snap.change_24h.unwrap() - expected_24h).abs() < 1e-9);
        // 7 days = 168 bars back, still inside 200 bars of history
        let expected_7d = (ratio[n - 1] / ratio[n - 169] - 1.0) * 100.0;
        assert!((snap.change_7d.unwrap() - expected_7d).abs() < 1e-9);
        // a flat short leg makes the hedge regression degenerate
        assert!(snap.hedge_ratio.is_none());
        assert!(snap.zscore.is_none());
        assert!(!snap.correlation_defined);
    }

    #[test]
    fn test_zscore_ignores_bars_before_the_window() {
        let n = 200;
        let a: Vec<f64> = (0..n).map(|i| 100.0 + (i as f64 * 0.21).sin() * 4.0 + i as f64 * 0.05).collect();
        let b: Vec<f64> = (0..n).map(|i| 50.0 + (i as f64 * 0.17).cos() * 2.0 + i as f64 * 0.02).collect();
        let pair: PairKey = "AAA/BBB".parse().unwrap();
        let config = AnalysisConfig::default();
        let w = config.rolling_window;

        let full = compute_snapshot(&pair, Timeframe::OneHour, &leg("A", &a), &leg("B", &b), &config);
        let tail_leg = |name: &str, prices: &[f64]| Leg {
            name: name.to_string(),
            points: (100..n).map(|i| LegPoint::flat(hour(i), prices[i])).collect(),
        };
        let tail = compute_snapshot(&pair, Timeframe::OneHour, &tail_leg("A", &a), &tail_leg("B", &b), &config);

        assert_eq!(tail.bars, 100);
        for i in w - 1..tail.bars {
            let z_tail = tail.series.zscore[i].unwrap();
            let z_full = full.series.zscore[i + 100].unwrap();
            assert!((z_tail - z_full).abs() < 1e-9, "bar {i}: {z_tail} vs {z_full}");
            let beta_tail = tail.series.rolling_hedge_ratio[i].unwrap();
            assert!((beta_tail - full.series.rolling_hedge_ratio[i + 100].unwrap()).abs() < 1e-9);
        }
        assert!((tail.zscore.unwrap() - full.zscore.unwrap()).abs() < 1e-9);
        // the whole-range hedge does depend on history
        assert!((tail.hedge_ratio.unwrap() - full.hedge_ratio.unwrap()).abs() > 1e-6);
    }

    #[test]
    fn test_spread_candles_bound_the_bar() {
        let long = Leg {
            name: "A".into(),
            points: vec![
                LegPoint { timestamp: hour(0), open: 110.0, high: 112.0, low: 108.0, close: 110.0, volume: 1.0 },
                LegPoint { timestamp: hour(1), open: 111.0, high: 115.0, low: 109.0, close: 114.0, volume: 1.0 },
            ],
        };
        let short = Leg {
            name: "B".into(),
            points: vec![
                LegPoint { timestamp: hour(0), open: 100.0, high: 101.0, low: 99.0, close: 100.0, volume: 1.0 },
                LegPoint { timestamp: hour(1), open: 100.0, high: 104.0, low: 98.0, close: 103.0, volume: 1.0 },
            ],
        };
        let pair: PairKey = "AAA/BBB".parse().unwrap();
        let snap = compute_snapshot(&pair, Timeframe::OneHour, &long, &short, &AnalysisConfig::default());

        let candles = &snap.series.spread_candles;
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].close, 100.0);
        assert_eq!(candles[1].open, 110.0);
        assert_eq!(candles[1].close, 110.0);
        assert_eq!((candles[1].high, candles[1].low), (170.0, 50.0));
        for c in candles {
            assert!(c.high >= c.open.max(c.close));
            assert!(c.low <= c.open.min(c.close));
        }

        let flat = compute_snapshot(&pair, Timeframe::OneHour, &leg("A", &[5.0, 6.0]), &leg("B", &[5.0, 4.0]), &AnalysisConfig::default());
        assert!(flat.series.spread_candles.is_empty());
    }

    #[test]
    fn test_correlation_on_returns() {
        let a = wavy(60, 0.0);
        let b: Vec<f64> = a.iter().map(|p| p * 3.0).collect();
        let pair: PairKey = "AAA/BBB".parse().unwrap();
        let config = AnalysisConfig {
            correlation_on_returns: true,
            ..Default::default()
        };
        let snap = compute_snapshot(&pair, Timeframe::FourHours, &leg("A", &a), &leg("B", &b), &config);
        assert!((snap.correlation - 1.0).abs() < 1e-9);
    }
}
