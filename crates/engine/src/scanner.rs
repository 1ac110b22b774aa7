//! Discovery scanner: rank candidate pairs against a reference leg
//!
//! Reference mode pairs the reference basket (long) with every tradable symbol
//! outside it (short). Basket mode evaluates exactly one caller-supplied pair.
//! Candidates that fail to load or align to too few bars are skipped, never
//! fatal; only failures on the reference leg or the universe abort the scan.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::analysis::{compute_snapshot, MetricSnapshot};
use crate::basket::{align, Leg};
use crate::config::AnalysisConfig;
use crate::error::EngineError;
use crate::jobs::{JobControl, JobOutcome};
use crate::signal::{classify_signal, SignalThresholds};
use crate::store::{fetch_basket, TimeSeriesStore};
use crate::types::{Basket, DiscoveryWindow, PairKey, Signal};

/// Fewest aligned bars a candidate needs to be ranked
pub const MIN_SCAN_BARS: usize = 10;

/// Candidates processed between cooperative yields
const YIELD_EVERY: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ScanTarget {
    Reference { reference: Basket },
    Baskets { long: Basket, short: Basket },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRequest {
    #[serde(flatten)]
    pub target: ScanTarget,
    #[serde(default)]
    pub window: DiscoveryWindow,
    /// Restrict the reference-mode universe to one category (e.g. quote asset)
    #[serde(default)]
    pub category: Option<String>,
    /// End of the lookback; now when absent
    #[serde(default)]
    pub as_of: Option<DateTime<Utc>>,
}

impl ScanRequest {
    pub fn reference(reference: Basket, window: DiscoveryWindow) -> Self {
        Self {
            target: ScanTarget::Reference { reference },
            window,
            category: None,
            as_of: None,
        }
    }

    pub fn baskets(long: Basket, short: Basket, window: DiscoveryWindow) -> Self {
        Self {
            target: ScanTarget::Baskets { long, short },
            window,
            category: None,
            as_of: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRow {
    pub pair: PairKey,
    pub signal: Signal,
    pub snapshot: MetricSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedCandidate {
    pub symbol: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "count", rename_all = "snake_case")]
pub enum ScanCompletion {
    /// Reference leg too short, basket pair unalignable or empty universe
    NoData,
    Found(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    /// Ordered by |correlation| descending
    pub rows: Vec<ScanRow>,
    pub completion: ScanCompletion,
    pub skipped: Vec<SkippedCandidate>,
    pub window: DiscoveryWindow,
    pub generated_at: DateTime<Utc>,
}

impl ScanResult {
    fn no_data(window: DiscoveryWindow, skipped: Vec<SkippedCandidate>) -> Self {
        Self {
            rows: Vec::new(),
            completion: ScanCompletion::NoData,
            skipped,
            window,
            generated_at: Utc::now(),
        }
    }

    fn found(window: DiscoveryWindow, mut rows: Vec<ScanRow>, skipped: Vec<SkippedCandidate>) -> Self {
        rows.sort_by(|a, b| {
            b.snapshot
                .correlation
                .abs()
                .total_cmp(&a.snapshot.correlation.abs())
        });
        Self {
            completion: ScanCompletion::Found(rows.len()),
            rows,
            skipped,
            window,
            generated_at: Utc::now(),
        }
    }
}

fn make_row(pair: PairKey, long: &Leg, short: &Leg, request: &ScanRequest, config: &AnalysisConfig) -> ScanRow {
    let snapshot = compute_snapshot(&pair, request.window.timeframe(), long, short, config);
    let signal = classify_signal(&snapshot, &SignalThresholds::from(config));
    ScanRow {
        pair,
        signal,
        snapshot,
    }
}

/// Run one scan to completion, polling `control` between candidates
pub async fn run_scan(
    store: &dyn TimeSeriesStore,
    request: &ScanRequest,
    config: &AnalysisConfig,
    control: &JobControl,
) -> Result<JobOutcome<ScanResult>, EngineError> {
    let end = request.as_of.unwrap_or_else(Utc::now);
    let start = end - request.window.lookback();
    let timeframe = request.window.timeframe();
    let weighting = config.basket_weighting;

    match &request.target {
        ScanTarget::Baskets { long, short } => {
            info!(long = %long, short = %short, window = %request.window, "Starting basket scan");
            control.set_total(1);

            let long_leg = fetch_basket(store, long, timeframe, start, end, weighting).await?;
            let short_leg = fetch_basket(store, short, timeframe, start, end, weighting).await?;
            if control.is_cancelled() {
                return Ok(JobOutcome::Cancelled);
            }
            control.advance();

            let aligned = align(&long_leg, &short_leg).len();
            if aligned < MIN_SCAN_BARS {
                info!(aligned, "Basket pair has too little overlapping data");
                return Ok(JobOutcome::Completed(ScanResult::no_data(request.window, Vec::new())));
            }

            let pair = PairKey::new(long.clone(), short.clone());
            let row = make_row(pair, &long_leg, &short_leg, request, config);
            Ok(JobOutcome::Completed(ScanResult::found(request.window, vec![row], Vec::new())))
        }
        ScanTarget::Reference { reference } => {
            let reference_leg = fetch_basket(store, reference, timeframe, start, end, weighting).await?;
            let universe = store
                .list_tradable_symbols(request.category.as_deref())
                .await?;
            let candidates: Vec<String> = universe
                .into_iter()
                .filter(|s| !reference.contains(s))
                .collect();

            info!(
                reference = %reference,
                window = %request.window,
                category = request.category.as_deref().unwrap_or("all"),
                candidates = candidates.len(),
                reference_bars = reference_leg.len(),
                "Starting reference scan"
            );

            if candidates.is_empty() || reference_leg.len() < MIN_SCAN_BARS {
                return Ok(JobOutcome::Completed(ScanResult::no_data(request.window, Vec::new())));
            }

            control.set_total(candidates.len());
            let mut rows = Vec::new();
            let mut skipped = Vec::new();

            for (idx, symbol) in candidates.iter().enumerate() {
                if control.is_cancelled() {
                    info!(processed = idx, "Scan cancelled");
                    return Ok(JobOutcome::Cancelled);
                }

                match store.fetch_series(symbol, timeframe, start, end).await {
                    Ok(series) => {
                        let leg = Leg::from_series(&series);
                        let aligned = align(&reference_leg, &leg).len();
                        if aligned < MIN_SCAN_BARS {
                            warn!(symbol = %symbol, aligned, "Too few aligned bars, skipping");
                            skipped.push(SkippedCandidate {
                                symbol: symbol.clone(),
                                reason: format!("only {aligned} aligned bars"),
                            });
                        } else {
                            let pair = PairKey::new(reference.clone(), Basket::single(symbol.as_str()));
                            let row = make_row(pair, &reference_leg, &leg, request, config);
                            debug!(
                                pair = %row.pair,
                                correlation = row.snapshot.correlation,
                                cointegrated = row.snapshot.cointegration.cointegrated,
                                signal = %row.signal,
                                "Scanned candidate"
                            );
                            rows.push(row);
                        }
                    }
                    Err(e) => {
                        warn!(symbol = %symbol, error = %e, "Failed to fetch candidate, skipping");
                        skipped.push(SkippedCandidate {
                            symbol: symbol.clone(),
                            reason: e.to_string(),
                        });
                    }
                }

                control.advance();
                if idx % YIELD_EVERY == YIELD_EVERY - 1 {
                    tokio::task::yield_now().await;
                }
            }

            info!(rows = rows.len(), skipped = skipped.len(), "Scan complete");
            Ok(JobOutcome::Completed(ScanResult::found(request.window, rows, skipped)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::types::{Bar, Series, Timeframe};
    use chrono::Duration;
    use rust_decimal::prelude::FromPrimitive;
    use rust_decimal::Decimal;
    use std::collections::BTreeSet;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn make_series(symbol: &str, closes: impl Iterator<Item = f64>) -> Series {
        let bars = closes
            .enumerate()
            .map(|(i, c)| {
                let price = Decimal::from_f64(c).unwrap().round_dp(6);
                Bar {
                    timestamp: t0() + Duration::hours(i as i64),
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

    fn reference_price(i: usize) -> f64 {
        100.0 + 10.0 * (i as f64 * 0.3).sin() + i as f64 * 0.1
    }

    fn populated_store() -> InMemoryStore {
        let store = InMemoryStore::new();
        store.insert(make_series("REFUSDT", (0..40).map(reference_price)), Some("USDT"));
        store.insert(make_series("AAAUSDT", (0..40).map(|i| 2.0 * reference_price(i))), Some("USDT"));
        store.insert(
            make_series("BBBUSDT", (0..40).map(|i| 50.0 + 5.0 * (i as f64 * 0.7).cos())),
            Some("USDT"),
        );
        store.insert(make_series("CCCUSDT", (0..5).map(|i| 10.0 + i as f64)), Some("USDT"));
        store.insert(make_series("DDDBTC", (0..40).map(|i| 0.01 + i as f64 * 1e-4)), Some("BTC"));
        store
    }

    fn request(target: ScanTarget) -> ScanRequest {
        ScanRequest {
            target,
            window: DiscoveryWindow::SevenDays,
            category: Some("USDT".to_string()),
            as_of: Some(t0() + Duration::hours(39)),
        }
    }

    fn reference_request(symbol: &str) -> ScanRequest {
        request(ScanTarget::Reference {
            reference: Basket::single(symbol),
        })
    }

    #[tokio::test]
    async fn test_reference_scan_ranks_by_abs_correlation() {
        let store = populated_store();
        let result = run_scan(&store, &reference_request("REFUSDT"), &AnalysisConfig::default(), &JobControl::new())
            .await
            .unwrap()
            .completed()
            .unwrap();

        assert_eq!(result.completion, ScanCompletion::Found(2));
        assert_eq!(result.rows[0].pair.to_string(), "REFUSDT/AAAUSDT");
        assert!(result.rows[0].snapshot.correlation > 0.999);
        assert!(result.rows[0].snapshot.correlation.abs() >= result.rows[1].snapshot.correlation.abs());

        // the reference itself and other categories are not candidates
        let shorts: BTreeSet<String> = result.rows.iter().map(|r| r.pair.short.to_string()).collect();
        assert!(!shorts.contains("REFUSDT"));
        assert!(!shorts.contains("DDDBTC"));

        assert_eq!(result.skipped.len(), 1);
        assert_eq!(result.skipped[0].symbol, "CCCUSDT");
    }

    #[tokio::test]
    async fn test_reference_scan_without_candidates_is_no_data() {
        let store = InMemoryStore::new();
        store.insert(make_series("REFUSDT", (0..40).map(reference_price)), Some("USDT"));
        let result = run_scan(&store, &reference_request("REFUSDT"), &AnalysisConfig::default(), &JobControl::new())
            .await
            .unwrap()
            .completed()
            .unwrap();
        assert_eq!(result.completion, ScanCompletion::NoData);
        assert!(result.rows.is_empty());
    }

    #[tokio::test]
    async fn test_short_reference_is_no_data() {
        let store = populated_store();
        let result = run_scan(&store, &reference_request("CCCUSDT"), &AnalysisConfig::default(), &JobControl::new())
            .await
            .unwrap()
            .completed()
            .unwrap();
        assert_eq!(result.completion, ScanCompletion::NoData);
    }

    #[tokio::test]
    async fn test_basket_scan_yields_single_row() {
        let store = populated_store();
        let req = request(ScanTarget::Baskets {
            long: "AAAUSDT+BBBUSDT".parse().unwrap(),
            short: Basket::single("REFUSDT"),
        });
        let result = run_scan(&store, &req, &AnalysisConfig::default(), &JobControl::new())
            .await
            .unwrap()
            .completed()
            .unwrap();
        assert_eq!(result.completion, ScanCompletion::Found(1));
        assert_eq!(result.rows[0].pair.to_string(), "AAAUSDT+BBBUSDT/REFUSDT");
        assert_eq!(result.rows[0].snapshot.bars, 40);

        let req = request(ScanTarget::Baskets {
            long: Basket::single("CCCUSDT"),
            short: Basket::single("REFUSDT"),
        });
        let result = run_scan(&store, &req, &AnalysisConfig::default(), &JobControl::new())
            .await
            .unwrap()
            .completed()
            .unwrap();
        assert_eq!(result.completion, ScanCompletion::NoData);
    }

    #[tokio::test]
    async fn test_cancelled_scan_returns_cancelled() {
        let store = populated_store();
        let control = JobControl::new();
        control.cancel();
        let outcome = run_scan(&store, &reference_request("REFUSDT"), &AnalysisConfig::default(), &control)
            .await
            .unwrap();
        assert!(outcome.is_cancelled());
    }

    #[tokio::test]
    async fn test_progress_counts_candidates() {
        let store = populated_store();
        let control = JobControl::new();
        run_scan(&store, &reference_request("REFUSDT"), &AnalysisConfig::default(), &control)
            .await
            .unwrap();
        let progress = control.progress();
        assert_eq!(progress.total, 3);
        assert_eq!(progress.completed, 3);
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let req: ScanRequest = serde_json::from_str(r#"{"mode":"reference","reference":"btcusdt"}"#).unwrap();
        assert_eq!(
            req.target,
            ScanTarget::Reference {
                reference: Basket::single("BTCUSDT")
            }
        );
        assert_eq!(req.window, DiscoveryWindow::SevenDays);
        assert!(req.category.is_none());

        let req: ScanRequest =
            serde_json::from_str(r#"{"mode":"baskets","long":"ETHUSDT+SOLUSDT","short":"BTCUSDT","window":"60d"}"#)
                .unwrap();
        assert!(matches!(req.target, ScanTarget::Baskets { .. }));
        assert_eq!(req.window, DiscoveryWindow::SixtyDays);
    }
}
