//! Engine facade: metrics, scans, backtests and the watchlist over one store
//!
//! Each kind of work owns a `JobSlot`. Starting a job supersedes whatever the
//! slot was running; only the newest job may publish its result.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::analysis::{compute_snapshot, MetricSnapshot};
use crate::backtest::{spread_points, BacktestEngine, BacktestReport, BacktestRequest};
use crate::catalog::{PairCatalog, SavedBasket};
use crate::config::AnalysisConfig;
use crate::error::EngineError;
use crate::jobs::{JobControl, JobOutcome, JobProgress, JobSlot, JobState};
use crate::scanner::{run_scan, ScanRequest, ScanResult, ScanRow, SkippedCandidate, MIN_SCAN_BARS};
use crate::signal::{classify_signal, SignalThresholds};
use crate::store::{fetch_basket, TimeSeriesStore};
use crate::table::{ScanTable, SortColumn, SortOrder};
use crate::types::{Basket, PairKey, Signal, Timeframe};

/// Metrics for every watched pair, strongest |z| first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchlistRefresh {
    pub timeframe: Timeframe,
    pub rows: Vec<ScanRow>,
    /// Pairs that failed to load or aligned to too few bars
    pub skipped: Vec<SkippedCandidate>,
    pub generated_at: DateTime<Utc>,
}

pub struct PairsService {
    store: Arc<dyn TimeSeriesStore>,
    catalog: Option<PairCatalog>,
    config: AnalysisConfig,
    analysis: JobSlot<MetricSnapshot>,
    discovery: JobSlot<ScanResult>,
    backtest: JobSlot<BacktestReport>,
}

impl PairsService {
    pub fn new(store: Arc<dyn TimeSeriesStore>, config: AnalysisConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            store,
            catalog: None,
            config,
            analysis: JobSlot::new("analysis"),
            discovery: JobSlot::new("discovery"),
            backtest: JobSlot::new("backtest"),
        })
    }

    /// Attach the watchlist and saved baskets
    pub fn with_catalog(mut self, catalog: PairCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    fn catalog(&self) -> Result<&PairCatalog, EngineError> {
        self.catalog
            .as_ref()
            .ok_or_else(|| EngineError::InvalidConfig("no watchlist database attached".to_string()))
    }

    pub async fn symbols(&self, category: Option<&str>) -> Result<BTreeSet<String>, EngineError> {
        self.store.list_tradable_symbols(category).await
    }

    // ========================================================================
    // Analysis
    // ========================================================================

    /// Snapshot over the timeframe's default lookback ending at `as_of` (now)
    pub async fn compute_metrics(
        &self,
        pair: &PairKey,
        timeframe: Timeframe,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<MetricSnapshot, EngineError> {
        let end = as_of.unwrap_or_else(Utc::now);
        let start = end - timeframe.default_lookback();
        let weighting = self.config.basket_weighting;

        let long = fetch_basket(self.store.as_ref(), &pair.long, timeframe, start, end, weighting).await?;
        let short = fetch_basket(self.store.as_ref(), &pair.short, timeframe, start, end, weighting).await?;

        let pair = pair.clone();
        let config = self.config.clone();
        let snapshot = tokio::task::spawn_blocking(move || {
            compute_snapshot(&pair, timeframe, &long, &short, &config)
        })
        .await?;

        info!(
            pair = %snapshot.pair,
            timeframe = %timeframe,
            bars = snapshot.bars,
            correlation = snapshot.correlation,
            zscore = ?snapshot.zscore,
            "Computed pair metrics"
        );
        Ok(snapshot)
    }

    pub fn submit_analysis(
        self: &Arc<Self>,
        pair: PairKey,
        timeframe: Timeframe,
        as_of: Option<DateTime<Utc>>,
    ) -> u64 {
        let ticket = self.analysis.begin();
        let sequence = ticket.sequence;
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let result = service
                .compute_metrics(&pair, timeframe, as_of)
                .await
                .map(|snapshot| {
                    if ticket.control.is_cancelled() {
                        JobOutcome::Cancelled
                    } else {
                        JobOutcome::Completed(snapshot)
                    }
                });
            service.analysis.publish(&ticket, &result);
        });
        sequence
    }

    pub fn cancel_analysis(&self) -> bool {
        self.analysis.cancel()
    }

    pub fn analysis_state(&self) -> JobState<MetricSnapshot> {
        self.analysis.state()
    }

    pub fn classify_signal(&self, snapshot: &MetricSnapshot) -> Signal {
        classify_signal(snapshot, &SignalThresholds::from(&self.config))
    }

    // ========================================================================
    // Discovery
    // ========================================================================

    /// Run a scan in the caller's task, superseding any scan in flight
    pub async fn scan(&self, request: ScanRequest) -> Result<JobOutcome<ScanResult>, EngineError> {
        let ticket = self.discovery.begin();
        let result = run_scan(self.store.as_ref(), &request, &self.config, &ticket.control).await;
        self.discovery.publish(&ticket, &result);
        result
    }

    pub fn submit_scan(self: &Arc<Self>, request: ScanRequest) -> u64 {
        let ticket = self.discovery.begin();
        let sequence = ticket.sequence;
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let result = run_scan(service.store.as_ref(), &request, &service.config, &ticket.control).await;
            if let Err(e) = &result {
                warn!(error = %e, "Scan failed");
            }
            service.discovery.publish(&ticket, &result);
        });
        sequence
    }

    pub fn cancel_scan(&self) -> bool {
        self.discovery.cancel()
    }

    pub fn scan_state(&self) -> JobState<ScanResult> {
        self.discovery.state()
    }

    pub fn scan_progress(&self) -> Option<JobProgress> {
        self.discovery.progress()
    }

    // ========================================================================
    // Watchlist & saved baskets
    // ========================================================================

    /// Parse a pair key; `@name` legs resolve to saved baskets when a catalog
    /// is attached
    pub async fn resolve_pair(&self, text: &str) -> Result<PairKey, EngineError> {
        match &self.catalog {
            Some(catalog) => catalog.resolve_pair(text).await,
            None => text.parse(),
        }
    }

    pub async fn watchlist(&self) -> Result<Vec<PairKey>, EngineError> {
        self.catalog()?.watchlist().await
    }

    pub async fn watch(&self, pair: &PairKey) -> Result<bool, EngineError> {
        self.catalog()?.watch(pair).await
    }

    pub async fn unwatch(&self, pair: &PairKey) -> Result<bool, EngineError> {
        self.catalog()?.unwatch(pair).await
    }

    /// Compute every watched pair over the timeframe's default lookback.
    ///
    /// A pair that fails to load or aligns to fewer than `MIN_SCAN_BARS` bars
    /// is skipped, never fatal.
    pub async fn refresh_watchlist(
        &self,
        timeframe: Timeframe,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<WatchlistRefresh, EngineError> {
        let pairs = self.watchlist().await?;
        let as_of = as_of.unwrap_or_else(Utc::now);
        let mut rows = Vec::with_capacity(pairs.len());
        let mut skipped = Vec::new();

        for pair in pairs {
            match self.compute_metrics(&pair, timeframe, Some(as_of)).await {
                Ok(snapshot) if snapshot.bars >= MIN_SCAN_BARS => {
                    let signal = self.classify_signal(&snapshot);
                    rows.push(ScanRow { pair, signal, snapshot });
                }
                Ok(snapshot) => skipped.push(SkippedCandidate {
                    symbol: pair.to_string(),
                    reason: format!("only {} aligned bars", snapshot.bars),
                }),
                Err(e) => {
                    warn!(pair = %pair, error = %e, "Watchlist pair failed to load");
                    skipped.push(SkippedCandidate {
                        symbol: pair.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        let mut table = ScanTable::new(rows);
        table.apply_sort(SortColumn::ZScore, SortOrder::Descending);
        let rows: Vec<ScanRow> = table.visible_rows().into_iter().cloned().collect();

        info!(timeframe = %timeframe, pairs = rows.len(), skipped = skipped.len(), "Refreshed watchlist");
        Ok(WatchlistRefresh {
            timeframe,
            rows,
            skipped,
            generated_at: Utc::now(),
        })
    }

    pub async fn save_basket(
        &self,
        name: &str,
        basket: &Basket,
        description: Option<&str>,
    ) -> Result<(SavedBasket, bool), EngineError> {
        self.catalog()?.save_basket(name, basket, description).await
    }

    pub async fn saved_baskets(&self) -> Result<Vec<SavedBasket>, EngineError> {
        self.catalog()?.baskets().await
    }

    pub async fn delete_basket(&self, name: &str) -> Result<bool, EngineError> {
        self.catalog()?.delete_basket(name).await
    }

    // ========================================================================
    // Backtest
    // ========================================================================

    /// Run a backtest in the caller's task, superseding any backtest in flight
    pub async fn run_backtest(
        &self,
        request: BacktestRequest,
        config: &AnalysisConfig,
    ) -> Result<JobOutcome<BacktestReport>, EngineError> {
        let ticket = self.backtest.begin();
        let result = self.execute_backtest(request, config.clone(), ticket.control.clone()).await;
        self.backtest.publish(&ticket, &result);
        result
    }

    pub fn submit_backtest(self: &Arc<Self>, request: BacktestRequest, config: AnalysisConfig) -> u64 {
        let ticket = self.backtest.begin();
        let sequence = ticket.sequence;
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let result = service
                .execute_backtest(request, config, ticket.control.clone())
                .await;
            if let Err(e) = &result {
                warn!(error = %e, "Backtest failed");
            }
            service.backtest.publish(&ticket, &result);
        });
        sequence
    }

    async fn execute_backtest(
        &self,
        request: BacktestRequest,
        config: AnalysisConfig,
        control: Arc<JobControl>,
    ) -> Result<JobOutcome<BacktestReport>, EngineError> {
        config.validate()?;
        request.validate()?;

        let (start, end, timeframe) = (request.start, request.end, request.timeframe);
        let weighting = config.basket_weighting;
        let long = fetch_basket(self.store.as_ref(), &request.pair.long, timeframe, start, end, weighting).await?;
        let short = fetch_basket(self.store.as_ref(), &request.pair.short, timeframe, start, end, weighting).await?;

        if control.is_cancelled() {
            return Ok(JobOutcome::Cancelled);
        }

        let outcome = tokio::task::spawn_blocking(move || {
            let snapshot = compute_snapshot(&request.pair, timeframe, &long, &short, &config);
            let points = spread_points(&snapshot);
            BacktestEngine::run(&request, snapshot.hedge_ratio, &points, &config, &control)
        })
        .await?;

        Ok(outcome)
    }

    pub fn cancel_backtest(&self) -> bool {
        self.backtest.cancel()
    }

    pub fn backtest_state(&self) -> JobState<BacktestReport> {
        self.backtest.state()
    }

    pub fn backtest_progress(&self) -> Option<JobProgress> {
        self.backtest.progress()
    }
}
