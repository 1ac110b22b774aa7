//! Pair Scout Engine — pairs-trading analysis, discovery and backtesting
//!
//! Provides:
//! - Pair metrics: correlation, Engle–Granger cointegration, spread z-score,
//!   half-life, rolling beta/correlation/volatility, ratio EMA and Bollinger bands
//! - Discovery scanner ranking candidate pairs against a reference basket
//! - Bar-by-bar mean-reversion backtest with a performance report
//! - Watchlist and saved named baskets
//! - SQLite and Binance-backed time-series stores

pub mod analysis;
pub mod api;
pub mod backtest;
pub mod basket;
pub mod catalog;
pub mod cointegration;
pub mod config;
pub mod error;
pub mod jobs;
pub mod scanner;
pub mod service;
pub mod signal;
pub mod stats;
pub mod store;
pub mod table;
pub mod types;

// Re-exports for convenience
pub use analysis::{compute_snapshot, MetricSeries, MetricSnapshot, SpreadCandle};
pub use api::{BinanceClient, BinanceStore};
pub use backtest::{
    BacktestEngine, BacktestReport, BacktestRequest, EquityPoint, Trade, TradeDirection,
};
pub use catalog::{PairCatalog, SavedBasket};
pub use cointegration::{engle_granger, CointegrationResult};
pub use config::{AnalysisConfig, BasketWeighting};
pub use error::{EngineError, EngineResult};
pub use jobs::{JobControl, JobOutcome, JobProgress, JobState};
pub use scanner::{run_scan, ScanCompletion, ScanRequest, ScanResult, ScanRow, ScanTarget};
pub use service::{PairsService, WatchlistRefresh};
pub use signal::{classify_signal, SignalThresholds};
pub use store::{fetch_basket, InMemoryStore, SqliteStore, TimeSeriesStore};
pub use table::{ScanTable, SortColumn, SortOrder};
pub use types::*;
