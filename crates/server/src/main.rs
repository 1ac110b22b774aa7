//! Pair-Scout — pairs-trading analysis, discovery and backtesting
//!
//! Usage:
//!   pair-scout serve --port 3001                         — Launch the HTTP API
//!   pair-scout analyze --pair ETHUSDT/BTCUSDT            — Print pair metrics
//!   pair-scout scan --reference BTCUSDT --window 7d      — Rank candidate pairs
//!   pair-scout backtest --pair ETHUSDT/BTCUSDT --start 2024-01-01 --end 2024-03-01
//!   pair-scout sync --symbols BTCUSDT,ETHUSDT --days 60  — Download candles into SQLite
//!   pair-scout watchlist add ETHUSDT/BTCUSDT             — Follow a pair
//!   pair-scout watchlist refresh --timeframe 1h          — Metrics for every watched pair
//!   pair-scout basket save majors BTCUSDT+ETHUSDT        — Name a basket, then use it as @majors

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{
    extract::{Path as UrlPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use engine::store::record_from_bar;
use engine::{
    AnalysisConfig, BacktestReport, BacktestRequest, Basket, BinanceClient, BinanceStore,
    EngineError, JobOutcome, JobState, MetricSnapshot, PairCatalog, PairsService,
    SavedBasket, ScanCompletion, ScanRequest, ScanResult, ScanRow, ScanTable, ScanTarget, Signal,
    SortColumn, SortOrder, SqliteStore, Timeframe, TimeSeriesStore, WatchlistRefresh,
};
use persistence::repository::BacktestRunRecord;
use persistence::{Database, DbError};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "pair-scout")]
#[command(about = "Pairs-trading analysis, discovery and backtesting", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Where candles are read from
    #[arg(long, global = true, value_enum, default_value_t = Source::Sqlite)]
    source: Source,

    /// Analysis configuration JSON file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Source {
    /// Candles synced into the local database
    Sqlite,
    /// Live Binance public API
    Binance,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the HTTP API server
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on
        #[arg(short, long, default_value_t = 3001)]
        port: u16,
    },
    /// Compute and print the metrics of one pair
    Analyze {
        /// Pair as LONG/SHORT, baskets joined with '+' (e.g. ETHUSDT+SOLUSDT/BTCUSDT);
        /// '@name' uses a saved basket
        #[arg(long)]
        pair: String,
        /// Bar size: 5m, 1h, 4h
        #[arg(long, default_value = "1h")]
        timeframe: String,
    },
    /// Rank candidate pairs against a reference, or evaluate one basket pair
    Scan {
        /// Reference basket (long leg of every candidate)
        #[arg(long, conflicts_with_all = ["long", "short"])]
        reference: Option<String>,
        /// Long basket (basket mode)
        #[arg(long, requires = "short")]
        long: Option<String>,
        /// Short basket (basket mode)
        #[arg(long, requires = "long")]
        short: Option<String>,
        /// Lookback: 1d, 7d, 60d
        #[arg(long, default_value = "7d")]
        window: String,
        /// Only scan symbols of this category (quote asset)
        #[arg(long)]
        category: Option<String>,
        /// Case-insensitive substring filter on pair names
        #[arg(long)]
        filter: Option<String>,
        /// Sort column: pair, correlation, cointegrated, zscore, signal, price, 24h, 7d
        #[arg(long)]
        sort: Option<String>,
        /// Sort order: asc, desc
        #[arg(long, default_value = "desc")]
        order: String,
        /// Optional JSON export path
        #[arg(long)]
        export: Option<String>,
    },
    /// Backtest the mean-reversion rule on one pair
    Backtest {
        #[arg(long)]
        pair: String,
        #[arg(long, default_value = "1h")]
        timeframe: String,
        /// Range start, YYYY-MM-DD or RFC 3339
        #[arg(long)]
        start: String,
        /// Range end (inclusive), YYYY-MM-DD or RFC 3339
        #[arg(long)]
        end: String,
    },
    /// Download candles from Binance into the local database
    Sync {
        /// Symbols to download (comma-separated)
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,
        #[arg(long, default_value = "1h")]
        timeframe: String,
        /// Number of days of history
        #[arg(long, default_value_t = 60)]
        days: i64,
        /// Category recorded for the symbols (defaults to the USDT quote)
        #[arg(long)]
        category: Option<String>,
    },
    /// Manage and refresh the watchlist
    Watchlist {
        #[command(subcommand)]
        action: WatchlistAction,
    },
    /// Manage saved baskets
    Basket {
        #[command(subcommand)]
        action: BasketAction,
    },
}

#[derive(Subcommand)]
enum WatchlistAction {
    /// Show watched pairs
    List,
    /// Follow a pair
    Add { pair: String },
    /// Stop following a pair
    Remove { pair: String },
    /// Compute metrics for every watched pair, strongest |z| first
    Refresh {
        #[arg(long, default_value = "1h")]
        timeframe: String,
        #[arg(long)]
        filter: Option<String>,
        #[arg(long)]
        sort: Option<String>,
        #[arg(long, default_value = "desc")]
        order: String,
    },
}

#[derive(Subcommand)]
enum BasketAction {
    /// Show saved baskets
    List,
    /// Save members under a name (keeps the first definition of a name)
    Save {
        name: String,
        /// Members joined with '+', optional weights as SYMBOL*w
        members: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// Delete a saved basket
    Delete { name: String },
}

#[derive(Clone)]
struct AppState {
    service: Arc<PairsService>,
    db: Arc<Database>,
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug,engine=debug,pair_scout=debug,sqlx=warn")
    } else {
        EnvFilter::new("info,engine=info,pair_scout=info,sqlx=warn")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dotenvy::dotenv().ok();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { host, port } => {
            cmd_serve(&host, port, cli.source, config).await?;
        }
        Commands::Analyze { pair, timeframe } => {
            cmd_analyze(&pair, &timeframe, cli.source, config).await?;
        }
        Commands::Scan {
            reference,
            long,
            short,
            window,
            category,
            filter,
            sort,
            order,
            export,
        } => {
            let target = match (reference, long, short) {
                (Some(reference), _, _) => ScanTarget::Reference {
                    reference: reference.parse()?,
                },
                (None, Some(long), Some(short)) => ScanTarget::Baskets {
                    long: long.parse()?,
                    short: short.parse()?,
                },
                _ => anyhow::bail!("scan needs --reference or both --long and --short"),
            };
            let request = ScanRequest {
                target,
                window: window.parse()?,
                category,
                as_of: None,
            };
            let view = TableView {
                filter,
                sort: sort.as_deref().map(str::parse::<SortColumn>).transpose()?,
                order: Some(order.parse()?),
            };
            cmd_scan(request, view, export, cli.source, config).await?;
        }
        Commands::Backtest {
            pair,
            timeframe,
            start,
            end,
        } => {
            let timeframe: Timeframe = timeframe.parse()?;
            let (start, end) = (parse_datetime(&start)?, parse_datetime(&end)?);
            cmd_backtest(&pair, timeframe, start, end, cli.source, config).await?;
        }
        Commands::Sync {
            symbols,
            timeframe,
            days,
            category,
        } => {
            cmd_sync(symbols, timeframe.parse()?, days, category).await?;
        }
        Commands::Watchlist { action } => {
            cmd_watchlist(action, cli.source, config).await?;
        }
        Commands::Basket { action } => {
            cmd_basket(action, cli.source, config).await?;
        }
    }

    Ok(())
}

// ============================================================================
// Shared setup
// ============================================================================

fn load_config(path: Option<&Path>) -> anyhow::Result<AnalysisConfig> {
    match path {
        Some(p) => {
            let config = AnalysisConfig::load(p)?;
            info!(path = %p.display(), "Loaded analysis config");
            Ok(config)
        }
        None => Ok(AnalysisConfig::default()),
    }
}

async fn open_database() -> anyhow::Result<(Database, String)> {
    let db_path =
        std::env::var("PAIR_SCOUT_DB_PATH").unwrap_or_else(|_| "data/pair_scout.db".to_string());
    let db = Database::open(&db_path).await.map_err(|e| {
        error!("Failed to initialize database: {}", e);
        anyhow::anyhow!("Database initialization failed: {}", e)
    })?;
    Ok((db, db_path))
}

fn build_service(
    source: Source,
    db: &Database,
    config: AnalysisConfig,
) -> anyhow::Result<Arc<PairsService>> {
    let store: Arc<dyn TimeSeriesStore> = match source {
        Source::Sqlite => Arc::new(SqliteStore::new(db.pool_clone())),
        Source::Binance => Arc::new(BinanceStore::new(BinanceClient::new()?)),
    };
    let service = PairsService::new(store, config)?.with_catalog(PairCatalog::new(db.pool_clone()));
    Ok(Arc::new(service))
}

/// Accepts RFC 3339 or a bare date (midnight UTC)
fn parse_datetime(s: &str) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| anyhow::anyhow!("invalid date '{}', expected YYYY-MM-DD or RFC 3339", s))?;
    Ok(date.and_time(NaiveTime::MIN).and_utc())
}

/// Filter and sort applied to a finished scan
#[derive(Debug, Default, Deserialize)]
struct TableView {
    filter: Option<String>,
    sort: Option<SortColumn>,
    order: Option<SortOrder>,
}

impl TableView {
    fn apply(&self, rows: Vec<ScanRow>) -> ScanTable {
        let mut table = ScanTable::new(rows);
        if let Some(filter) = &self.filter {
            table.set_filter(filter.as_str());
        }
        if let Some(column) = self.sort {
            table.apply_sort(column, self.order.unwrap_or(SortOrder::Descending));
        }
        table
    }
}

fn fmt_opt(value: Option<f64>, precision: usize) -> String {
    value.map_or_else(|| "—".to_string(), |v| format!("{:.*}", precision, v))
}

// ============================================================================
// Serve command — Axum web server
// ============================================================================

async fn cmd_serve(host: &str, port: u16, source: Source, config: AnalysisConfig) -> anyhow::Result<()> {
    info!("Pair-Scout v{} starting...", APP_VERSION);

    let (db, db_path) = open_database().await?;
    info!("Database initialized: {}", db_path);

    let state = AppState {
        service: build_service(source, &db, config)?,
        db: Arc::new(db),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(api_health))
        .route("/symbols", get(api_symbols))
        .route("/analysis", get(api_analysis))
        .route("/scan", post(api_start_scan))
        .route("/scan/status", get(api_scan_status))
        .route("/scan/cancel", post(api_cancel_scan))
        .route("/backtest", post(api_start_backtest))
        .route("/backtest/status", get(api_backtest_status))
        .route("/backtest/cancel", post(api_cancel_backtest))
        .route("/backtests", get(api_backtests))
        .route("/watchlist", get(api_watchlist).post(api_watch).delete(api_unwatch))
        .route("/watchlist/refresh", get(api_refresh_watchlist))
        .route("/baskets", get(api_baskets).post(api_save_basket))
        .route("/baskets/:name", delete(api_delete_basket))
        .with_state(state);

    let app = Router::new().nest("/api", api_routes).layer(cors);

    let addr: std::net::SocketAddr = format!("{}:{}", host, port).parse()?;
    println!("\n=== Pair-Scout v{} ===", APP_VERSION);
    println!("Listening on http://{}", addr);
    println!("\nEndpoints:");
    println!("  GET  /api/health              - Health check");
    println!("  GET  /api/symbols             - Tradable symbols (?category=)");
    println!("  GET  /api/analysis            - Pair metrics (?pair=&timeframe=)");
    println!("  POST /api/scan                - Start discovery scan");
    println!("  GET  /api/scan/status         - Poll scan (?filter=&sort=&order=)");
    println!("  POST /api/scan/cancel         - Cancel running scan");
    println!("  POST /api/backtest            - Start backtest");
    println!("  GET  /api/backtest/status     - Poll backtest");
    println!("  POST /api/backtest/cancel     - Cancel running backtest");
    println!("  GET  /api/backtests           - Recent saved backtests");
    println!("  GET  /api/watchlist           - Watched pairs");
    println!("  POST /api/watchlist           - Watch a pair");
    println!("  DEL  /api/watchlist           - Unwatch a pair (?pair=)");
    println!("  GET  /api/watchlist/refresh   - Watched pair metrics (?timeframe=&filter=&sort=&order=)");
    println!("  GET  /api/baskets             - Saved baskets");
    println!("  POST /api/baskets             - Save a basket");
    println!("  DEL  /api/baskets/:name       - Delete a saved basket");
    println!("\n  Source: {:?} | Database: {}", source, db_path);
    println!("\nPress Ctrl+C to stop\n");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Analyze command
// ============================================================================

async fn cmd_analyze(
    pair: &str,
    timeframe: &str,
    source: Source,
    config: AnalysisConfig,
) -> anyhow::Result<()> {
    let timeframe: Timeframe = timeframe.parse()?;
    let (db, _) = open_database().await?;
    let service = build_service(source, &db, config)?;
    let pair = service.resolve_pair(pair).await?;

    let snapshot = service.compute_metrics(&pair, timeframe, None).await?;
    let signal = service.classify_signal(&snapshot);
    print_snapshot(&snapshot, signal);
    Ok(())
}

fn print_snapshot(s: &MetricSnapshot, signal: Signal) {
    println!("\n=== {} ({}) ===", s.pair, s.timeframe);
    println!(
        "  As of:          {}",
        s.as_of.map_or_else(|| "—".to_string(), |t| t.to_rfc3339())
    );
    println!("  Bars:           {}", s.bars);
    if s.correlation_defined {
        println!("  Correlation:    {:.4}", s.correlation);
    } else {
        println!("  Correlation:    undefined");
    }
    println!(
        "  Cointegrated:   {} (p = {:.4}, ADF = {}, lags = {})",
        if s.cointegration.cointegrated { "yes" } else { "no" },
        s.cointegration.p_value,
        fmt_opt(s.cointegration.test_statistic, 3),
        s.cointegration
            .lags_used
            .map_or_else(|| "—".to_string(), |l| l.to_string()),
    );
    println!("  Hedge ratio:    {}", fmt_opt(s.hedge_ratio, 4));
    println!("  Ratio:          {}", fmt_opt(s.current_ratio, 6));
    println!("  Spread:         {}", fmt_opt(s.current_spread, 6));
    println!("  Z-score:        {}", fmt_opt(s.zscore, 3));
    println!("  Half-life:      {} days", fmt_opt(s.half_life_days, 2));
    println!("  Volatility:     {}%", fmt_opt(s.volatility, 2));
    println!("  24h change:     {}%", fmt_opt(s.change_24h, 2));
    println!("  7d change:      {}%", fmt_opt(s.change_7d, 2));
    println!("  Signal:         {}", signal);
}

// ============================================================================
// Scan command
// ============================================================================

async fn cmd_scan(
    request: ScanRequest,
    view: TableView,
    export: Option<String>,
    source: Source,
    config: AnalysisConfig,
) -> anyhow::Result<()> {
    println!("\n=== Pair-Scout v{} ===", APP_VERSION);
    let (db, _) = open_database().await?;
    let service = build_service(source, &db, config)?;

    let service_for_ctrlc = service.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl+C received, requesting cancel...");
        service_for_ctrlc.cancel_scan();
    });

    let result = match service.scan(request).await? {
        JobOutcome::Completed(result) => result,
        JobOutcome::Cancelled => {
            println!("\nScan cancelled.");
            return Ok(());
        }
    };

    let table = view.apply(result.rows.clone());
    print_scan(&result, &table);

    if let Some(export_path) = export {
        let rows: Vec<&ScanRow> = table.visible_rows();
        let json = serde_json::to_string_pretty(&serde_json::json!({
            "window": result.window,
            "generated_at": result.generated_at,
            "completion": result.completion,
            "rows": rows,
            "skipped": result.skipped,
        }))?;
        std::fs::write(&export_path, &json)?;
        println!("\nResults exported to {}", export_path);
    }

    Ok(())
}

fn print_scan(result: &ScanResult, table: &ScanTable) {
    match result.completion {
        ScanCompletion::NoData => {
            println!("\nNo data: reference too short or empty universe.");
            return;
        }
        ScanCompletion::Found(n) => println!("\n{} pairs ({} window)", n, result.window),
    }

    print_rows(table);

    if !result.skipped.is_empty() {
        println!("\n  Skipped {} candidates:", result.skipped.len());
        for skipped in &result.skipped {
            println!("    {:<12} {}", skipped.symbol, skipped.reason);
        }
    }
}

fn print_rows(table: &ScanTable) {
    println!(
        "  {:>3}  {:<28} {:>7} {:>6} {:>7} {:>8} {:>12} {:>8} {:>8}",
        "#", "Pair", "Corr", "Coint", "Z", "Signal", "Ratio", "24h%", "7d%"
    );
    println!("  {}", "-".repeat(100));
    for (i, row) in table.visible_rows().iter().enumerate() {
        let s = &row.snapshot;
        println!(
            "  {:>3}  {:<28} {:>7.3} {:>6} {:>7} {:>8} {:>12} {:>8} {:>8}",
            i + 1,
            row.pair.to_string(),
            s.correlation,
            if s.cointegration.cointegrated { "yes" } else { "no" },
            fmt_opt(s.zscore, 2),
            row.signal.to_string(),
            fmt_opt(s.current_ratio, 6),
            fmt_opt(s.change_24h, 2),
            fmt_opt(s.change_7d, 2),
        );
    }
}

// ============================================================================
// Backtest command
// ============================================================================

async fn cmd_backtest(
    pair: &str,
    timeframe: Timeframe,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    source: Source,
    config: AnalysisConfig,
) -> anyhow::Result<()> {
    println!("\n=== Pair-Scout v{} ===", APP_VERSION);

    let (db, db_path) = open_database().await?;
    let service = build_service(source, &db, config.clone())?;
    let request = BacktestRequest {
        pair: service.resolve_pair(pair).await?,
        timeframe,
        start,
        end,
    };
    request.validate()?;

    let repo = db.backtests();
    let params_hash = request.params_hash(&config);

    if let Some(cached) = repo.get_by_hash(&params_hash).await? {
        println!("Cached result from {} ({})", db_path, &params_hash[..12]);
        print_record(&cached);
        return Ok(());
    }

    let service_for_ctrlc = service.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl+C received, requesting cancel...");
        service_for_ctrlc.cancel_backtest();
    });

    match service.run_backtest(request, &config).await? {
        JobOutcome::Completed(report) => {
            print_report(&report);
            let saved = repo.save(&report.to_record(&params_hash, &config)).await?;
            if saved {
                println!("\nSaved to {}", db_path);
            }
        }
        JobOutcome::Cancelled => println!("\nBacktest cancelled."),
    }

    Ok(())
}

fn print_report(report: &BacktestReport) {
    println!(
        "\n{} ({}) {} → {}",
        report.pair,
        report.timeframe,
        report.start.format("%Y-%m-%d %H:%M"),
        report.end.format("%Y-%m-%d %H:%M")
    );
    println!("  Bars:            {}", report.bars);
    println!("  Hedge ratio:     {}", fmt_opt(report.hedge_ratio, 4));
    println!("  Trades:          {} ({} profitable)", report.total_trades, report.profitable_trades);
    println!("  Win rate:        {:.1}%", report.win_rate);
    println!("  Total return:    {:+.2}%", report.total_return);
    println!("  Sharpe:          {}", report.sharpe_ratio);
    println!("  Max drawdown:    {:.2}%", report.max_drawdown);

    if !report.trades.is_empty() {
        println!(
            "\n  {:<17} {:<17} {:<12} {:>7} {:>7} {:>7} {:>9}",
            "Entry", "Exit", "Direction", "Beta", "Z in", "Z out", "Return%"
        );
        println!("  {}", "-".repeat(83));
        for t in &report.trades {
            println!(
                "  {:<17} {:<17} {:<12} {:>7.3} {:>7.2} {:>7} {:>+9.3}{}",
                t.entry_time.format("%Y-%m-%d %H:%M").to_string(),
                t.exit_time.format("%Y-%m-%d %H:%M").to_string(),
                format!("{:?}", t.direction),
                t.hedge_ratio,
                t.entry_zscore,
                fmt_opt(t.exit_zscore, 2),
                t.return_pct,
                if t.forced_exit { " (forced)" } else { "" },
            );
        }
    }
}

fn print_record(record: &BacktestRunRecord) {
    println!("\n{} ({})", record.pair, record.timeframe);
    println!("  Bars:            {}", record.bars);
    println!("  Trades:          {} ({} profitable)", record.total_trades, record.profitable_trades);
    println!("  Win rate:        {}%", record.win_rate);
    println!("  Total return:    {}%", record.total_return);
    println!("  Sharpe:          {}", record.sharpe_ratio);
    println!("  Max drawdown:    {}%", record.max_drawdown);
}

// ============================================================================
// Sync command
// ============================================================================

async fn cmd_sync(
    symbols: Vec<String>,
    timeframe: Timeframe,
    days: i64,
    category: Option<String>,
) -> anyhow::Result<()> {
    if symbols.is_empty() {
        anyhow::bail!("sync needs at least one --symbols entry");
    }
    println!("\n=== Pair-Scout v{} ===", APP_VERSION);

    let (db, db_path) = open_database().await?;
    let repo = db.candles();
    let binance = BinanceClient::new()?;
    let end = Utc::now();
    let start = end - chrono::Duration::days(days);
    let category = category.unwrap_or_else(|| "USDT".to_string());

    println!(
        "Database: {} | Timeframe: {} | Days: {} | Category: {}",
        db_path, timeframe, days, category
    );

    for symbol in symbols.iter().map(|s| s.trim().to_uppercase()) {
        // Resume after the newest stored candle
        let from = match repo.latest_open_time(&symbol, timeframe.as_str()).await? {
            Some(last) => (last + 1).max(start.timestamp_millis()),
            None => start.timestamp_millis(),
        };

        let bars = match binance
            .get_klines_paginated(&symbol, timeframe.binance_interval(), from, end.timestamp_millis())
            .await
        {
            Ok(bars) => bars,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "Failed to fetch klines, skipping");
                continue;
            }
        };

        let records: Vec<_> = bars
            .iter()
            .map(|b| record_from_bar(&symbol, timeframe, b))
            .collect();
        let written = repo.upsert_candles(&records).await?;
        repo.register_symbol(&symbol, Some(category.as_str()), true).await?;
        let stored = repo.count(&symbol, timeframe.as_str()).await?;

        println!("  {:<12} +{:>6} candles ({} stored)", symbol, written, stored);
    }

    let registered = repo.list_symbols().await?;
    println!(
        "\n{} symbols registered ({} tradable)",
        registered.len(),
        registered.iter().filter(|s| s.tradable).count()
    );

    Ok(())
}

// ============================================================================
// Watchlist & basket commands
// ============================================================================

async fn cmd_watchlist(action: WatchlistAction, source: Source, config: AnalysisConfig) -> anyhow::Result<()> {
    let (db, _) = open_database().await?;
    let service = build_service(source, &db, config)?;

    match action {
        WatchlistAction::List => {
            let pairs = service.watchlist().await?;
            if pairs.is_empty() {
                println!("Watchlist is empty.");
            }
            for (i, pair) in pairs.iter().enumerate() {
                println!("  {:>3}  {}", i + 1, pair);
            }
        }
        WatchlistAction::Add { pair } => {
            let pair = service.resolve_pair(&pair).await?;
            if service.watch(&pair).await? {
                println!("Watching {}", pair);
            } else {
                println!("{} is already watched", pair);
            }
        }
        WatchlistAction::Remove { pair } => {
            let pair = service.resolve_pair(&pair).await?;
            if service.unwatch(&pair).await? {
                println!("Removed {}", pair);
            } else {
                println!("{} was not watched", pair);
            }
        }
        WatchlistAction::Refresh {
            timeframe,
            filter,
            sort,
            order,
        } => {
            let refresh = service.refresh_watchlist(timeframe.parse()?, None).await?;
            let view = TableView {
                filter,
                sort: sort.as_deref().map(str::parse::<SortColumn>).transpose()?,
                order: Some(order.parse()?),
            };
            print_watchlist(&refresh, &view.apply(refresh.rows.clone()));
        }
    }
    Ok(())
}

fn print_watchlist(refresh: &WatchlistRefresh, table: &ScanTable) {
    println!(
        "\n{} watched pairs ({}) at {}",
        refresh.rows.len(),
        refresh.timeframe,
        refresh.generated_at.format("%Y-%m-%d %H:%M")
    );
    print_rows(table);
    for skipped in &refresh.skipped {
        println!("    skipped {:<24} {}", skipped.symbol, skipped.reason);
    }
}

async fn cmd_basket(action: BasketAction, source: Source, config: AnalysisConfig) -> anyhow::Result<()> {
    let (db, _) = open_database().await?;
    let service = build_service(source, &db, config)?;

    match action {
        BasketAction::List => {
            let baskets = service.saved_baskets().await?;
            if baskets.is_empty() {
                println!("No saved baskets.");
            }
            for saved in &baskets {
                print_saved_basket(saved);
            }
        }
        BasketAction::Save {
            name,
            members,
            description,
        } => {
            let basket: Basket = members.parse()?;
            let (saved, created) = service.save_basket(&name, &basket, description.as_deref()).await?;
            if created {
                println!("Saved @{}", saved.name);
            } else {
                println!("@{} already exists; kept its members", saved.name);
            }
            print_saved_basket(&saved);
        }
        BasketAction::Delete { name } => {
            if service.delete_basket(&name).await? {
                println!("Deleted @{}", name.trim());
            } else {
                println!("No saved basket named {}", name.trim());
            }
        }
    }
    Ok(())
}

fn print_saved_basket(saved: &SavedBasket) {
    println!(
        "  @{:<16} {:<40} {}",
        saved.name,
        saved.basket.to_string(),
        saved.description.as_deref().unwrap_or("")
    );
}

// ============================================================================
// API error mapping
// ============================================================================

enum ApiError {
    Engine(EngineError),
    Db(DbError),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError::Engine(e)
    }
}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        ApiError::Db(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Engine(e) => {
                let status = match e {
                    EngineError::InvalidRange(_) | EngineError::InvalidConfig(_) => {
                        StatusCode::BAD_REQUEST
                    }
                    EngineError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
                    EngineError::InvalidSeries(_) | EngineError::Worker(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, e.to_string())
            }
            ApiError::Db(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
        if status.is_server_error() {
            error!(status = %status, error = %message, "API request failed");
        }
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

// ============================================================================
// API Handlers — Market data & analysis
// ============================================================================

/// GET /api/health
async fn api_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "pair-scout",
        "version": APP_VERSION,
    }))
}

#[derive(Deserialize)]
struct SymbolsQuery {
    category: Option<String>,
}

/// GET /api/symbols — tradable symbols, optionally by category
async fn api_symbols(
    State(state): State<AppState>,
    Query(params): Query<SymbolsQuery>,
) -> ApiResult {
    let symbols = state.service.symbols(params.category.as_deref()).await?;
    Ok(Json(serde_json::json!({
        "count": symbols.len(),
        "symbols": symbols,
    })))
}

#[derive(Deserialize)]
struct AnalysisQuery {
    pair: String,
    timeframe: Option<String>,
}

/// GET /api/analysis — full metric snapshot of one pair
async fn api_analysis(
    State(state): State<AppState>,
    Query(params): Query<AnalysisQuery>,
) -> ApiResult {
    let pair = state.service.resolve_pair(&params.pair).await?;
    let timeframe: Timeframe = params.timeframe.as_deref().unwrap_or("1h").parse()?;
    let snapshot = state.service.compute_metrics(&pair, timeframe, None).await?;
    let signal = state.service.classify_signal(&snapshot);
    Ok(Json(serde_json::json!({
        "signal": signal,
        "snapshot": snapshot,
    })))
}

// ============================================================================
// API Handlers — Discovery
// ============================================================================

/// POST /api/scan — start a scan, superseding any scan in flight
async fn api_start_scan(
    State(state): State<AppState>,
    Json(request): Json<ScanRequest>,
) -> Json<serde_json::Value> {
    info!(window = %request.window, category = ?request.category, "Starting scan");
    let sequence = state.service.submit_scan(request);
    Json(serde_json::json!({
        "success": true,
        "sequence": sequence,
    }))
}

/// GET /api/scan/status — latest scan state, rows projected through the table view
async fn api_scan_status(
    State(state): State<AppState>,
    Query(view): Query<TableView>,
) -> Json<serde_json::Value> {
    let progress = state.service.scan_progress();
    match state.service.scan_state() {
        JobState::Completed { sequence, result } => {
            let table = view.apply(result.rows);
            Json(serde_json::json!({
                "status": "completed",
                "sequence": sequence,
                "completion": result.completion,
                "window": result.window,
                "generated_at": result.generated_at,
                "filter": table.filter(),
                "sort": table.sort(),
                "rows": table.visible_rows(),
                "skipped": result.skipped,
            }))
        }
        other => Json(serde_json::json!({
            "state": other,
            "progress": progress,
        })),
    }
}

/// POST /api/scan/cancel
async fn api_cancel_scan(State(state): State<AppState>) -> Json<serde_json::Value> {
    let cancelled = state.service.cancel_scan();
    info!(cancelled, "Scan cancel requested via API");
    Json(serde_json::json!({ "success": cancelled }))
}

// ============================================================================
// API Handlers — Backtest
// ============================================================================

#[derive(Deserialize)]
struct BacktestBody {
    #[serde(flatten)]
    request: BacktestRequest,
    /// Overrides the server configuration for this run
    #[serde(default)]
    config: Option<AnalysisConfig>,
}

/// POST /api/backtest — start a backtest or return the cached run
async fn api_start_backtest(
    State(state): State<AppState>,
    Json(body): Json<BacktestBody>,
) -> ApiResult {
    let request = body.request;
    let config = body.config.unwrap_or_else(|| state.service.config().clone());
    config.validate()?;
    request.validate()?;

    let params_hash = request.params_hash(&config);
    let repo = state.db.backtests();
    if let Some(cached) = repo.get_by_hash(&params_hash).await? {
        return Ok(Json(serde_json::json!({
            "success": true,
            "cached": true,
            "params_hash": params_hash,
            "run": cached,
        })));
    }

    info!(pair = %request.pair, timeframe = %request.timeframe, "Starting backtest");

    let service = state.service.clone();
    let db = state.db.clone();
    let hash = params_hash.clone();
    tokio::spawn(async move {
        match service.run_backtest(request, &config).await {
            Ok(JobOutcome::Completed(report)) => {
                if let Err(e) = db.backtests().save(&report.to_record(&hash, &config)).await {
                    warn!(error = %e, "Failed to save backtest run");
                }
            }
            Ok(JobOutcome::Cancelled) => info!("Backtest cancelled"),
            Err(e) => warn!(error = %e, "Backtest failed"),
        }
    });

    Ok(Json(serde_json::json!({
        "success": true,
        "cached": false,
        "params_hash": params_hash,
    })))
}

/// GET /api/backtest/status
async fn api_backtest_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "state": state.service.backtest_state(),
        "progress": state.service.backtest_progress(),
    }))
}

/// POST /api/backtest/cancel
async fn api_cancel_backtest(State(state): State<AppState>) -> Json<serde_json::Value> {
    let cancelled = state.service.cancel_backtest();
    info!(cancelled, "Backtest cancel requested via API");
    Json(serde_json::json!({ "success": cancelled }))
}

#[derive(Deserialize)]
struct BacktestsQuery {
    #[serde(default = "default_limit")]
    limit: i64,
    pair: Option<String>,
}

fn default_limit() -> i64 {
    20
}

/// GET /api/backtests — recent persisted runs
async fn api_backtests(
    State(state): State<AppState>,
    Query(params): Query<BacktestsQuery>,
) -> ApiResult {
    let records = state.db.backtests().recent(params.limit, params.pair.as_deref()).await?;
    Ok(Json(serde_json::json!({
        "count": records.len(),
        "data": records,
    })))
}

// ============================================================================
// API Handlers — Watchlist & saved baskets
// ============================================================================

#[derive(Deserialize)]
struct PairBody {
    pair: String,
}

/// GET /api/watchlist
async fn api_watchlist(State(state): State<AppState>) -> ApiResult {
    let pairs = state.service.watchlist().await?;
    Ok(Json(serde_json::json!({
        "count": pairs.len(),
        "pairs": pairs,
    })))
}

/// POST /api/watchlist — body {"pair": "ETHUSDT/BTCUSDT"}
async fn api_watch(State(state): State<AppState>, Json(body): Json<PairBody>) -> ApiResult {
    let pair = state.service.resolve_pair(&body.pair).await?;
    let added = state.service.watch(&pair).await?;
    Ok(Json(serde_json::json!({ "success": true, "added": added, "pair": pair })))
}

/// DELETE /api/watchlist?pair=
async fn api_unwatch(State(state): State<AppState>, Query(params): Query<PairBody>) -> ApiResult {
    let pair = state.service.resolve_pair(&params.pair).await?;
    let removed = state.service.unwatch(&pair).await?;
    Ok(Json(serde_json::json!({ "success": removed, "pair": pair })))
}

#[derive(Deserialize)]
struct RefreshQuery {
    timeframe: Option<String>,
    #[serde(flatten)]
    view: TableView,
}

/// GET /api/watchlist/refresh — metrics for every watched pair
async fn api_refresh_watchlist(
    State(state): State<AppState>,
    Query(params): Query<RefreshQuery>,
) -> ApiResult {
    let timeframe: Timeframe = params.timeframe.as_deref().unwrap_or("1h").parse()?;
    let refresh = state.service.refresh_watchlist(timeframe, None).await?;
    let table = params.view.apply(refresh.rows);
    Ok(Json(serde_json::json!({
        "timeframe": refresh.timeframe,
        "generated_at": refresh.generated_at,
        "filter": table.filter(),
        "sort": table.sort(),
        "rows": table.visible_rows(),
        "skipped": refresh.skipped,
    })))
}

/// GET /api/baskets
async fn api_baskets(State(state): State<AppState>) -> ApiResult {
    let baskets = state.service.saved_baskets().await?;
    let data: Vec<serde_json::Value> = baskets
        .iter()
        .map(|b| serde_json::json!({ "display_name": b.display_name(), "basket": b }))
        .collect();
    Ok(Json(serde_json::json!({
        "count": data.len(),
        "data": data,
    })))
}

#[derive(Deserialize)]
struct SaveBasketBody {
    name: String,
    basket: Basket,
    #[serde(default)]
    description: Option<String>,
}

/// POST /api/baskets — body {"name": "majors", "basket": "BTCUSDT+ETHUSDT"}
async fn api_save_basket(State(state): State<AppState>, Json(body): Json<SaveBasketBody>) -> ApiResult {
    let (saved, created) = state
        .service
        .save_basket(&body.name, &body.basket, body.description.as_deref())
        .await?;
    Ok(Json(serde_json::json!({ "success": true, "created": created, "basket": saved })))
}

/// DELETE /api/baskets/:name
async fn api_delete_basket(State(state): State<AppState>, UrlPath(name): UrlPath<String>) -> ApiResult {
    let deleted = state.service.delete_basket(&name).await?;
    Ok(Json(serde_json::json!({ "success": deleted })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_datetime_accepts_date_and_rfc3339() {
        let d = parse_datetime("2024-01-02").unwrap();
        assert_eq!(d.to_rfc3339(), "2024-01-02T00:00:00+00:00");
        let d = parse_datetime("2024-01-02T03:04:05Z").unwrap();
        assert_eq!(d.timestamp(), 1_704_164_645);
        assert!(parse_datetime("02/01/2024").is_err());
    }

    #[test]
    fn test_table_view_from_query_string() {
        let view: TableView =
            serde_json::from_str(r#"{"filter":"eth","sort":"correlation","order":"ascending"}"#).unwrap();
        assert_eq!(view.sort, Some(SortColumn::Correlation));
        assert_eq!(view.order, Some(SortOrder::Ascending));
        let table = view.apply(Vec::new());
        assert_eq!(table.sort(), Some((SortColumn::Correlation, SortOrder::Ascending)));
        assert_eq!(table.filter(), "eth");
    }

    #[test]
    fn test_engine_errors_map_to_status_codes() {
        let status = |e: EngineError| ApiError::from(e).into_response().status();
        assert_eq!(status(EngineError::InvalidRange("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status(EngineError::InvalidConfig("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status(EngineError::UpstreamUnavailable("x".into())), StatusCode::BAD_GATEWAY);
        assert_eq!(status(EngineError::Worker("x".into())), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_cli_parses_scan_modes() {
        let cli = Cli::try_parse_from(["pair-scout", "scan", "--reference", "BTCUSDT", "--window", "60d"]).unwrap();
        assert!(matches!(cli.command, Commands::Scan { reference: Some(_), .. }));
        assert!(Cli::try_parse_from(["pair-scout", "scan", "--long", "ETHUSDT"]).is_err());
        let cli = Cli::try_parse_from(["pair-scout", "--source", "binance", "analyze", "--pair", "ETHUSDT/BTCUSDT"]).unwrap();
        assert!(matches!(cli.source, Source::Binance));
    }

    #[test]
    fn test_cli_parses_watchlist_and_basket_actions() {
        let cli = Cli::try_parse_from(["pair-scout", "watchlist", "add", "ETHUSDT/BTCUSDT"]).unwrap();
        assert!(matches!(cli.command, Commands::Watchlist { action: WatchlistAction::Add { .. } }));

        let cli = Cli::try_parse_from(["pair-scout", "watchlist", "refresh", "--sort", "zscore"]).unwrap();
        match cli.command {
            Commands::Watchlist {
                action: WatchlistAction::Refresh { timeframe, sort, .. },
            } => {
                assert_eq!(timeframe, "1h");
                assert_eq!(sort.as_deref(), Some("zscore"));
            }
            _ => panic!("expected watchlist refresh"),
        }

        let cli = Cli::try_parse_from(["pair-scout", "basket", "save", "majors", "BTCUSDT*2+ETHUSDT", "--description", "large caps"]).unwrap();
        assert!(matches!(cli.command, Commands::Basket { action: BasketAction::Save { .. } }));
        assert!(Cli::try_parse_from(["pair-scout", "basket", "save", "majors"]).is_err());
    }

    #[test]
    fn test_refresh_query_flattens_table_view() {
        let query: RefreshQuery =
            serde_json::from_str(r#"{"timeframe":"4h","sort":"zscore","order":"ascending"}"#).unwrap();
        assert_eq!(query.timeframe.as_deref(), Some("4h"));
        assert_eq!(query.view.sort, Some(SortColumn::ZScore));
    }
}
