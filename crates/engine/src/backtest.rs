//! Bar-by-bar mean-reversion backtest on a pair spread
//!
//! One position slot: flat, long the spread or short the spread. Entries fire
//! when the z-score crosses ±entry; exits when it reverts past the exit level.
//! Any position still open at the last bar is force-closed. A position keeps
//! the rolling hedge ratio of its entry bar until it closes.

use chrono::{DateTime, Utc};
use persistence::repository::BacktestRunRecord;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::analysis::MetricSnapshot;
use crate::config::AnalysisConfig;
use crate::error::EngineError;
use crate::jobs::{JobControl, JobOutcome};
use crate::types::{PairKey, Timeframe};

const SECONDS_PER_YEAR: f64 = 365.0 * 86_400.0;

/// Pair, bar size and inclusive date range to replay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestRequest {
    pub pair: PairKey,
    pub timeframe: Timeframe,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BacktestRequest {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.start > self.end {
            return Err(EngineError::InvalidRange(format!(
                "start {} is after end {}",
                self.start, self.end
            )));
        }
        Ok(())
    }

    /// Stable SHA-256 of the request and the tuning that shapes its result
    pub fn params_hash(&self, config: &AnalysisConfig) -> String {
        let input = format!(
            "{}|{}|{}|{}|{}",
            self.pair,
            self.timeframe,
            self.start.timestamp_millis(),
            self.end.timestamp_millis(),
            serde_json::to_string(config).unwrap_or_default()
        );
        format!("{:x}", Sha256::digest(input.as_bytes()))
    }
}

/// Leg prices and trailing-window signal at one bar, as seen by the simulator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpreadPoint {
    pub timestamp: DateTime<Utc>,
    pub long_price: f64,
    pub short_price: f64,
    /// Hedge ratio fitted on the window ending at this bar
    pub hedge_ratio: Option<f64>,
    pub zscore: Option<f64>,
}

impl SpreadPoint {
    pub fn spread(&self, beta: f64) -> f64 {
        self.long_price - beta * self.short_price
    }

    /// Gross notional of one spread unit: long price + |β| · short price
    pub fn exposure(&self, beta: f64) -> f64 {
        self.long_price + beta.abs() * self.short_price
    }
}

/// One point per aligned bar of the snapshot
pub fn spread_points(snapshot: &MetricSnapshot) -> Vec<SpreadPoint> {
    let s = &snapshot.series;
    s.timestamps
        .iter()
        .enumerate()
        .map(|(i, &timestamp)| SpreadPoint {
            timestamp,
            long_price: s.long_price[i],
            short_price: s.short_price[i],
            hedge_ratio: s.rolling_hedge_ratio[i],
            zscore: s.zscore[i],
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeDirection {
    /// Long the long leg, short β of the short leg
    LongSpread,
    ShortSpread,
}

impl TradeDirection {
    pub fn sign(&self) -> f64 {
        match self {
            Self::LongSpread => 1.0,
            Self::ShortSpread => -1.0,
        }
    }
}

/// A closed round trip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub direction: TradeDirection,
    /// Hedge ratio held for the life of the trade
    pub hedge_ratio: f64,
    pub entry_spread: f64,
    pub exit_spread: f64,
    pub entry_zscore: f64,
    pub exit_zscore: Option<f64>,
    /// Realized return on gross exposure at entry, in percent
    pub return_pct: f64,
    pub forced_exit: bool,
}

/// Compounded equity after each bar, starting at 1.0
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestReport {
    pub pair: PairKey,
    pub timeframe: Timeframe,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub bars: usize,
    /// Whole-range hedge ratio, for reference
    pub hedge_ratio: Option<f64>,
    pub total_return: Decimal,
    pub sharpe_ratio: Decimal,
    /// Largest peak-to-trough decline of the equity curve, positive percent
    pub max_drawdown: Decimal,
    pub win_rate: Decimal,
    pub total_trades: u32,
    pub profitable_trades: u32,
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
}

impl BacktestReport {
    /// Flatten into the persisted form
    pub fn to_record(&self, params_hash: &str, config: &AnalysisConfig) -> BacktestRunRecord {
        BacktestRunRecord {
            id: None,
            params_hash: params_hash.to_string(),
            pair: self.pair.to_string(),
            timeframe: self.timeframe.to_string(),
            start_time: self.start.timestamp_millis(),
            end_time: self.end.timestamp_millis(),
            config: serde_json::to_string(config).unwrap_or_default(),
            bars: self.bars as i64,
            total_return: self.total_return.to_string(),
            sharpe_ratio: self.sharpe_ratio.to_string(),
            max_drawdown: self.max_drawdown.to_string(),
            win_rate: self.win_rate.to_string(),
            total_trades: self.total_trades as i64,
            profitable_trades: self.profitable_trades as i64,
            trades: serde_json::to_string(&self.trades).unwrap_or_else(|_| "[]".to_string()),
            created_at: None,
        }
    }
}

/// Position state during simulation
struct OpenPosition {
    entry: SpreadPoint,
    entry_zscore: f64,
    beta: f64,
    direction: TradeDirection,
}

impl OpenPosition {
    fn close(self, exit: &SpreadPoint, forced_exit: bool) -> Trade {
        let entry_spread = self.entry.spread(self.beta);
        let exit_spread = exit.spread(self.beta);
        let exposure = self.entry.exposure(self.beta);
        let return_pct = if exposure > 0.0 {
            self.direction.sign() * (exit_spread - entry_spread) / exposure * 100.0
        } else {
            0.0
        };
        Trade {
            entry_time: self.entry.timestamp,
            exit_time: exit.timestamp,
            direction: self.direction,
            hedge_ratio: self.beta,
            entry_spread,
            exit_spread,
            entry_zscore: self.entry_zscore,
            exit_zscore: exit.zscore,
            return_pct,
            forced_exit,
        }
    }
}

/// Trades and equity curve of one simulation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Simulation {
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
}

/// Backtesting engine that simulates bar-by-bar execution
pub struct BacktestEngine;

impl BacktestEngine {
    /// Replay `points` restricted to the request range and build the report
    pub fn run(
        request: &BacktestRequest,
        hedge_ratio: Option<f64>,
        points: &[SpreadPoint],
        config: &AnalysisConfig,
        control: &JobControl,
    ) -> JobOutcome<BacktestReport> {
        let in_range: Vec<SpreadPoint> = if request.start > request.end {
            Vec::new()
        } else {
            points
                .iter()
                .filter(|p| p.timestamp >= request.start && p.timestamp <= request.end)
                .copied()
                .collect()
        };

        info!(
            pair = %request.pair,
            timeframe = %request.timeframe,
            bars = in_range.len(),
            entry = config.entry_threshold,
            exit = config.exit_threshold,
            "Starting backtest"
        );

        let simulation = match Self::simulate(&in_range, config, control) {
            JobOutcome::Completed(sim) => sim,
            JobOutcome::Cancelled => {
                info!(pair = %request.pair, "Backtest cancelled");
                return JobOutcome::Cancelled;
            }
        };

        let report = Self::summarize(request, hedge_ratio, in_range.len(), simulation);

        info!(
            total_trades = report.total_trades,
            profitable_trades = report.profitable_trades,
            win_rate = %report.win_rate,
            total_return = %report.total_return,
            max_drawdown = %report.max_drawdown,
            "Backtest complete"
        );

        JobOutcome::Completed(report)
    }

    /// Run the state machine over `points`, polling `control` every bar
    pub fn simulate(
        points: &[SpreadPoint],
        config: &AnalysisConfig,
        control: &JobControl,
    ) -> JobOutcome<Simulation> {
        let entry = config.entry_threshold;
        let exit = config.exit_threshold;

        let mut position: Option<OpenPosition> = None;
        let mut prev_z: Option<f64> = None;
        let mut equity = 1.0;
        let mut sim = Simulation::default();

        control.set_total(points.len());

        for (i, point) in points.iter().enumerate() {
            if control.is_cancelled() {
                return JobOutcome::Cancelled;
            }
            let is_last = i + 1 == points.len();

            if let Some(z) = point.zscore {
                match position.take() {
                    Some(pos) => {
                        let reverted = match pos.direction {
                            TradeDirection::LongSpread => z >= exit,
                            TradeDirection::ShortSpread => z <= exit,
                        };
                        if reverted {
                            let trade = pos.close(point, false);
                            debug!(
                                direction = ?trade.direction,
                                entry_z = trade.entry_zscore,
                                exit_z = z,
                                return_pct = trade.return_pct,
                                "Closed spread position"
                            );
                            equity *= 1.0 + trade.return_pct / 100.0;
                            sim.trades.push(trade);
                        } else {
                            position = Some(pos);
                        }
                    }
                    None if !is_last && point.hedge_ratio.is_some() => {
                        let direction = match prev_z {
                            Some(prev) if prev > -entry && z <= -entry => {
                                Some(TradeDirection::LongSpread)
                            }
                            Some(prev) if prev < entry && z >= entry => {
                                Some(TradeDirection::ShortSpread)
                            }
                            _ => None,
                        };
                        if let (Some(direction), Some(beta)) = (direction, point.hedge_ratio) {
                            debug!(
                                direction = ?direction,
                                z,
                                beta,
                                spread = point.spread(beta),
                                time = %point.timestamp,
                                "Opened spread position"
                            );
                            position = Some(OpenPosition {
                                entry: *point,
                                entry_zscore: z,
                                beta,
                                direction,
                            });
                        }
                    }
                    None => {}
                }
                prev_z = Some(z);
            }

            if is_last {
                if let Some(pos) = position.take() {
                    let trade = pos.close(point, true);
                    debug!(return_pct = trade.return_pct, "Force-closed position at last bar");
                    equity *= 1.0 + trade.return_pct / 100.0;
                    sim.trades.push(trade);
                }
            }

            sim.equity_curve.push(EquityPoint {
                timestamp: point.timestamp,
                equity,
            });
            control.advance();
        }

        JobOutcome::Completed(sim)
    }

    fn summarize(
        request: &BacktestRequest,
        hedge_ratio: Option<f64>,
        bars: usize,
        sim: Simulation,
    ) -> BacktestReport {
        let hundred = dec!(100);
        let total_trades = sim.trades.len() as u32;
        let profitable_trades = sim.trades.iter().filter(|t| t.return_pct > 0.0).count() as u32;

        let win_rate = if total_trades > 0 {
            Decimal::from(profitable_trades) / Decimal::from(total_trades) * hundred
        } else {
            Decimal::ZERO
        };

        let growth: f64 = sim
            .trades
            .iter()
            .map(|t| 1.0 + t.return_pct / 100.0)
            .product();
        let total_return = to_decimal((growth - 1.0) * 100.0);

        let years = (request.end - request.start).num_seconds() as f64 / SECONDS_PER_YEAR;
        let sharpe_ratio = Self::calculate_sharpe(&sim.trades, years);
        let max_drawdown = to_decimal(max_drawdown_pct(&sim.equity_curve));

        BacktestReport {
            pair: request.pair.clone(),
            timeframe: request.timeframe,
            start: request.start,
            end: request.end,
            bars,
            hedge_ratio,
            total_return,
            sharpe_ratio,
            max_drawdown,
            win_rate,
            total_trades,
            profitable_trades,
            trades: sim.trades,
            equity_curve: sim.equity_curve,
        }
    }

    /// Per-trade Sharpe scaled by √(trades per year over the range)
    fn calculate_sharpe(trades: &[Trade], years: f64) -> Decimal {
        if trades.len() < 2 || years <= 0.0 {
            return Decimal::ZERO;
        }

        let returns: Vec<f64> = trades.iter().map(|t| t.return_pct).collect();
        let n = returns.len() as f64;
        let mean = returns.iter().sum::<f64>() / n;
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
        let std_dev = variance.sqrt();

        if std_dev < 1e-10 {
            return Decimal::ZERO;
        }

        let sharpe = mean / std_dev * (n / years).sqrt();
        if !sharpe.is_finite() {
            return Decimal::ZERO;
        }

        // Round to 2 decimal places
        Decimal::from_str_exact(&format!("{:.2}", sharpe)).unwrap_or(Decimal::ZERO)
    }
}

fn max_drawdown_pct(curve: &[EquityPoint]) -> f64 {
    let mut peak = f64::MIN;
    let mut worst = 0.0;
    for point in curve {
        peak = peak.max(point.equity);
        if peak > 0.0 {
            worst = f64::max(worst, (peak - point.equity) / peak * 100.0);
        }
    }
    worst
}

fn to_decimal(value: f64) -> Decimal {
    Decimal::from_f64(value)
        .map(|d| d.round_dp(4))
        .unwrap_or(Decimal::ZERO)
}
