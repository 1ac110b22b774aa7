//! Engle–Granger cointegration test
//!
//! Step 1 regresses the long leg on the short leg (with intercept). Step 2 runs
//! an augmented Dickey–Fuller regression without constant on the residuals,
//! picking the lag order by AIC, and converts the statistic to a p-value with
//! the MacKinnon (1994) response surface for two variables with constant.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use tracing::debug;

use crate::stats::linear_regression;

/// Below this many aligned bars the test is not attempted
pub const MIN_COINTEGRATION_BARS: usize = 20;

// MacKinnon (1994) surface, N = 2, constant term
const TAU_MAX: f64 = 0.92;
const TAU_MIN: f64 = -18.86;
const TAU_STAR: f64 = -2.62;
const TAU_SMALL_P: [f64; 3] = [2.92, 1.5012, 0.039796];
const TAU_LARGE_P: [f64; 4] = [2.1945, 0.64695, -0.29198, -0.042377];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CointegrationResult {
    pub cointegrated: bool,
    pub p_value: f64,
    pub test_statistic: Option<f64>,
    pub lags_used: Option<usize>,
}

impl CointegrationResult {
    /// Too little data or a degenerate regression
    pub fn undetermined() -> Self {
        Self {
            cointegrated: false,
            p_value: 1.0,
            test_statistic: None,
            lags_used: None,
        }
    }
}

/// Outcome of the residual ADF regression
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdfOutcome {
    pub statistic: f64,
    pub lags: usize,
    pub nobs: usize,
}

struct AdfFit {
    t_stat: f64,
    sse: f64,
    nobs: usize,
}

/// Run the two-step test. Never fails: undefined cases report p = 1.0.
pub fn engle_granger(long: &[f64], short: &[f64], p_max: f64) -> CointegrationResult {
    let n = long.len();
    if n != short.len() || n < MIN_COINTEGRATION_BARS {
        return CointegrationResult::undetermined();
    }

    let Some(fit) = linear_regression(short, long) else {
        debug!(bars = n, "Cointegration regression degenerate");
        return CointegrationResult::undetermined();
    };

    match adf_no_constant(&fit.residuals, max_adf_lag(n)) {
        Some(adf) => {
            let p_value = mackinnon_p_value(adf.statistic);
            CointegrationResult {
                cointegrated: p_value < p_max,
                p_value,
                test_statistic: Some(adf.statistic),
                lags_used: Some(adf.lags),
            }
        }
        None => CointegrationResult::undetermined(),
    }
}

/// Schwert's rule: ⌊12 · (n / 100)^¼⌋
pub fn max_adf_lag(n: usize) -> usize {
    (12.0 * (n as f64 / 100.0).powf(0.25)).floor() as usize
}

/// ADF regression `Δyₜ = ρ·yₜ₋₁ + Σ γᵢ·Δyₜ₋ᵢ + εₜ` with the lag order chosen
/// by AIC over a common sample, then refit on the longest sample for that lag.
pub fn adf_no_constant(y: &[f64], max_lag: usize) -> Option<AdfOutcome> {
    if y.len() < 4 {
        return None;
    }
    let dy: Vec<f64> = y.windows(2).map(|w| w[1] - w[0]).collect();

    let mut max_lag = max_lag.min(dy.len());
    while max_lag > 0 && dy.len() - max_lag <= max_lag + 2 {
        max_lag -= 1;
    }

    let mut best: Option<(usize, f64)> = None;
    for lags in 0..=max_lag {
        let Some(fit) = adf_ols(y, &dy, lags, max_lag) else {
            continue;
        };
        let nobs = fit.nobs as f64;
        let aic = nobs * (fit.sse / nobs).ln() + 2.0 * (lags + 1) as f64;
        if !aic.is_finite() {
            continue;
        }
        if best.map_or(true, |(_, best_aic)| aic < best_aic) {
            best = Some((lags, aic));
        }
    }

    let (lags, _) = best?;
    let fit = adf_ols(y, &dy, lags, lags)?;
    Some(AdfOutcome {
        statistic: fit.t_stat,
        lags,
        nobs: fit.nobs,
    })
}

/// OLS of `dy[t]` on `y[t]` and `lags` lagged differences for `t ≥ start`
fn adf_ols(y: &[f64], dy: &[f64], lags: usize, start: usize) -> Option<AdfFit> {
    let rows = dy.len().checked_sub(start)?;
    let cols = 1 + lags;
    if rows <= cols {
        return None;
    }

    let mut x_data = Vec::with_capacity(rows * cols);
    let mut target = Vec::with_capacity(rows);
    for t in start..dy.len() {
        target.push(dy[t]);
        x_data.push(y[t]);
        for i in 1..=lags {
            x_data.push(dy[t - i]);
        }
    }

    let x = DMatrix::from_row_slice(rows, cols, &x_data);
    let y_vec = DVector::from_vec(target);

    let xtx_inv = (x.transpose() * &x).try_inverse()?;
    let beta = &xtx_inv * (x.transpose() * &y_vec);
    let residuals = &y_vec - &x * &beta;
    let sse = residuals.norm_squared();

    let sigma2 = sse / (rows - cols) as f64;
    let se = (sigma2 * xtx_inv[(0, 0)]).sqrt();
    if !(se.is_finite() && se > 0.0) {
        return None;
    }
    let t_stat = beta[0] / se;

    t_stat.is_finite().then_some(AdfFit {
        t_stat,
        sse,
        nobs: rows,
    })
}

/// Approximate p-value of an Engle–Granger ADF statistic
pub fn mackinnon_p_value(stat: f64) -> f64 {
    if stat > TAU_MAX {
        return 1.0;
    }
    if stat < TAU_MIN {
        return 0.0;
    }
    let coeffs: &[f64] = if stat <= TAU_STAR {
        &TAU_SMALL_P
    } else {
        &TAU_LARGE_P
    };
    let z = coeffs
        .iter()
        .enumerate()
        .map(|(i, c)| c * stat.powi(i as i32))
        .sum::<f64>();

    Normal::new(0.0, 1.0).map(|n| n.cdf(z)).unwrap_or(1.0)
}
