//! Numeric helpers shared by the metrics engine
//!
//! Every helper returns `None` instead of NaN or infinity, so undefined values
//! never leak past this module.

/// Relative threshold under which a centered sum of squares counts as zero
const DEGENERATE_RATIO: f64 = 1e-20;

pub fn mean(xs: &[f64]) -> Option<f64> {
    if xs.is_empty() {
        return None;
    }
    Some(xs.iter().sum::<f64>() / xs.len() as f64)
}

/// Sample (n − 1) standard deviation
pub fn sample_std(xs: &[f64]) -> Option<f64> {
    if xs.len() < 2 {
        return None;
    }
    let m = mean(xs)?;
    let variance = xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (xs.len() - 1) as f64;
    let std = variance.sqrt();
    std.is_finite().then_some(std)
}

/// Centered sum of squares, or `None` when the series has no dispersion
fn centered_ss(xs: &[f64], m: f64) -> Option<f64> {
    let ss: f64 = xs.iter().map(|x| (x - m).powi(2)).sum();
    let raw: f64 = xs.iter().map(|x| x * x).sum();
    if !ss.is_finite() || ss <= DEGENERATE_RATIO * raw {
        None
    } else {
        Some(ss)
    }
}

/// Pearson correlation clamped to [-1, 1].
///
/// Returns `None` for mismatched lengths, fewer than two points, or a series
/// without variance.
pub fn pearson(x: &[f64], y: &[f64]) -> Option<f64> {
    if x.len() != y.len() || x.len() < 2 {
        return None;
    }
    let mx = mean(x)?;
    let my = mean(y)?;
    let sxx = centered_ss(x, mx)?;
    let syy = centered_ss(y, my)?;
    let sxy: f64 = x.iter().zip(y).map(|(a, b)| (a - mx) * (b - my)).sum();

    let r = sxy / (sxx.sqrt() * syy.sqrt());
    r.is_finite().then(|| r.clamp(-1.0, 1.0))
}

/// Ordinary least squares fit of `y = intercept + slope · x`
#[derive(Debug, Clone, PartialEq)]
pub struct LinearFit {
    pub intercept: f64,
    pub slope: f64,
    /// Standard error of the slope, defined when n > 2
    pub slope_std_err: Option<f64>,
    pub residuals: Vec<f64>,
}

pub fn linear_regression(x: &[f64], y: &[f64]) -> Option<LinearFit> {
    if x.len() != y.len() || x.len() < 2 {
        return None;
    }
    let n = x.len();
    let mx = mean(x)?;
    let my = mean(y)?;
    let sxx = centered_ss(x, mx)?;
    let sxy: f64 = x.iter().zip(y).map(|(a, b)| (a - mx) * (b - my)).sum();

    let slope = sxy / sxx;
    let intercept = my - slope * mx;
    if !slope.is_finite() || !intercept.is_finite() {
        return None;
    }

    let residuals: Vec<f64> = x
        .iter()
        .zip(y)
        .map(|(a, b)| b - intercept - slope * a)
        .collect();

    let slope_std_err = if n > 2 {
        let sse: f64 = residuals.iter().map(|r| r * r).sum();
        let se = (sse / (n - 2) as f64 / sxx).sqrt();
        se.is_finite().then_some(se)
    } else {
        None
    };

    Some(LinearFit {
        intercept,
        slope,
        slope_std_err,
        residuals,
    })
}

/// Simple returns `x[i] / x[i-1] - 1`, undefined where |x[i-1]| ≤ tolerance.
/// The output has one element fewer than the input.
pub fn pct_changes(xs: &[f64], tolerance: f64) -> Vec<Option<f64>> {
    xs.windows(2)
        .map(|w| {
            if w[0].abs() <= tolerance {
                None
            } else {
                let r = (w[1] - w[0]) / w[0];
                r.is_finite().then_some(r)
            }
        })
        .collect()
}

/// Log returns of a strictly positive series
pub fn log_returns(xs: &[f64]) -> Vec<f64> {
    xs.windows(2).map(|w| (w[1] / w[0]).ln()).collect()
}

/// Trailing-window sample std; a window containing an undefined value is undefined.
/// `out[i]` covers `values[i + 1 - window ..= i]`.
pub fn rolling_std(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if window < 2 {
        return out;
    }
    for i in (window - 1)..values.len() {
        let slice: Option<Vec<f64>> = values[i + 1 - window..=i].iter().copied().collect();
        out[i] = slice.and_then(|s| sample_std(&s));
    }
    out
}

/// Per-bar output of [`rolling_hedge`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RollingHedge {
    pub slope: Vec<Option<f64>>,
    pub zscore: Vec<Option<f64>>,
}

/// Trailing OLS of `y` on `x` over each window ending at bar i.
///
/// The slope is the hedge ratio fitted on that window alone; the z-score is
/// the newest residual over the std of the window's residuals. A window whose
/// residual std does not exceed `rel_tolerance · mean|y|` is flat and scores 0.
/// Nothing outside the window affects bar i.
pub fn rolling_hedge(x: &[f64], y: &[f64], window: usize, rel_tolerance: f64) -> RollingHedge {
    let n = x.len().min(y.len());
    let mut out = RollingHedge {
        slope: vec![None; n],
        zscore: vec![None; n],
    };
    if window < 3 {
        return out;
    }
    for i in (window - 1)..n {
        let range = i + 1 - window..i + 1;
        let Some(fit) = linear_regression(&x[range.clone()], &y[range.clone()]) else {
            continue;
        };
        out.slope[i] = Some(fit.slope);

        let tolerance = rel_tolerance * y[range].iter().map(|v| v.abs()).sum::<f64>() / window as f64;
        let Some(sd) = sample_std(&fit.residuals) else {
            continue;
        };
        out.zscore[i] = if sd <= tolerance {
            Some(0.0)
        } else {
            let z = fit.residuals[window - 1] / sd;
            z.is_finite().then_some(z)
        };
    }
    out
}

/// Trailing-window Pearson correlation of two aligned series
pub fn rolling_pearson(x: &[f64], y: &[f64], window: usize) -> Vec<Option<f64>> {
    let n = x.len().min(y.len());
    let mut out = vec![None; n];
    if window < 2 {
        return out;
    }
    for i in (window - 1)..n {
        out[i] = pearson(&x[i + 1 - window..=i], &y[i + 1 - window..=i]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_std() {
        let xs = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let sd = sample_std(&xs).unwrap();
        assert!((sd - 2.138_089_935).abs() < 1e-9);
        assert!(sample_std(&[1.0]).is_none());
    }

    #[test]
    fn test_pearson_self_is_one_and_bounded() {
        let xs: Vec<f64> = (0..50).map(|i| 100.0 + (i as f64 * 0.7).sin() * 3.0).collect();
        let r = pearson(&xs, &xs).unwrap();
        assert!((r - 1.0).abs() < 1e-12);

        let inv: Vec<f64> = xs.iter().map(|x| -x).collect();
        let r = pearson(&xs, &inv).unwrap();
        assert!((r + 1.0).abs() < 1e-12);
        assert!((-1.0..=1.0).contains(&r));
    }

    #[test]
    fn test_pearson_zero_variance_is_undefined() {
        let flat = vec![100.0; 30];
        let moving: Vec<f64> = (0..30).map(|i| i as f64).collect();
        assert!(pearson(&flat, &moving).is_none());
        assert!(pearson(&[1.0, 2.0], &[1.0]).is_none());
    }

    #[test]
    fn test_linear_regression_recovers_line() {
        let x: Vec<f64> = (0..20).map(|i| i as f64).collect();
        let y: Vec<f64> = x.iter().map(|v| 3.0 + 2.0 * v).collect();
        let fit = linear_regression(&x, &y).unwrap();
        assert!((fit.slope - 2.0).abs() < 1e-12);
        assert!((fit.intercept - 3.0).abs() < 1e-9);
        assert!(fit.slope_std_err.unwrap() < 1e-9);
        assert!(fit.residuals.iter().all(|r| r.abs() < 1e-9));
    }

    #[test]
    fn test_pct_changes_respects_tolerance() {
        let r = pct_changes(&[100.0, 110.0, 0.0, 5.0], 1e-9);
        assert_eq!(r.len(), 3);
        assert!((r[0].unwrap() - 0.1).abs() < 1e-12);
        assert!((r[1].unwrap() + 1.0).abs() < 1e-12);
        assert!(r[2].is_none());
    }

    #[test]
    fn test_rolling_hedge_warmup_and_exact_fit() {
        let x: Vec<f64> = (0..10).map(|i| 10.0 + i as f64).collect();
        let y: Vec<f64> = x.iter().map(|v| 1.0 + 2.0 * v).collect();
        let hedge = rolling_hedge(&x, &y, 4, 1e-9);
        assert!(hedge.zscore[..3].iter().all(|v| v.is_none()));
        assert!(hedge.zscore[3..].iter().all(|v| *v == Some(0.0)));
        assert!(hedge.slope[3..].iter().all(|b| (b.unwrap() - 2.0).abs() < 1e-9));

        // a flat regressor has no slope
        let flat = vec![5.0; 10];
        let hedge = rolling_hedge(&flat, &y, 4, 1e-9);
        assert!(hedge.slope.iter().all(|b| b.is_none()));
        assert!(hedge.zscore.iter().all(|z| z.is_none()));
    }

    #[test]
    fn test_rolling_hedge_is_prefix_invariant_and_scale_free() {
        let x: Vec<f64> = (0..60).map(|i| 50.0 + (i as f64 * 0.3).cos() * 3.0 + i as f64 * 0.1).collect();
        let y: Vec<f64> = x
            .iter()
            .enumerate()
            .map(|(i, v)| 2.0 * v + (i as f64 * 0.45).sin() * 2.0 + (i % 7) as f64)
            .collect();
        let base = rolling_hedge(&x, &y, 20, 1e-9);

        let mut x_ext: Vec<f64> = (0..15).map(|i| 80.0 - i as f64).collect();
        let mut y_ext: Vec<f64> = (0..15).map(|i| 10.0 + i as f64 * 3.0).collect();
        x_ext.extend(&x);
        y_ext.extend(&y);
        let extended = rolling_hedge(&x_ext, &y_ext, 20, 1e-9);
        for i in 19..x.len() {
            let a = base.zscore[i].unwrap();
            let b = extended.zscore[i + 15].unwrap();
            assert!((a - b).abs() < 1e-9, "index {i}: {a} vs {b}");
            assert!((base.slope[i].unwrap() - extended.slope[i + 15].unwrap()).abs() < 1e-9);
        }

        let scaled: Vec<f64> = y.iter().map(|v| v * 1000.0).collect();
        let z_scaled = rolling_hedge(&x, &scaled, 20, 1e-9).zscore;
        for i in 19..x.len() {
            assert!((base.zscore[i].unwrap() - z_scaled[i].unwrap()).abs() < 1e-9);
        }
    }

    #[test]
    fn test_rolling_std_propagates_gaps() {
        let values = vec![Some(1.0), Some(2.0), None, Some(4.0), Some(5.0), Some(6.0)];
        let sd = rolling_std(&values, 3);
        assert_eq!(sd[1], None);
        assert_eq!(sd[2], None);
        assert_eq!(sd[3], None);
        assert_eq!(sd[4], None);
        assert!((sd[5].unwrap() - 1.0).abs() < 1e-12);
    }
}
