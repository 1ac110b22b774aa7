//! Z-score signal classification

use serde::{Deserialize, Serialize};

use crate::analysis::MetricSnapshot;
use crate::config::AnalysisConfig;
use crate::types::Signal;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalThresholds {
    pub entry_threshold: f64,
}

impl Default for SignalThresholds {
    fn default() -> Self {
        Self {
            entry_threshold: 2.0,
        }
    }
}

impl From<&AnalysisConfig> for SignalThresholds {
    fn from(config: &AnalysisConfig) -> Self {
        Self {
            entry_threshold: config.entry_threshold,
        }
    }
}

/// SHORT when the spread is rich (z ≥ +entry), LONG when cheap (z ≤ −entry)
pub fn classify_zscore(zscore: Option<f64>, thresholds: &SignalThresholds) -> Signal {
    match zscore {
        Some(z) if z >= thresholds.entry_threshold => Signal::Short,
        Some(z) if z <= -thresholds.entry_threshold => Signal::Long,
        _ => Signal::Neutral,
    }
}

pub fn classify_signal(snapshot: &MetricSnapshot, thresholds: &SignalThresholds) -> Signal {
    classify_zscore(snapshot.zscore, thresholds)
}
