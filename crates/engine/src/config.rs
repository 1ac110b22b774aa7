//! Analysis configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// How basket constituents combine into one effective leg price
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BasketWeighting {
    /// Plain mean: Σ closeᵢ / N, member weights ignored
    Equal,
    /// Weighted mean: Σ (wᵢ / Σw) · closeᵢ
    Weighted,
    /// Weighted sum: Σ wᵢ · closeᵢ
    PriceSum,
}

/// Tuning constants shared by analysis, scanning and backtesting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_rolling_window")]
    pub rolling_window: usize,
    #[serde(default = "default_entry_threshold")]
    pub entry_threshold: f64,
    #[serde(default = "default_exit_threshold")]
    pub exit_threshold: f64,
    #[serde(default = "default_cointegration_p_max")]
    pub cointegration_p_max: f64,
    #[serde(default = "default_basket_weighting")]
    pub basket_weighting: BasketWeighting,
    /// Correlate log returns instead of price levels
    #[serde(default)]
    pub correlation_on_returns: bool,
}

fn default_rolling_window() -> usize {
    20
}

fn default_entry_threshold() -> f64 {
    2.0
}

fn default_exit_threshold() -> f64 {
    0.0
}

fn default_cointegration_p_max() -> f64 {
    0.05
}

fn default_basket_weighting() -> BasketWeighting {
    BasketWeighting::Equal
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            rolling_window: default_rolling_window(),
            entry_threshold: default_entry_threshold(),
            exit_threshold: default_exit_threshold(),
            cointegration_p_max: default_cointegration_p_max(),
            basket_weighting: default_basket_weighting(),
            correlation_on_returns: false,
        }
    }
}

impl AnalysisConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.rolling_window < 3 {
            return Err(EngineError::InvalidConfig(format!(
                "rolling_window must be at least 3, got {}",
                self.rolling_window
            )));
        }
        if !self.entry_threshold.is_finite() || self.entry_threshold <= 0.0 {
            return Err(EngineError::InvalidConfig(format!(
                "entry_threshold must be positive, got {}",
                self.entry_threshold
            )));
        }
        if !self.exit_threshold.is_finite() || self.exit_threshold >= self.entry_threshold {
            return Err(EngineError::InvalidConfig(format!(
                "exit_threshold {} must be below entry_threshold {}",
                self.exit_threshold, self.entry_threshold
            )));
        }
        if !(self.cointegration_p_max > 0.0 && self.cointegration_p_max < 1.0) {
            return Err(EngineError::InvalidConfig(format!(
                "cointegration_p_max must lie in (0, 1), got {}",
                self.cointegration_p_max
            )));
        }
        Ok(())
    }

    /// Parse and validate a JSON document; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| EngineError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            EngineError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AnalysisConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rolling_window, 20);
        assert_eq!(config.basket_weighting, BasketWeighting::Equal);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = AnalysisConfig::from_json(r#"{"entry_threshold": 1.5, "basket_weighting": "price_sum"}"#)
            .unwrap();
        assert_eq!(config.entry_threshold, 1.5);
        assert_eq!(config.rolling_window, 20);
        assert_eq!(config.basket_weighting, BasketWeighting::PriceSum);

        let weighted = AnalysisConfig::from_json(r#"{"basket_weighting": "weighted"}"#).unwrap();
        assert_eq!(weighted.basket_weighting, BasketWeighting::Weighted);
    }

    #[test]
    fn test_out_of_bounds_rejected() {
        let cases = [
            AnalysisConfig { rolling_window: 2, ..Default::default() },
            AnalysisConfig { entry_threshold: 0.0, ..Default::default() },
            AnalysisConfig { exit_threshold: 2.5, ..Default::default() },
            AnalysisConfig { cointegration_p_max: 1.0, ..Default::default() },
        ];
        for config in cases {
            assert!(matches!(config.validate(), Err(EngineError::InvalidConfig(_))));
        }
    }
}
