//! Sortable, filterable view over scan rows
//!
//! Filtering and sorting never rescan; they only reorder and hide stored rows.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::scanner::ScanRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortColumn {
    Pair,
    /// |r|
    Correlation,
    Cointegrated,
    /// |z|
    #[serde(rename = "zscore")]
    ZScore,
    Signal,
    /// Current ratio
    Price,
    #[serde(rename = "change_24h")]
    Change24h,
    #[serde(rename = "change_7d")]
    Change7d,
}

impl SortColumn {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pair => "pair",
            Self::Correlation => "correlation",
            Self::Cointegrated => "cointegrated",
            Self::ZScore => "zscore",
            Self::Signal => "signal",
            Self::Price => "price",
            Self::Change24h => "change_24h",
            Self::Change7d => "change_7d",
        }
    }

    /// Ascending comparison of two rows on this column
    fn compare(&self, a: &ScanRow, b: &ScanRow) -> Ordering {
        let (x, y) = (&a.snapshot, &b.snapshot);
        match self {
            Self::Pair => a.pair.to_string().cmp(&b.pair.to_string()),
            Self::Correlation => x.correlation.abs().total_cmp(&y.correlation.abs()),
            Self::Cointegrated => x.cointegration.cointegrated.cmp(&y.cointegration.cointegrated),
            Self::ZScore => cmp_optional(x.zscore.map(f64::abs), y.zscore.map(f64::abs)),
            Self::Signal => a.signal.is_actionable().cmp(&b.signal.is_actionable()),
            Self::Price => cmp_optional(x.current_ratio, y.current_ratio),
            Self::Change24h => cmp_optional(x.change_24h, y.change_24h),
            Self::Change7d => cmp_optional(x.change_7d, y.change_7d),
        }
    }
}

/// Undefined values order below every defined value
fn cmp_optional(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

impl fmt::Display for SortColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortColumn {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pair" => Ok(Self::Pair),
            "correlation" | "corr" => Ok(Self::Correlation),
            "cointegrated" | "coint" => Ok(Self::Cointegrated),
            "zscore" | "z" => Ok(Self::ZScore),
            "signal" => Ok(Self::Signal),
            "price" | "ratio" => Ok(Self::Price),
            "change_24h" | "24h" => Ok(Self::Change24h),
            "change_7d" | "7d" => Ok(Self::Change7d),
            other => Err(EngineError::InvalidRange(format!("unknown sort column '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[serde(alias = "asc")]
    Ascending,
    #[serde(alias = "desc")]
    Descending,
}

impl SortOrder {
    pub fn toggled(self) -> Self {
        match self {
            Self::Ascending => Self::Descending,
            Self::Descending => Self::Ascending,
        }
    }
}

impl FromStr for SortOrder {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "asc" | "ascending" => Ok(Self::Ascending),
            "desc" | "descending" => Ok(Self::Descending),
            other => Err(EngineError::InvalidRange(format!("unknown sort order '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScanTable {
    rows: Vec<ScanRow>,
    filter: String,
    sort: Option<(SortColumn, SortOrder)>,
}

impl ScanTable {
    pub fn new(rows: Vec<ScanRow>) -> Self {
        Self {
            rows,
            filter: String::new(),
            sort: None,
        }
    }

    pub fn sort(&self) -> Option<(SortColumn, SortOrder)> {
        self.sort
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub fn set_filter(&mut self, filter: impl Into<String>) {
        self.filter = filter.into();
    }

    /// Header-click semantics: a new column sorts descending, the same column
    /// toggles direction
    pub fn sort_by(&mut self, column: SortColumn) {
        let order = match self.sort {
            Some((current, order)) if current == column => order.toggled(),
            _ => SortOrder::Descending,
        };
        self.apply_sort(column, order);
    }

    /// Sort by `column` in an explicit direction
    pub fn apply_sort(&mut self, column: SortColumn, order: SortOrder) {
        self.rows.sort_by(|a, b| {
            let ord = column.compare(a, b);
            match order {
                SortOrder::Ascending => ord,
                SortOrder::Descending => ord.reverse(),
            }
        });
        self.sort = Some((column, order));
    }

    pub fn rows(&self) -> &[ScanRow] {
        &self.rows
    }

    /// Rows whose pair name contains the filter, case-insensitively
    pub fn visible_rows(&self) -> Vec<&ScanRow> {
        let needle = self.filter.trim().to_lowercase();
        self.rows
            .iter()
            .filter(|r| needle.is_empty() || r.pair.to_string().to_lowercase().contains(&needle))
            .collect()
    }
}
