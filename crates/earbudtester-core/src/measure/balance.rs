//! Left/right balance verdict
//!
//! Compares the two estimates of a complete result entry:
//!
//! ```text
//! relative_difference = |L - R| / max(L, R)
//! ```
//!
//! Differences below the threshold count as balanced; otherwise the louder
//! side is named.

use crate::stats::store::{ResultEntry, ResultStore};
use std::fmt;
use thiserror::Error;

/// Why no verdict could be produced
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalysisError {
    #[error("No results to analyze")]
    NoResults,

    #[error("Last entry does not contain both left and right measurements")]
    Incomplete {
        left: Option<f64>,
        right: Option<f64>,
    },

    #[error("No signal detected on either side")]
    NoSignal,
}

/// Which side, if any, is louder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Balanced,
    LeftLouder,
    RightLouder,
}

/// Outcome of comparing one left/right pair
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BalanceVerdict {
    pub left: f64,
    pub right: f64,
    /// `|L - R| / max(L, R)`, in [0, 1]
    pub relative_difference: f64,
    pub classification: Classification,
}

impl BalanceVerdict {
    pub fn is_balanced(&self) -> bool {
        self.classification == Classification::Balanced
    }
}

impl fmt::Display for BalanceVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pct = self.relative_difference * 100.0;
        match self.classification {
            Classification::Balanced => write!(f, "Balanced (diff {pct:.2}%)"),
            Classification::LeftLouder => write!(f, "Left louder ({pct:.1}% difference)"),
            Classification::RightLouder => write!(f, "Right louder ({pct:.1}% difference)"),
        }
    }
}

/// Threshold-based balance classifier
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BalanceAnalyzer {
    threshold: f64,
}

impl Default for BalanceAnalyzer {
    fn default() -> Self {
        Self::new(crate::DEFAULT_BALANCE_THRESHOLD)
    }
}

impl BalanceAnalyzer {
    /// Create an analyzer; `threshold` is a fraction, e.g. 0.03 for 3 %
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Compare two non-negative levels
    pub fn compare(&self, left: f64, right: f64) -> Result<BalanceVerdict, AnalysisError> {
        let louder = left.max(right);
        if louder <= 0.0 {
            return Err(AnalysisError::NoSignal);
        }

        let relative_difference = (left - right).abs() / louder;
        let classification = if relative_difference < self.threshold {
            Classification::Balanced
        } else if left > right {
            Classification::LeftLouder
        } else {
            Classification::RightLouder
        };

        Ok(BalanceVerdict {
            left,
            right,
            relative_difference,
            classification,
        })
    }

    /// Verdict for a single entry; both sides must be measured
    pub fn analyze(&self, entry: &ResultEntry) -> Result<BalanceVerdict, AnalysisError> {
        match (
            entry.left.filter(|v| *v >= 0.0),
            entry.right.filter(|v| *v >= 0.0),
        ) {
            (Some(left), Some(right)) => self.compare(left, right),
            _ => Err(AnalysisError::Incomplete {
                left: entry.left,
                right: entry.right,
            }),
        }
    }

    /// Verdict for the most recent entry of `store`
    pub fn analyze_latest(&self, store: &ResultStore) -> Result<BalanceVerdict, AnalysisError> {
        let entry = store.latest().ok_or(AnalysisError::NoResults)?;
        let verdict = self.analyze(entry)?;
        tracing::info!(
            left = verdict.left,
            right = verdict.right,
            relative_difference = verdict.relative_difference,
            threshold = self.threshold,
            classification = ?verdict.classification,
            "Balance analyzed"
        );
        Ok(verdict)
    }
}
