use crate::error::SourceError;
use crate::extract::format_float;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Threshold comparison of an alarm
///
/// Both comparisons are non-strict. Serialized as `">"` and `"<"` in the
/// settings document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = ">")]
    GreaterOrEqual,
    #[serde(rename = "<")]
    LessOrEqual,
}

impl Comparison {
    /// Test a value against a threshold
    pub fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::GreaterOrEqual => value >= threshold,
            Comparison::LessOrEqual => value <= threshold,
        }
    }

    /// Operator as shown in notifications
    pub fn symbol(self) -> &'static str {
        match self {
            Comparison::GreaterOrEqual => ">=",
            Comparison::LessOrEqual => "<=",
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// A one-shot threshold alarm attached to a source
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    pub enabled: bool,
    #[serde(rename = "inequality")]
    pub comparison: Comparison,
    #[serde(rename = "value")]
    pub threshold: f64,
}

impl Alarm {
    /// Create an enabled alarm
    ///
    /// # Errors
    ///
    /// Returns `SourceError::InvalidThreshold` for negative or non-finite thresholds.
    pub fn new(comparison: Comparison, threshold: f64) -> Result<Self, SourceError> {
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(SourceError::InvalidThreshold(threshold));
        }
        Ok(Self {
            enabled: true,
            comparison,
            threshold,
        })
    }

    /// Whether this alarm has the same operator and threshold as another
    pub fn same_condition(&self, other: &Alarm) -> bool {
        self.comparison == other.comparison && self.threshold == other.threshold
    }
}

impl fmt::Display for Alarm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.comparison, format_float(self.threshold))
    }
}
