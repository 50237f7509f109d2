//! Core value and event types shared across the poller
//!
//! This module defines the data structures that flow from a poll cycle out to
//! the presentation layer: extracted values, trend directions, source roles and
//! the events emitted after each cycle.

use crate::error::FetchError;
use crate::extract::format_float;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identity of a live source, assigned in insertion order
///
/// Positions change when sources are moved or deleted; the id never does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId(pub u64);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Direction of change between two consecutive numeric values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    Same,
}

impl Trend {
    /// Compare a new value against the one it replaces
    pub fn between(old: f64, new: f64) -> Self {
        if new > old {
            Trend::Up
        } else if new < old {
            Trend::Down
        } else {
            Trend::Same
        }
    }
}

/// Polling role of a source within its URL group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Only member of its URL group
    Standalone,
    /// Elected poller of a shared URL; feeds its secondaries
    Primary,
    /// Silent member of a shared URL, fed by the primary
    Secondary,
}

impl Role {
    /// Whether a source in this role fetches its own URL on a schedule
    pub fn polls(self) -> bool {
        !matches!(self, Role::Secondary)
    }
}

/// Kind of failure surfaced to the presentation layer after a fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FetchErrorKind {
    /// The request itself failed (network, DNS, timeout)
    InvalidUrl,
    /// The response body was not valid JSON
    InvalidApi,
}

impl FetchErrorKind {
    /// Display string shown in place of a value
    pub fn sentinel(self) -> &'static str {
        match self {
            FetchErrorKind::InvalidUrl => "Invalid URL",
            FetchErrorKind::InvalidApi => "Invalid API",
        }
    }
}

impl From<&FetchError> for FetchErrorKind {
    fn from(err: &FetchError) -> Self {
        match err {
            FetchError::Transport(_) | FetchError::Timeout => FetchErrorKind::InvalidUrl,
            FetchError::Parse(_) => FetchErrorKind::InvalidApi,
        }
    }
}

/// Raw value held by a source after a poll cycle
#[derive(Debug, Clone, PartialEq)]
pub enum SourceValue {
    /// Value whose string form parses as a float
    Number(f64),
    /// Anything else, kept as text
    Text(String),
    /// The last fetch failed
    Failed(FetchErrorKind),
}

impl SourceValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            SourceValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for SourceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceValue::Number(n) => f.write_str(&format_float(*n)),
            SourceValue::Text(s) => f.write_str(s),
            SourceValue::Failed(kind) => f.write_str(kind.sentinel()),
        }
    }
}

/// Read-only snapshot of a source handed to the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub struct SourceView {
    pub id: SourceId,
    pub sequence: usize,
    pub name: String,
    pub url: String,
    pub refresh: Option<u64>,
    pub role: Role,
    /// Full raw value, for showing text that was truncated on display
    pub value: Option<SourceValue>,
    /// Formatted display string, capped in length
    pub display: Option<String>,
    pub trend: Option<Trend>,
    pub truncated: bool,
    /// Local time of the last request, `HH:MM:SS`
    pub time: Option<String>,
    pub alarm_count: usize,
}

/// Event emitted once a poll cycle settles
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    ValueUpdated(SourceView),
    AlarmTriggered { source: SourceView, message: String },
    FetchFailed { source: SourceView, kind: FetchErrorKind },
}
