//! A single polled endpoint and its last-known state
//!
//! A `Source` owns its configuration, its alarms and the result of the most
//! recent poll cycle. The network fetch itself happens elsewhere; a source
//! only records when a fetch began and then absorbs either a parsed response
//! tree or a failure.

use crate::alerts::{Alarm, Comparison};
use crate::config::SourceRecord;
use crate::error::SourceError;
use crate::events::{FetchErrorKind, Role, SourceId, SourceValue, SourceView, Trend};
use crate::extract::{self, DISPLAY_CAP, MAX_DECIMALS};
use crate::value_log::LogEntry;
use chrono::{DateTime, Local};
use log::{info, warn};
use serde_json::Value;
use std::sync::Arc;

const MAX_NAME_LEN: usize = 80;
const MAX_URL_LEN: usize = 2048;
const MAX_TERM_LEN: usize = 30;
const MAX_REFRESH_SECONDS: u64 = 9_999_999;
const MAX_USER_POSITION: usize = 999;

/// Whether a fetch is in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Fetching,
}

/// How the last completed poll cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Extracted,
    FetchFailed,
    ParseFailed,
}

/// User-entered properties for adding or editing a source
///
/// Values are normalised on use: over-long text is cut, a refresh of zero
/// means manual refresh only and `position` is 1-based.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceDraft {
    pub name: String,
    pub url: String,
    pub term: Option<String>,
    pub decimals: Option<u32>,
    pub refresh: Option<u64>,
    pub log: bool,
    /// 1-based display position; `None` appends (or keeps the current position on edit)
    pub position: Option<usize>,
}

impl SourceDraft {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_term(mut self, term: impl Into<String>) -> Self {
        self.term = Some(term.into());
        self
    }

    pub fn with_decimals(mut self, decimals: u32) -> Self {
        self.decimals = Some(decimals);
        self
    }

    pub fn with_refresh(mut self, seconds: u64) -> Self {
        self.refresh = Some(seconds);
        self
    }

    pub fn with_log(mut self, log: bool) -> Self {
        self.log = log;
        self
    }

    pub fn at_position(mut self, position: usize) -> Self {
        self.position = Some(position);
        self
    }

    fn name(&self) -> String {
        truncate_chars(&self.name, MAX_NAME_LEN)
    }

    fn url(&self) -> String {
        truncate_chars(self.url.trim(), MAX_URL_LEN)
    }

    fn term(&self) -> Option<String> {
        self.term
            .as_deref()
            .filter(|term| !term.is_empty())
            .map(|term| truncate_chars(term, MAX_TERM_LEN))
    }

    fn decimals(&self) -> Option<u32> {
        self.decimals.map(|d| d.min(MAX_DECIMALS))
    }

    fn refresh(&self) -> Option<u64> {
        match self.refresh {
            Some(0) | None => None,
            Some(seconds) => Some(seconds.min(MAX_REFRESH_SECONDS)),
        }
    }

    /// Zero-based position requested by the user, if one was given and is in range
    pub fn requested_index(&self) -> Option<usize> {
        self.position
            .filter(|p| (1..=MAX_USER_POSITION).contains(p))
            .map(|p| p - 1)
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// What an edit changed that affects grouping or scheduling
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DraftChanges {
    pub url: bool,
    pub refresh: bool,
    pub position: bool,
}

/// One configured remote endpoint
#[derive(Debug, Clone)]
pub struct Source {
    id: SourceId,
    pub name: String,
    pub url: String,
    pub term: Option<String>,
    pub decimals: Option<u32>,
    /// Refresh interval in whole seconds; `None` means manual refresh only
    pub refresh: Option<u64>,
    pub log: bool,
    /// Declared position; dense `0..N-1` once the sequence manager has run
    pub sequence: usize,
    /// Marked for deletion; dropped by the next reorder
    pub removed: bool,
    pub role: Role,
    pub alarms: Vec<Alarm>,
    value: Option<SourceValue>,
    previous: Option<SourceValue>,
    display: Option<String>,
    trend: Option<Trend>,
    truncated: bool,
    time: Option<String>,
    date_time: Option<String>,
    state: PollState,
    last_outcome: Option<PollOutcome>,
    last_tree: Option<Arc<Value>>,
}

impl Source {
    fn blank(id: SourceId) -> Self {
        Self {
            id,
            name: String::new(),
            url: String::new(),
            term: None,
            decimals: None,
            refresh: None,
            log: false,
            sequence: 0,
            removed: false,
            role: Role::Standalone,
            alarms: Vec::new(),
            value: None,
            previous: None,
            display: None,
            trend: None,
            truncated: false,
            time: None,
            date_time: None,
            state: PollState::Idle,
            last_outcome: None,
            last_tree: None,
        }
    }

    /// Build a source from a persisted record
    pub fn from_record(id: SourceId, record: &SourceRecord) -> Self {
        Self {
            name: record.name.clone(),
            url: record.url.clone(),
            term: record.term.clone().filter(|t| !t.is_empty()),
            decimals: record.decimals,
            refresh: record.refresh.filter(|&seconds| seconds > 0),
            log: record.log,
            sequence: record.sequence,
            alarms: record.alarms.clone(),
            ..Self::blank(id)
        }
    }

    /// Build a source from user input, placed at the requested position or `default_position`
    pub fn from_draft(id: SourceId, draft: &SourceDraft, default_position: usize) -> Self {
        let mut source = Self::blank(id);
        source.apply_draft(draft);
        source.sequence = draft.requested_index().unwrap_or(default_position);
        source
    }

    /// Persistable form of this source
    pub fn to_record(&self) -> SourceRecord {
        SourceRecord {
            url: self.url.clone(),
            name: self.name.clone(),
            term: self.term.clone(),
            decimals: self.decimals,
            refresh: self.refresh,
            log: self.log,
            sequence: self.sequence,
            alarms: self.alarms.clone(),
        }
    }

    /// Overwrite properties from user input
    pub fn apply_draft(&mut self, draft: &SourceDraft) -> DraftChanges {
        let url = draft.url();
        let refresh = draft.refresh();
        let changes = DraftChanges {
            url: url != self.url,
            refresh: refresh != self.refresh,
            position: draft
                .requested_index()
                .is_some_and(|index| index != self.sequence),
        };

        self.name = draft.name();
        self.url = url;
        self.term = draft.term();
        self.decimals = draft.decimals();
        self.refresh = refresh;
        self.log = draft.log;
        if let Some(index) = draft.requested_index() {
            self.sequence = index;
        }
        changes
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn value(&self) -> Option<&SourceValue> {
        self.value.as_ref()
    }

    pub fn previous(&self) -> Option<&SourceValue> {
        self.previous.as_ref()
    }

    pub fn display(&self) -> Option<&str> {
        self.display.as_deref()
    }

    pub fn trend(&self) -> Option<Trend> {
        self.trend
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn time(&self) -> Option<&str> {
        self.time.as_deref()
    }

    pub fn date_time(&self) -> Option<&str> {
        self.date_time.as_deref()
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    pub fn last_outcome(&self) -> Option<PollOutcome> {
        self.last_outcome
    }

    pub fn last_tree(&self) -> Option<&Arc<Value>> {
        self.last_tree.as_ref()
    }

    /// Record the request time and enter the fetching state
    pub fn begin_fetch(&mut self, at: DateTime<Local>) {
        self.set_timestamps(
            Some(at.format("%H:%M:%S").to_string()),
            Some(at.format("%m-%d-%Y %H:%M:%S").to_string()),
        );
        self.state = PollState::Fetching;
    }

    /// Adopt request timestamps from the primary that fetched on this source's behalf
    pub fn set_timestamps(&mut self, time: Option<String>, date_time: Option<String>) {
        self.time = time;
        self.date_time = date_time;
    }

    /// Run the extraction pipeline against a freshly fetched tree
    ///
    /// Extracts the term, coerces and formats the result and updates the
    /// trend. The previous value is kept for trend comparison only when a new
    /// value replaces an existing one.
    pub fn apply_tree(&mut self, tree: Arc<Value>) {
        self.truncated = false;
        if let Some(current) = self.value.take() {
            self.previous = Some(current);
        }

        let extracted = match extract::extract(&tree, self.term.as_deref()) {
            Ok(found) => found.and_then(extract::coerce),
            Err(e) => {
                warn!("{}: Value extraction failed: {}", self.name, e);
                None
            }
        };

        match extracted {
            Some(SourceValue::Number(number)) => {
                let formatted = match extract::format_number(number, self.decimals) {
                    Ok(formatted) => formatted,
                    Err(e) => {
                        warn!("{}: Value formatting failed: {}", self.name, e);
                        SourceValue::Number(number).to_string()
                    }
                };
                let (display, truncated) = extract::truncate_display(&formatted, DISPLAY_CAP);
                self.trend = self
                    .previous
                    .as_ref()
                    .and_then(SourceValue::as_number)
                    .map(|old| Trend::between(old, number));
                self.display = Some(display);
                self.truncated = truncated;
                self.value = Some(SourceValue::Number(number));
            }
            Some(other) => {
                let (display, truncated) =
                    extract::truncate_display(&other.to_string(), DISPLAY_CAP);
                self.trend = None;
                self.display = Some(display);
                self.truncated = truncated;
                self.value = Some(other);
            }
            None => {
                self.trend = None;
                self.display = None;
            }
        }

        if let Some(display) = &self.display {
            info!("{}: {}", self.name, display);
        }
        self.last_tree = Some(tree);
        self.state = PollState::Idle;
        self.last_outcome = Some(PollOutcome::Extracted);
    }

    /// Re-run extraction against the last fetched tree, e.g. after the term changed
    ///
    /// Returns `false` if nothing has been fetched yet.
    pub fn reapply_last_tree(&mut self) -> bool {
        match self.last_tree.clone() {
            Some(tree) => {
                self.apply_tree(tree);
                true
            }
            None => false,
        }
    }

    /// Record a failed fetch; the value becomes the failure sentinel
    pub fn fail(&mut self, kind: FetchErrorKind) {
        if let Some(current) = self.value.take() {
            self.previous = Some(current);
        }
        self.value = Some(SourceValue::Failed(kind));
        self.display = Some(kind.sentinel().to_string());
        self.trend = None;
        self.truncated = false;
        self.state = PollState::Idle;
        self.last_outcome = Some(match kind {
            FetchErrorKind::InvalidUrl => PollOutcome::FetchFailed,
            FetchErrorKind::InvalidApi => PollOutcome::ParseFailed,
        });
        warn!("{}: {}", self.name, kind.sentinel());
    }

    /// Entry for the value log, if this source logs and the last cycle extracted a value
    pub fn log_entry(&self) -> Option<LogEntry> {
        if !self.log || self.last_outcome != Some(PollOutcome::Extracted) {
            return None;
        }
        let value = self.value.as_ref()?;
        Some(LogEntry {
            source_name: self.name.clone(),
            date_time: self.date_time.clone().unwrap_or_default(),
            raw_value: value.to_string(),
        })
    }

    /// Current value as a number, if it is one
    pub fn numeric_value(&self) -> Option<f64> {
        self.value.as_ref().and_then(SourceValue::as_number)
    }

    /// Add an enabled alarm, rejecting duplicates of an existing condition
    ///
    /// # Returns
    ///
    /// Index of the new alarm
    pub fn add_alarm(&mut self, comparison: Comparison, threshold: f64) -> Result<usize, SourceError> {
        let alarm = Alarm::new(comparison, threshold)?;
        if self.alarms.iter().any(|existing| existing.same_condition(&alarm)) {
            return Err(SourceError::DuplicateAlarm(alarm.to_string()));
        }
        self.alarms.push(alarm);
        Ok(self.alarms.len() - 1)
    }

    pub fn set_alarm_enabled(&mut self, index: usize, enabled: bool) -> Result<(), SourceError> {
        let alarm = self
            .alarms
            .get_mut(index)
            .ok_or(SourceError::AlarmIndexOutOfRange(index))?;
        alarm.enabled = enabled;
        Ok(())
    }

    /// Remove an alarm; later alarms shift down so indices stay dense
    pub fn remove_alarm(&mut self, index: usize) -> Result<Alarm, SourceError> {
        if index >= self.alarms.len() {
            return Err(SourceError::AlarmIndexOutOfRange(index));
        }
        Ok(self.alarms.remove(index))
    }

    pub fn view(&self) -> SourceView {
        SourceView {
            id: self.id,
            sequence: self.sequence,
            name: self.name.clone(),
            url: self.url.clone(),
            refresh: self.refresh,
            role: self.role,
            value: self.value.clone(),
            display: self.display.clone(),
            trend: self.trend,
            truncated: self.truncated,
            time: self.time.clone(),
            alarm_count: self.alarms.len(),
        }
    }
}
