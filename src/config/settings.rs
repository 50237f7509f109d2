//! Persistent settings document
//!
//! The settings document holds global display options and the ordered list of
//! source records with their alarms. It is loaded once at startup and written
//! back after every mutation. Writes go to a temporary file in the same
//! directory which is then renamed over the original, so a reader never sees a
//! half-written document.

use crate::alerts::Alarm;
use crate::error::{ConfigError, StoreError};
use crate::extract::MAX_DECIMALS;
use log::{debug, info, warn};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tempfile::NamedTempFile;

const DEFAULT_GEOMETRY: &str = "285x310";

/// Text size preference for the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TextSize {
    Small,
    #[default]
    Medium,
    Large,
}

/// Global display options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalOptions {
    pub text: TextSize,
    /// Keep the window on top of others
    pub foreground: bool,
    /// Window geometry, `WIDTHxHEIGHT` with an optional `+X+Y` offset
    pub geometry: String,
}

impl Default for GlobalOptions {
    fn default() -> Self {
        Self {
            text: TextSize::Medium,
            foreground: false,
            geometry: DEFAULT_GEOMETRY.to_string(),
        }
    }
}

impl GlobalOptions {
    /// Replace an unusable geometry with the default
    pub fn sanitized(mut self) -> Self {
        if !is_valid_geometry(&self.geometry) {
            warn!(
                "Invalid geometry in settings: {:?}, using {}",
                self.geometry, DEFAULT_GEOMETRY
            );
            self.geometry = DEFAULT_GEOMETRY.to_string();
        }
        self
    }
}

fn is_valid_geometry(geometry: &str) -> bool {
    let mut parts = geometry.split('+');
    let size = parts.next().unwrap_or_default();
    let size_ok = match size.split_once('x') {
        Some((w, h)) => w.parse::<u32>().is_ok() && h.parse::<u32>().is_ok(),
        None => false,
    };
    let offsets: Vec<&str> = parts.collect();
    let offsets_ok = offsets.is_empty()
        || (offsets.len() == 2 && offsets.iter().all(|o| o.parse::<i32>().is_ok()));
    size_ok && offsets_ok
}

/// One persisted source definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    #[serde(deserialize_with = "null_as_empty")]
    pub url: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub name: String,
    #[serde(default)]
    pub term: Option<String>,
    #[serde(default)]
    pub decimals: Option<u32>,
    /// Refresh interval in whole seconds; absent means manual refresh only
    #[serde(default)]
    pub refresh: Option<u64>,
    #[serde(default)]
    pub log: bool,
    #[serde(default)]
    pub sequence: usize,
    #[serde(default)]
    pub alarms: Vec<Alarm>,
}

impl SourceRecord {
    /// Check a loaded record for values the poller cannot use
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(decimals) = self.decimals {
            if decimals > MAX_DECIMALS {
                return Err(ConfigError::ValidationError(format!(
                    "decimals {} exceeds {}",
                    decimals, MAX_DECIMALS
                )));
            }
        }
        for alarm in &self.alarms {
            if !alarm.threshold.is_finite() || alarm.threshold < 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "alarm threshold {} is not a non-negative number",
                    alarm.threshold
                )));
            }
        }
        Ok(())
    }
}

/// Older files store a blank name or URL as `null`
fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// The whole settings document
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SettingsDocument {
    pub global: GlobalOptions,
    pub apis: Vec<SourceRecord>,
    /// Records that failed to load, kept verbatim and written back after `apis`
    #[serde(skip)]
    pub skipped: Vec<Value>,
}

/// Result of a tolerant parse
#[derive(Debug)]
pub struct ParsedSettings {
    pub document: SettingsDocument,
    /// Records that were skipped, with their position in the file
    pub rejected: Vec<(usize, ConfigError)>,
}

impl SettingsDocument {
    /// Parse a settings document, skipping records that fail to load
    ///
    /// A malformed `global` section falls back to defaults. Each entry of
    /// `apis` is parsed on its own, so one bad record never prevents the
    /// others from loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::JsonError` if the text is not JSON at all and
    /// `ConfigError::ParseError` if the top level is not an object.
    pub fn parse(text: &str) -> Result<ParsedSettings, ConfigError> {
        let root: Value = serde_json::from_str(text)?;
        let Value::Object(mut root) = root else {
            return Err(ConfigError::ParseError(
                "settings document must be a JSON object".to_string(),
            ));
        };

        let global = match root.remove("global") {
            Some(value) => match serde_json::from_value::<GlobalOptions>(value) {
                Ok(global) => global.sanitized(),
                Err(e) => {
                    warn!("Invalid global settings, using defaults: {}", e);
                    GlobalOptions::default()
                }
            },
            None => GlobalOptions::default(),
        };

        let entries = match root.remove("apis") {
            Some(Value::Array(entries)) => entries,
            Some(other) => {
                warn!("Settings 'apis' is not a list (found {}), ignoring it", other);
                Vec::new()
            }
            None => Vec::new(),
        };

        let mut apis = Vec::with_capacity(entries.len());
        let mut skipped = Vec::new();
        let mut rejected = Vec::new();
        for (index, entry) in entries.into_iter().enumerate() {
            let record = serde_json::from_value::<SourceRecord>(entry.clone())
                .map_err(ConfigError::from)
                .and_then(|record| record.validate().map(|_| record));
            match record {
                Ok(record) => apis.push(record),
                Err(e) => {
                    warn!("Skipping settings record {}: {}", index, e);
                    skipped.push(entry);
                    rejected.push((index, e));
                }
            }
        }

        Ok(ParsedSettings {
            document: SettingsDocument {
                global,
                apis,
                skipped,
            },
            rejected,
        })
    }

    /// JSON form written to disk, with skipped records after the live ones
    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        let mut root = serde_json::to_value(self)?;
        if let Some(Value::Array(apis)) = root.get_mut("apis") {
            apis.extend(self.skipped.iter().cloned());
        }
        Ok(root)
    }
}

/// Shared handle to the settings document and its file
///
/// Every mutation goes through `update`, which applies the change to a copy,
/// writes the copy to disk and only then makes it current. Concurrent callers
/// are serialised by an internal mutex.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    document: Mutex<SettingsDocument>,
}

impl SettingsStore {
    /// Open the settings file, creating it with defaults if it does not exist
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file exists but cannot be read or is not a
    /// JSON object, or if a new default file cannot be written.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();

        if !path.exists() {
            info!(
                "No settings file found at {}, saving a new one",
                path.display()
            );
            let store = Self {
                path,
                document: Mutex::new(SettingsDocument::default()),
            };
            store.save()?;
            return Ok(store);
        }

        let text = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        let parsed = SettingsDocument::parse(&text)?;
        info!(
            "Loaded {} source(s) from {} ({} skipped)",
            parsed.document.apis.len(),
            path.display(),
            parsed.rejected.len()
        );

        Ok(Self {
            path,
            document: Mutex::new(parsed.document),
        })
    }

    /// Build a store around an existing document without touching disk
    pub fn with_document(path: impl Into<PathBuf>, document: SettingsDocument) -> Self {
        Self {
            path: path.into(),
            document: Mutex::new(document),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> SettingsDocument {
        self.lock().clone()
    }

    pub fn global(&self) -> GlobalOptions {
        self.lock().global.clone()
    }

    pub fn records(&self) -> Vec<SourceRecord> {
        self.lock().apis.clone()
    }

    /// Apply a change and write it to disk, all or nothing
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the write fails; the in-memory document is left
    /// unchanged in that case.
    pub fn update<F>(&self, mutate: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut SettingsDocument),
    {
        let mut current = self.lock();
        let mut next = current.clone();
        mutate(&mut next);
        write_atomic(&self.path, &next)?;
        *current = next;
        debug!("Settings saved to {}", self.path.display());
        Ok(())
    }

    /// Write the current document to disk
    pub fn save(&self) -> Result<(), StoreError> {
        let current = self.lock();
        write_atomic(&self.path, &current)?;
        debug!("Settings saved to {}", self.path.display());
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, SettingsDocument> {
        self.document
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn write_atomic(path: &Path, document: &SettingsDocument) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let mut file = NamedTempFile::new_in(&dir)?;
    serde_json::to_writer_pretty(&mut file, &document.to_json()?)?;
    file.write_all(b"\n")?;
    file.as_file().sync_all()?;
    file.persist(path)
        .map_err(|e| StoreError::Persist(e.error.to_string()))?;
    Ok(())
}
