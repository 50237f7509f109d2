/// Runtime configuration loaded from TOML
pub mod config;

/// Persistent settings document (sources, alarms, display options)
pub mod settings;

pub use config::{Config, HttpConfig};
pub use settings::{
    GlobalOptions, ParsedSettings, SettingsDocument, SettingsStore, SourceRecord, TextSize,
};
