/// Error types for polling, settings and the source set
pub mod error;

/// Values, trends, roles and the events emitted after a poll
pub mod events;

/// Term search and value formatting
pub mod extract;

/// Threshold alarms
pub mod alerts;

/// Runtime configuration and the persisted settings document
pub mod config;

/// Sources, fetchers, URL grouping and position management
pub mod sources;

/// Periodic refresh timers
pub mod scheduler;

/// The live source set and its observers
pub mod engine;

/// Per-source value log files
pub mod value_log;

// Re-export commonly used types
pub use engine::{SourceObserver, TickerEngine};
pub use error::{ConfigError, FetchError, SourceError, StoreError};
pub use events::{SourceEvent, SourceId, SourceValue, SourceView, Trend};
pub use sources::SourceDraft;
