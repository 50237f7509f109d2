use thiserror::Error;

/// Errors that can occur while fetching a source endpoint
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("Transport failed: {0}")]
    Transport(String),

    #[error("Request timeout")]
    Timeout,

    #[error("Response is not valid JSON: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Transport(err.to_string())
        }
    }
}

/// Errors that can occur while searching a response tree for a term
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractionError {
    #[error("Response nesting exceeds {0} levels")]
    DepthExceeded(usize),
}

/// Errors that can occur while formatting a numeric value
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FormattingError {
    #[error("Invalid decimal precision: {0}")]
    InvalidPrecision(u32),
}

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid configuration value: {0}")]
    ValidationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Failed to write settings: {0}")]
    Store(#[from] StoreError),
}

/// Errors that can occur when writing the settings document
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to replace settings file: {0}")]
    Persist(String),
}

/// Errors that can occur when appending to a value log
#[derive(Error, Debug)]
pub enum LogSinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned by operations on the live source set
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Unknown source: {0}")]
    UnknownSource(u64),

    #[error("Alarm already exists: {0}")]
    DuplicateAlarm(String),

    #[error("Alarm threshold must be a non-negative number, got {0}")]
    InvalidThreshold(f64),

    #[error("No alarm at index {0}")]
    AlarmIndexOutOfRange(usize),

    #[error("Settings write failed: {0}")]
    Store(#[from] StoreError),
}
