use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime configuration loaded from an optional TOML file
///
/// Source definitions and alarms do not live here; they belong to the
/// settings document managed by `SettingsStore`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path of the JSON settings document
    pub settings_path: PathBuf,
    /// Directory that per-source value logs are appended under
    pub log_dir: PathBuf,
    pub http: HttpConfig,
}

/// HTTP client settings used for every fetch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub request_timeout_seconds: u64,
    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            settings_path: PathBuf::from("settings.json"),
            log_dir: PathBuf::from("logs"),
            http: HttpConfig::default(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_seconds: 15,
            user_agent: format!("tickwatch/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl HttpConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl Config {
    /// Load and validate a configuration file
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ReadError` if the file cannot be read,
    /// `ConfigError::TomlError` if it is not valid TOML and
    /// `ConfigError::ValidationError` if a value is out of range.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.http.request_timeout_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "http.request_timeout_seconds must be greater than zero".to_string(),
            ));
        }
        if self.settings_path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "settings_path must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.settings_path, PathBuf::from("settings.json"));
        assert_eq!(config.log_dir, PathBuf::from("logs"));
        assert_eq!(config.http.request_timeout(), Duration::from_secs(15));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            log_dir = "/var/log/tickwatch"

            [http]
            request_timeout_seconds = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.log_dir, PathBuf::from("/var/log/tickwatch"));
        assert_eq!(config.settings_path, PathBuf::from("settings.json"));
        assert_eq!(config.http.request_timeout_seconds, 5);
        assert!(config.http.user_agent.starts_with("tickwatch/"));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let result = Config::from_toml_str("[http]\nrequest_timeout_seconds = 0\n");
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_invalid_toml() {
        let result = Config::from_toml_str("log_dir = [");
        assert!(matches!(result, Err(ConfigError::TomlError(_))));
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let dir = TempDir::new().unwrap();
        let result = Config::from_file(&dir.path().join("nope.toml"));
        assert!(matches!(result, Err(ConfigError::ReadError(_))));
    }

    #[test]
    fn test_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tickwatch.toml");
        std::fs::write(&path, "settings_path = \"custom.json\"\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.settings_path, PathBuf::from("custom.json"));
    }
}
