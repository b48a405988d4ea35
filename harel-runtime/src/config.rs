//! Runtime configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via HAREL_CONFIG or --config)
//! 3. Environment variables

use harel_core::DEFAULT_MAX_MICROSTEPS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Interpreter behaviour.
    pub interpreter: InterpreterConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("HAREL_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies `HAREL_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        self.interpreter.apply_overrides(&lookup);
        self.logging.apply_overrides(&lookup);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interpreter.max_microsteps == 0 {
            return Err(ConfigError::ValidationError(
                "interpreter.max_microsteps must be at least 1".to_string(),
            ));
        }
        if self.logging.filter.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "logging.filter must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Interpreter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterConfig {
    /// Bound on microsteps per macrostep.
    pub max_microsteps: usize,
    /// Queue events sent before `start()` instead of dropping them.
    pub defer_events: bool,
    /// Timer source for delayed sends.
    pub clock: ClockKind,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            max_microsteps: DEFAULT_MAX_MICROSTEPS,
            defer_events: true,
            clock: ClockKind::Tokio,
        }
    }
}

impl InterpreterConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(max) = lookup("HAREL_MAX_MICROSTEPS") {
            if let Ok(n) = max.parse() {
                self.max_microsteps = n;
            }
        }

        if let Some(defer) = lookup("HAREL_DEFER_EVENTS") {
            self.defer_events = defer == "1" || defer.to_lowercase() == "true";
        }

        if let Some(clock) = lookup("HAREL_CLOCK") {
            match clock.to_lowercase().as_str() {
                "tokio" => self.clock = ClockKind::Tokio,
                "simulated" => self.clock = ClockKind::Simulated,
                _ => {}
            }
        }
    }
}

/// Timer source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockKind {
    /// Wall-clock timers on the tokio runtime.
    Tokio,
    /// Manually advanced clock.
    Simulated,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing-subscriber` filter directive, used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "harel=info,harel_core=info,harel_runtime=info".to_string(),
        }
    }
}

impl LoggingConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(filter) = lookup("HAREL_LOG") {
            if !filter.is_empty() {
                self.filter = filter;
            }
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.interpreter.max_microsteps, DEFAULT_MAX_MICROSTEPS);
        assert!(config.interpreter.defer_events);
        assert_eq!(config.interpreter.clock, ClockKind::Tokio);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harel.yaml");
        std::fs::write(
            &path,
            "interpreter:\n  max_microsteps: 32\n  clock: simulated\nlogging:\n  filter: debug\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.interpreter.max_microsteps, 32);
        assert_eq!(config.interpreter.clock, ClockKind::Simulated);
        // Unset fields keep their defaults.
        assert!(config.interpreter.defer_events);
        assert_eq!(config.logging.filter, "debug");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saved.yaml");
        let mut config = Config::default();
        config.interpreter.defer_events = false;
        config.save(&path).unwrap();
        assert_eq!(Config::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_and_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.yaml");
        assert!(matches!(
            Config::from_file(&missing),
            Err(ConfigError::IoError(..))
        ));

        let bad = dir.path().join("bad.yaml");
        std::fs::write(&bad, "interpreter: [1, 2").unwrap();
        let err = Config::from_file(&bad).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(..)));
        assert!(err.to_string().contains("bad.yaml"));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("HAREL_MAX_MICROSTEPS", "8"),
            ("HAREL_DEFER_EVENTS", "false"),
            ("HAREL_CLOCK", "Simulated"),
            ("HAREL_LOG", "harel_runtime=trace"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.interpreter.max_microsteps, 8);
        assert!(!config.interpreter.defer_events);
        assert_eq!(config.interpreter.clock, ClockKind::Simulated);
        assert_eq!(config.logging.filter, "harel_runtime=trace");
    }

    #[test]
    fn test_invalid_override_ignored() {
        let mut config = Config::default();
        config.apply_overrides(|key| match key {
            "HAREL_MAX_MICROSTEPS" => Some("many".to_string()),
            "HAREL_CLOCK" => Some("sundial".to_string()),
            _ => None,
        });
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_validate() {
        let mut config = Config::default();
        config.interpreter.max_microsteps = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }
}
