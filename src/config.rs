//! Trace runner configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via --config or CHARTRUN_CONFIG)
//! 3. Environment variables
//! 4. Command-line flags

use chartrun_core::{EngineLimits, TraceOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Runner configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Trace output shaping.
    pub trace: TraceOptions,
    /// Interpreter iteration caps.
    pub limits: EngineLimits,
}

impl Config {
    /// Loads configuration from `path` (or CHARTRUN_CONFIG), then applies
    /// environment variable overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("CHARTRUN_CONFIG").ok().map(PathBuf::from));

        let mut config = match path {
            Some(path) => {
                let config = Self::from_file(&path)?;
                tracing::debug!("loaded config from {}", path.display());
                config
            }
            None => Self::default(),
        };

        config.apply_env_overrides();
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

    fn apply_env_overrides(&mut self) {
        apply_trace_overrides(&mut self.trace);
        apply_limit_overrides(&mut self.limits);
    }

    /// Rejects settings the interpreter cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.max_eventless == 0 || self.limits.max_internal == 0 {
            return Err(ConfigError::ValidationError(
                "limits must be greater than zero".to_string(),
            ));
        }
        if !self.trace.advance_time.is_finite() || self.trace.advance_time < 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "advance_time must be a non-negative number of seconds, got {}",
                self.trace.advance_time
            )));
        }
        Ok(())
    }
}

fn apply_trace_overrides(trace: &mut TraceOptions) {
    if let Some(leaf_only) = env_flag("CHARTRUN_LEAF_ONLY") {
        trace.leaf_only = leaf_only;
    }

    if let Some(keep_cond) = env_flag("CHARTRUN_KEEP_COND") {
        trace.keep_cond = keep_cond;
    }

    if let Ok(max) = std::env::var("CHARTRUN_MAX_STEPS") {
        if let Ok(n) = max.parse() {
            trace.max_steps = Some(n);
        }
    }

    if let Ok(secs) = std::env::var("CHARTRUN_ADVANCE_TIME") {
        if let Ok(secs) = secs.parse() {
            trace.advance_time = secs;
        }
    }
}

fn apply_limit_overrides(limits: &mut EngineLimits) {
    if let Ok(max) = std::env::var("CHARTRUN_MAX_EVENTLESS") {
        if let Ok(n) = max.parse() {
            limits.max_eventless = n;
        }
    }

    if let Ok(max) = std::env::var("CHARTRUN_MAX_INTERNAL") {
        if let Ok(n) = max.parse() {
            limits.max_internal = n;
        }
    }

    if let Ok(max) = std::env::var("CHARTRUN_MAX_INVOKE_DEPTH") {
        if let Ok(n) = max.parse() {
            limits.max_invoke_depth = n;
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().and_then(|v| parse_flag(&v))
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Configuration errors.
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
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.limits.max_eventless, 100);
        assert_eq!(config.limits.max_internal, 100);
        assert_eq!(config.limits.max_invoke_depth, 16);
        assert!(!config.trace.leaf_only);
        assert_eq!(config.trace.max_steps, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chartrun.yaml");
        std::fs::write(
            &path,
            "trace:\n  leaf_only: true\n  max_steps: 10\nlimits:\n  max_eventless: 25\n  max_invoke_depth: 4\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert!(config.trace.leaf_only);
        assert_eq!(config.trace.max_steps, Some(10));
        assert_eq!(config.limits.max_eventless, 25);
        assert_eq!(config.limits.max_invoke_depth, 4);
        // Unset fields keep their defaults
        assert_eq!(config.limits.max_internal, 100);
        assert!(!config.trace.keep_cond);
    }

    #[test]
    fn test_file_errors() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing.yaml");
        assert!(matches!(
            Config::from_file(&missing),
            Err(ConfigError::IoError(_, _))
        ));

        let bad = dir.path().join("bad.yaml");
        std::fs::write(&bad, "limits: [not, a, map]\n").unwrap();
        let err = Config::from_file(&bad).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_, _)));
        assert!(err.to_string().contains("bad.yaml"));
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.limits.max_internal = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let mut config = Config::default();
        config.trace.advance_time = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag(" 1 "), Some(true));
        assert_eq!(parse_flag("off"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }
}
