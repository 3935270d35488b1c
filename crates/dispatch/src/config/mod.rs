use std::path::{Path, PathBuf};

use polyvox_common::config::DispatchConfig;

/// Load dispatch configuration from a TOML file.
///
/// A missing file yields the documented defaults; a malformed or invalid
/// file is a startup error — the service refuses to run misconfigured.
pub fn load_config(path: &Path) -> Result<DispatchConfig, ConfigError> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "No config file found, using defaults");
        return Ok(DispatchConfig::default());
    }

    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let config: DispatchConfig = toml::from_str(&content).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;

    validate(&config)?;

    tracing::info!(path = %path.display(), "Configuration loaded");
    Ok(config)
}

fn validate(config: &DispatchConfig) -> Result<(), ConfigError> {
    if config.selection_shards == 0 {
        return Err(ConfigError::Validation(
            "selection_shards must be at least 1".to_string(),
        ));
    }
    if config.node_capacity < 1 {
        return Err(ConfigError::Validation(
            "node_capacity must be at least 1".to_string(),
        ));
    }
    if config.max_retry_attempts < 0 {
        return Err(ConfigError::Validation(
            "max_retry_attempts must be non-negative".to_string(),
        ));
    }
    if config.pending_drain_interval_seconds == 0 || config.reclaimer_interval_seconds == 0 {
        return Err(ConfigError::Validation(
            "sweeper intervals must be non-zero".to_string(),
        ));
    }
    if config.stuck_threshold_minutes < 1 {
        return Err(ConfigError::Validation(
            "stuck_threshold_minutes must be at least 1".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {detail}")]
    Parse { path: PathBuf, detail: String },

    #[error("Validation failed: {0}")]
    Validation(String),
}

impl From<ConfigError> for polyvox_common::PolyvoxError {
    fn from(e: ConfigError) -> Self {
        polyvox_common::PolyvoxError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: DispatchConfig = toml::from_str("node_capacity = 4").unwrap();
        assert_eq!(config.node_capacity, 4);
        assert_eq!(config.max_retry_attempts, 10);
        assert_eq!(config.pending_drain_interval_seconds, 30);
        assert_eq!(config.lock.default_ttl_seconds, 30);
    }

    #[test]
    fn test_defaults_match_documented_tunables() {
        let config = DispatchConfig::default();
        assert_eq!(config.pending_drain_interval_seconds, 30);
        assert_eq!(config.reclaimer_interval_seconds, 300);
        assert_eq!(config.stuck_threshold_minutes, 30);
        assert_eq!(config.node_capacity, 10);
        assert_eq!(config.max_retry_attempts, 10);
        assert_eq!(config.liveness_window_seconds, 300);
        assert_eq!(config.selection_shards, 5);
        assert_eq!(config.lock.default_wait_seconds, 5);
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_zero_shards_rejected() {
        let config: DispatchConfig = toml::from_str("selection_shards = 0").unwrap();
        assert!(matches!(
            validate(&config),
            Err(ConfigError::Validation(_))
        ));
    }
}
