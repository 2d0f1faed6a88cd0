use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(String),
    #[error("config file read error: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("config file parse error: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("config validation failed: {0}")]
    ValidationError(String),
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub registry: RegistryConfig,
    pub database: DatabaseConfig,
    pub training: TrainingConfig,
    pub prediction: PredictionConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RegistryConfig {
    /// Root directory of the on-disk registry (one subdirectory per model).
    pub root_path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    /// SQLite database holding daily OHLCV rows for the feature provider.
    pub daily_db_path: String,
    /// SQLite database the relational metadata copy and prediction
    /// records are upserted into.
    pub metadata_db_path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TrainingConfig {
    /// Number of walk-forward folds.
    pub n_splits: usize,
    /// Fraction of the sample set held out as the final test suffix.
    pub test_size: f64,
    /// Days ahead the binary direction label looks.
    pub horizon_days: u32,
    /// Trading days of history pulled per training run.
    pub lookback_days: u32,
    /// Default algorithm when the CLI does not name one
    /// (logistic / forest / ensemble).
    pub default_algorithm: String,
    /// Auto-promote every freshly registered model to production.
    pub promote_on_register: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PredictionConfig {
    /// Capacity of the in-memory artifact cache.
    pub cache_capacity: usize,
    /// How many features the per-prediction explanation reports.
    pub top_n_features: usize,
    /// Stamped into every persisted prediction record.
    pub feature_version: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            n_splits: 5,
            test_size: 0.2,
            horizon_days: 1,
            lookback_days: 504,
            default_algorithm: "forest".to_string(),
            promote_on_register: false,
        }
    }
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 8,
            top_n_features: 10,
            feature_version: "v1".to_string(),
        }
    }
}

impl Config {
    /// Load config.toml from the working directory.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("config.toml")
    }

    /// Load configuration from the given TOML file.
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        if !Path::new(path).exists() {
            return Err(ConfigError::FileNotFound(format!(
                "{} is missing. Copy config.example.toml to config.toml and fill it in.",
                path
            )));
        }

        let content = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Environment variables beat file values so deployments can relocate
    /// paths without editing the config file.
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("REGISTRY_ROOT_PATH") {
            self.registry.root_path = path;
        }
        if let Ok(path) = std::env::var("DAILY_DB_PATH") {
            self.database.daily_db_path = path;
        }
        if let Ok(path) = std::env::var("METADATA_DB_PATH") {
            self.database.metadata_db_path = path;
        }
        if let Ok(level) = std::env::var("RUST_LOG") {
            self.logging.level = level;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.training.n_splits < 2 {
            return Err(ConfigError::ValidationError(
                "n_splits must be at least 2".to_string(),
            ));
        }
        if self.training.test_size <= 0.0 || self.training.test_size >= 1.0 {
            return Err(ConfigError::ValidationError(
                "test_size must be strictly between 0 and 1".to_string(),
            ));
        }
        if self.training.horizon_days == 0 {
            return Err(ConfigError::ValidationError(
                "horizon_days must be at least 1".to_string(),
            ));
        }
        match self.training.default_algorithm.as_str() {
            "logistic" | "forest" | "ensemble" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "default_algorithm must be one of logistic/forest/ensemble, got '{}'",
                    other
                )))
            }
        }
        if self.prediction.cache_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "cache_capacity must be at least 1".to_string(),
            ));
        }
        if self.registry.root_path.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "registry root_path must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

static GLOBAL_CONFIG: std::sync::OnceLock<Option<Config>> = std::sync::OnceLock::new();

/// Global accessor used by modules that are not handed a Config explicitly.
pub fn get_config() -> Result<&'static Config, ConfigError> {
    let config_option = GLOBAL_CONFIG.get_or_init(|| match Config::load() {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::error!("failed to load config.toml: {}", e);
            None
        }
    });

    config_option
        .as_ref()
        .ok_or_else(|| ConfigError::ValidationError("global config is not initialized".to_string()))
}

/// Install a config loaded elsewhere (CLI flag, test fixture) as the global.
pub fn set_global_config(config: Config) -> Result<(), ConfigError> {
    GLOBAL_CONFIG
        .set(Some(config))
        .map_err(|_| ConfigError::ValidationError("global config already initialized".to_string()))
}
