use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, StoreError};

/// Application configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Storage engine settings
    pub database: DatabaseConfig,
    /// Log output settings
    pub logging: LoggingConfig,
}

/// Storage engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Directory holding every store
    pub path: String,
    /// Store name, used as the directory under `path`
    pub name: String,
    /// Open a throwaway store that is removed on close
    pub temporary: bool,
    /// Upper bound on how long opening (and migrating) may take
    pub open_timeout_secs: u64,
    /// Background flush interval; `None` flushes only on close
    pub flush_every_ms: Option<u64>,
    /// Page cache size
    pub cache_capacity_bytes: u64,
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    /// Directory for rolling JSON log files
    pub file_path: Option<String>,
    /// "json" or "text"
    pub format: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                file_path: None,
                format: "text".to_string(),
            },
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data".to_string(),
            name: "AppDB".to_string(),
            temporary: false,
            open_timeout_secs: 30,
            flush_every_ms: Some(500),
            cache_capacity_bytes: 64 * 1024 * 1024,
        }
    }
}

impl DatabaseConfig {
    /// Settings for a store living under `dir`.
    pub fn at(dir: &Path) -> Self {
        Self {
            path: dir.display().to_string(),
            ..Self::default()
        }
    }

    /// Settings for an in-memory store.
    pub fn temporary() -> Self {
        Self {
            temporary: true,
            ..Self::default()
        }
    }

    /// Full path of the store directory.
    pub fn store_path(&self) -> PathBuf {
        Path::new(&self.path).join(&self.name)
    }

    /// Open timeout as a `Duration`.
    pub const fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }
}

impl AppConfig {
    /// Load configuration from multiple sources with precedence
    pub fn load() -> Result<Self> {
        Self::build(None)
    }

    /// Load configuration, layering an explicit file over the defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        Self::build(Some(path))
    }

    fn build(explicit: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            // Start with default values
            .add_source(Config::try_from(&Self::default())?)
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false));

        if let Some(path) = explicit {
            builder = builder.add_source(File::from(path).required(true));
        }

        let config = builder
            // Add environment variables with prefix
            .add_source(Environment::with_prefix("HIGHLIGHT_STORE").separator("__"))
            .build()?;

        let app_config: Self = config.try_deserialize()?;

        app_config.validate()?;

        Ok(app_config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.database.name.trim().is_empty() {
            return Err(StoreError::InvalidConfig("database.name must not be empty".to_string()));
        }
        if !self.database.temporary && self.database.path.trim().is_empty() {
            return Err(StoreError::InvalidConfig(
                "database.path must not be empty for a persistent store".to_string(),
            ));
        }
        if self.database.open_timeout_secs == 0 {
            return Err(StoreError::InvalidConfig("open_timeout_secs must be greater than 0".to_string()));
        }
        if self.database.flush_every_ms == Some(0) {
            return Err(StoreError::InvalidConfig("flush_every_ms must be greater than 0".to_string()));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(StoreError::InvalidConfig(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.logging.level, valid_levels
            )));
        }

        let valid_formats = ["text", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(StoreError::InvalidConfig(format!(
                "Invalid log format: {}. Must be one of: {:?}",
                self.logging.format, valid_formats
            )));
        }

        Ok(())
    }
}
