//! Configuration management for soupstore
//!
//! The storage root is resolved once at startup and handed to every
//! component explicitly. Values come from defaults, a TOML file, or
//! `SOUPSTORE_*` environment variables.

use crate::naming::DEFAULT_DB_NAME;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

mod error;

pub use error::ConfigError;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SoupstoreConfig {
    /// Where databases and blobs live
    pub storage: StorageConfig,

    /// Blob encryption parameters
    pub crypto: CryptoConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Application private storage root; databases go under `<root>/databases`
    pub storage_root: PathBuf,

    /// Store name prefix used when callers do not pick one
    pub name_prefix: String,

    /// Put databases in write-ahead-logging mode on configure
    pub wal: bool,

    /// Issue the SQLCipher compatibility pragmas when opening
    pub sqlcipher_compat: bool,
}

/// Argon2id parameters used to stretch blob encryption keys
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Memory cost in KiB
    pub kdf_memory_kib: u32,

    /// Number of passes
    pub kdf_iterations: u32,

    /// Degree of parallelism
    pub kdf_parallelism: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,

    /// Include target module
    pub with_target: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("./data"),
            name_prefix: DEFAULT_DB_NAME.to_string(),
            wal: true,
            sqlcipher_compat: true,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            kdf_memory_kib: 19 * 1024, // 19 MiB
            kdf_iterations: 2,
            kdf_parallelism: 1,
        }
    }
}

impl CryptoConfig {
    /// Cheap parameters so test suites do not spend seconds per blob
    pub fn for_tests() -> Self {
        Self {
            kdf_memory_kib: 64,
            kdf_iterations: 1,
            kdf_parallelism: 1,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_target: true,
        }
    }
}

impl SoupstoreConfig {
    /// Configuration rooted at `storage_root` with every other value defaulted
    pub fn with_storage_root(storage_root: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.storage.storage_root = storage_root.into();
        config
    }

    /// Load configuration from environment variables
    ///
    /// Environment variables follow the pattern: SOUPSTORE_<SECTION>_<KEY>
    /// Example: SOUPSTORE_STORAGE_ROOT=/var/lib/app
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay `SOUPSTORE_*` environment variables onto this configuration
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(root) = env::var("SOUPSTORE_STORAGE_ROOT") {
            self.storage.storage_root = PathBuf::from(root);
        }
        if let Ok(prefix) = env::var("SOUPSTORE_NAME_PREFIX") {
            self.storage.name_prefix = prefix;
        }
        if let Ok(wal) = env::var("SOUPSTORE_STORAGE_WAL") {
            self.storage.wal = wal
                .parse()
                .map_err(|e| ConfigError::InvalidValue(format!("Invalid WAL flag: {}", e)))?;
        }

        if let Ok(memory) = env::var("SOUPSTORE_KDF_MEMORY_KIB") {
            self.crypto.kdf_memory_kib = memory
                .parse()
                .map_err(|e| ConfigError::InvalidValue(format!("Invalid KDF memory: {}", e)))?;
        }
        if let Ok(iterations) = env::var("SOUPSTORE_KDF_ITERATIONS") {
            self.crypto.kdf_iterations = iterations.parse().map_err(|e| {
                ConfigError::InvalidValue(format!("Invalid KDF iterations: {}", e))
            })?;
        }

        if let Ok(level) = env::var("SOUPSTORE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(json) = env::var("SOUPSTORE_LOG_JSON") {
            self.logging.json_format = json
                .parse()
                .map_err(|e| ConfigError::InvalidValue(format!("Invalid JSON flag: {}", e)))?;
        }

        Ok(())
    }

    /// Load configuration from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let prefix = &self.storage.name_prefix;
        if let Err(e) = crate::naming::validate_name_prefix(prefix) {
            return Err(ConfigError::ValidationFailed(format!("name_prefix: {}", e)));
        }

        if self.crypto.kdf_iterations == 0 || self.crypto.kdf_parallelism == 0 {
            return Err(ConfigError::ValidationFailed(
                "kdf_iterations and kdf_parallelism must be greater than 0".to_string(),
            ));
        }
        // Argon2 needs at least 8 KiB per lane
        if self.crypto.kdf_memory_kib < 8 * self.crypto.kdf_parallelism {
            return Err(ConfigError::ValidationFailed(format!(
                "kdf_memory_kib must be at least {}",
                8 * self.crypto.kdf_parallelism
            )));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::FileWriteError(e.to_string()))?;

        Ok(())
    }
}
