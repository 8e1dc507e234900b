//! Store configuration
//!
//! A [`StoreConfig`] is validated when the store is opened and never changes
//! afterwards. It can be built in code or loaded from a TOML file.
//!
//! ## Example Configuration
//!
//! ```toml
//! db_identifier = "analytics-prod"
//! local_path = "/var/lib/strata/analytics"
//! init_statements = ["SET preserve_insertion_order = false"]
//! rename_policy = "overwrite"
//!
//! [read_settings]
//! max_memory = "4GB"
//! threads = 4
//!
//! [backup]
//! prefix = "analytics-prod"
//! download_concurrency = 8
//!
//! [backup.provider]
//! type = "s3"
//! bucket = "my-strata-backups"
//! region = "us-east-1"
//!
//! [backup.retry]
//! max_attempts = 5
//! delay_ms = 10000
//! ```

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use strata_duckdb::EngineSettings;

/// Default number of concurrent object downloads during restore
pub const DEFAULT_DOWNLOAD_CONCURRENCY: usize = 8;

/// Default attempts for a transient remote failure
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 5;

/// Default fixed delay between retries in milliseconds
pub const DEFAULT_RETRY_DELAY_MS: u64 = 10_000;

/// Default name prefix of staging tables excluded from size accounting
pub const DEFAULT_STAGING_TABLE_PREFIX: &str = "__strata_tmp_";

/// Complete store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Unique identifier of this database, reported in logs.
    /// Also the remote prefix when `backup.prefix` is unset.
    pub db_identifier: String,

    /// Root directory holding the `write/` and `read/` trees
    pub local_path: PathBuf,

    /// Delete the remote backup on open and start empty
    #[serde(default)]
    pub clean: bool,

    /// Remote backup; `None` keeps the store purely local
    #[serde(default)]
    pub backup: Option<BackupConfig>,

    /// Settings for the read-side engine
    #[serde(default)]
    pub read_settings: EngineSettings,

    /// Settings for the write-side engine
    #[serde(default)]
    pub write_settings: EngineSettings,

    /// Statements run on every newly opened engine instance
    #[serde(default)]
    pub init_statements: Vec<String>,

    /// What renaming onto an existing table does
    #[serde(default)]
    pub rename_policy: RenamePolicy,

    /// Tables with this name prefix are not counted by `size()`
    #[serde(default = "default_staging_prefix")]
    pub staging_table_prefix: String,
}

fn default_staging_prefix() -> String {
    DEFAULT_STAGING_TABLE_PREFIX.to_string()
}

/// Behaviour when the destination of a rename already exists
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenamePolicy {
    /// Replace the destination table (last write wins)
    #[default]
    Overwrite,
    /// Fail with `TableExists`
    ErrorIfExists,
}

/// Remote backup configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Where the backup lives
    pub provider: BackupProvider,

    /// Key prefix scoping this database inside the bucket
    #[serde(default)]
    pub prefix: Option<String>,

    /// Concurrent object downloads during restore
    #[serde(default = "default_download_concurrency")]
    pub download_concurrency: usize,

    /// Retry policy for transient remote failures
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_download_concurrency() -> usize {
    DEFAULT_DOWNLOAD_CONCURRENCY
}

/// Object store backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackupProvider {
    /// Local filesystem (for development and tests)
    Local {
        /// Directory holding the backup objects
        path: PathBuf,
    },

    /// Process-local in-memory store (for tests)
    Memory,

    /// Amazon S3 or an S3-compatible service
    S3 {
        bucket: String,
        region: String,
        /// Optional endpoint URL (for S3-compatible storage like MinIO)
        #[serde(default)]
        endpoint: Option<String>,
        /// Optional access key ID (defaults to environment variable)
        #[serde(default)]
        access_key_id: Option<String>,
        /// Optional secret access key (defaults to environment variable)
        #[serde(default)]
        secret_access_key: Option<String>,
    },

    /// Azure Blob Storage
    Azure {
        account: String,
        container: String,
        #[serde(default)]
        access_key: Option<String>,
    },

    /// Google Cloud Storage
    Gcs {
        bucket: String,
        #[serde(default)]
        service_account_key: Option<PathBuf>,
    },
}

/// Fixed-delay retry for transient remote errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay between attempts in milliseconds
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_ATTEMPTS,
            delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl StoreConfig {
    /// Create a purely local configuration with defaults
    pub fn new(db_identifier: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        Self {
            db_identifier: db_identifier.into(),
            local_path: local_path.into(),
            clean: false,
            backup: None,
            read_settings: EngineSettings::default(),
            write_settings: EngineSettings::default(),
            init_statements: Vec::new(),
            rename_policy: RenamePolicy::default(),
            staging_table_prefix: default_staging_prefix(),
        }
    }

    /// Set the backup configuration
    pub fn with_backup(mut self, backup: BackupConfig) -> Self {
        self.backup = Some(backup);
        self
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            StoreError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        let config: StoreConfig = toml::from_str(&contents).map_err(|e| {
            StoreError::Config(format!("Failed to parse config file {:?}: {}", path, e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check every recognised option
    pub fn validate(&self) -> Result<()> {
        if self.db_identifier.trim().is_empty() {
            return Err(StoreError::Config("db_identifier cannot be empty".into()));
        }
        if self.local_path.as_os_str().is_empty() {
            return Err(StoreError::Config("local_path cannot be empty".into()));
        }
        if let Some(backup) = &self.backup {
            if backup.download_concurrency == 0 {
                return Err(StoreError::Config(
                    "backup.download_concurrency must be at least 1".into(),
                ));
            }
            if backup.retry.max_attempts == 0 {
                return Err(StoreError::Config(
                    "backup.retry.max_attempts must be at least 1".into(),
                ));
            }
        }
        self.read_settings
            .validate()
            .map_err(|e| StoreError::Config(format!("read_settings: {}", e)))?;
        self.write_settings
            .validate()
            .map_err(|e| StoreError::Config(format!("write_settings: {}", e)))?;
        Ok(())
    }

    /// Split the memory and thread budget between the two engines.
    ///
    /// Returns `(read, write)` settings with `max_memory` and `threads` set.
    pub fn resolve_engine_settings(&self) -> Result<(EngineSettings, EngineSettings)> {
        Ok(strata_duckdb::resolve_pair(
            &self.read_settings,
            &self.write_settings,
        )?)
    }

    /// Remote key prefix for this database
    pub fn backup_prefix(&self) -> String {
        self.backup
            .as_ref()
            .and_then(|b| b.prefix.clone())
            .unwrap_or_else(|| self.db_identifier.clone())
    }

    pub(crate) fn write_path(&self) -> PathBuf {
        self.local_path.join("write")
    }

    pub(crate) fn read_path(&self) -> PathBuf {
        self.local_path.join("read")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            db_identifier = "analytics"
            local_path = "/tmp/strata"
            clean = true
            init_statements = ["SET threads = 2"]
            rename_policy = "error_if_exists"

            [read_settings]
            max_memory = "2GB"
            threads = 2

            [write_settings.extra]
            preserve_insertion_order = "false"

            [backup]
            prefix = "tenant-a"

            [backup.provider]
            type = "s3"
            bucket = "backups"
            region = "eu-west-1"
        "#;
        let config: StoreConfig = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert!(config.clean);
        assert_eq!(config.rename_policy, RenamePolicy::ErrorIfExists);
        assert_eq!(config.read_settings.threads, Some(2));
        assert_eq!(
            config.write_settings.extra.get("preserve_insertion_order"),
            Some(&"false".to_string())
        );
        let backup = config.backup.as_ref().unwrap();
        assert_eq!(backup.download_concurrency, DEFAULT_DOWNLOAD_CONCURRENCY);
        assert_eq!(backup.retry, RetryConfig::default());
        assert!(matches!(backup.provider, BackupProvider::S3 { .. }));
        assert_eq!(config.backup_prefix(), "tenant-a");
        assert_eq!(config.staging_table_prefix, DEFAULT_STAGING_TABLE_PREFIX);
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config: StoreConfig =
            toml::from_str("db_identifier = \"x\"\nlocal_path = \"/tmp/x\"").unwrap();
        assert!(config.backup.is_none());
        assert_eq!(config.rename_policy, RenamePolicy::Overwrite);
        assert_eq!(config.backup_prefix(), "x");
        assert!(!config.clean);
    }

    #[test]
    fn test_validate_rejects_empty_identifier() {
        let config = StoreConfig::new("  ", "/tmp/x");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_memory() {
        let mut config = StoreConfig::new("x", "/tmp/x");
        config.read_settings.max_memory = Some("much".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = StoreConfig::new("x", "/tmp/x").with_backup(BackupConfig {
            provider: BackupProvider::Memory,
            prefix: None,
            download_concurrency: 0,
            retry: RetryConfig::default(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata.toml");
        std::fs::write(
            &path,
            "db_identifier = \"files\"\nlocal_path = \"/tmp/files\"\n[backup.provider]\ntype = \"memory\"\n",
        )
        .unwrap();
        let config = StoreConfig::load(&path).unwrap();
        assert!(matches!(
            config.backup.unwrap().provider,
            BackupProvider::Memory
        ));
    }
}
