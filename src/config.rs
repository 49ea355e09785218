use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{LedgerError, Result};
use crate::ledger::canonical::FormatVersion;
use crate::ledger::scope::ScopePolicy;

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "chain-ledger.toml";

/// Environment variable prefix, e.g. `LEDGER_DATABASE_URL`.
pub const ENV_PREFIX: &str = "LEDGER";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout_ms: u64,
    pub append_max_retries: u32,
    pub append_retry_backoff_ms: u64,
    pub append_timeout_ms: u64,
    pub verify_page_size: u32,
    pub checkpoint_interval: u64,
    pub scope_policy: ScopePolicy,
    pub format_version: u8,
    pub max_state_bytes: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://chain-ledger.db".to_string(),
            max_connections: 8,
            acquire_timeout_ms: 5_000,
            append_max_retries: 5,
            append_retry_backoff_ms: 10,
            append_timeout_ms: 5_000,
            verify_page_size: 500,
            checkpoint_interval: 1_000,
            scope_policy: ScopePolicy::Open,
            format_version: FormatVersion::CURRENT.as_u8(),
            max_state_bytes: 1024 * 1024,
        }
    }
}

impl LedgerConfig {
    /// Load defaults, then `chain-ledger.toml` (if present), then `LEDGER_*` env vars.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(DEFAULT_CONFIG_FILE), false)
    }

    /// Load with an explicit config file. A missing file is an error when `required`.
    pub fn load_from(path: &Path, required: bool) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path).required(required))
            .add_source(::config::Environment::with_prefix(ENV_PREFIX))
            .build()?;

        let config: LedgerConfig = settings.try_deserialize()?;
        config.validate()?;

        info!(
            "Ledger configuration loaded (database: {}, policy: {:?}, format v{})",
            config.database_url, config.scope_policy, config.format_version
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(LedgerError::Config("database_url must not be empty".to_string()));
        }
        if self.max_connections == 0 {
            return Err(LedgerError::Config("max_connections must be at least 1".to_string()));
        }
        if self.append_max_retries == 0 {
            return Err(LedgerError::Config(
                "append_max_retries must be at least 1".to_string(),
            ));
        }
        if self.verify_page_size == 0 {
            return Err(LedgerError::Config("verify_page_size must be at least 1".to_string()));
        }
        if self.checkpoint_interval == 0 {
            return Err(LedgerError::Config(
                "checkpoint_interval must be at least 1".to_string(),
            ));
        }
        if self.max_state_bytes == 0 {
            return Err(LedgerError::Config("max_state_bytes must be at least 1".to_string()));
        }
        self.writer_format()?;
        Ok(())
    }

    /// Encoding version new entries are written with.
    pub fn writer_format(&self) -> Result<FormatVersion> {
        FormatVersion::from_u8(self.format_version).ok_or_else(|| {
            LedgerError::Config(format!("unsupported format_version {}", self.format_version))
        })
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn append_timeout(&self) -> Duration {
        Duration::from_millis(self.append_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.append_retry_backoff_ms)
    }
}
