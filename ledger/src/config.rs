//! Ledger configuration.

use std::str::FromStr;
use std::time::Duration;

use corebank_common::DEFAULT_LIMIT;

/// Storage connection configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Database URL.
    pub database_url: String,
    /// Maximum pooled connections.
    pub max_connections: u32,
    /// How long to wait for a pooled connection.
    pub acquire_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/corebank".to_string(),
            max_connections: 10,
            acquire_timeout: Duration::from_millis(5000),
        }
    }
}

/// Retry configuration for serialization conflicts.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Backoff before the second attempt.
    pub base_delay: Duration,
    /// Backoff ceiling.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(500),
        }
    }
}

/// Main ledger configuration.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Page size used when a listing asks for none.
    pub default_page_limit: u32,
    /// Largest page a listing may return.
    pub max_page_limit: u32,
    /// Log level.
    pub log_level: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            retry: RetryConfig::default(),
            default_page_limit: DEFAULT_LIMIT,
            max_page_limit: 100,
            log_level: "info".to_string(),
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl LedgerConfig {
    /// Load configuration from environment variables.
    ///
    /// Unset or unparsable variables keep their defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.storage.database_url = url;
        }

        if let Some(max) = env_parse("LEDGER_MAX_CONNECTIONS") {
            config.storage.max_connections = max;
        }

        if let Some(ms) = env_parse("LEDGER_ACQUIRE_TIMEOUT_MS") {
            config.storage.acquire_timeout = Duration::from_millis(ms);
        }

        if let Some(attempts) = env_parse("LEDGER_RETRY_MAX_ATTEMPTS") {
            config.retry.max_attempts = attempts;
        }

        if let Some(ms) = env_parse("LEDGER_RETRY_BASE_DELAY_MS") {
            config.retry.base_delay = Duration::from_millis(ms);
        }

        if let Some(ms) = env_parse("LEDGER_RETRY_MAX_DELAY_MS") {
            config.retry.max_delay = Duration::from_millis(ms);
        }

        if let Some(limit) = env_parse("LEDGER_DEFAULT_PAGE_LIMIT") {
            config.default_page_limit = limit;
        }

        if let Some(limit) = env_parse("LEDGER_MAX_PAGE_LIMIT") {
            config.max_page_limit = limit;
        }

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log_level = level;
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.storage.database_url.is_empty() {
            return Err("Database URL cannot be empty".to_string());
        }

        if self.storage.max_connections == 0 {
            return Err("Max connections cannot be 0".to_string());
        }

        if self.retry.max_attempts == 0 {
            return Err("Retry attempts cannot be 0".to_string());
        }

        if self.retry.base_delay > self.retry.max_delay {
            return Err("Retry base delay cannot exceed max delay".to_string());
        }

        if self.default_page_limit == 0 {
            return Err("Default page limit cannot be 0".to_string());
        }

        if self.default_page_limit > self.max_page_limit {
            return Err("Default page limit cannot exceed max page limit".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LedgerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_page_limit, 10);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_invalid_config() {
        let mut config = LedgerConfig::default();
        config.storage.max_connections = 0;
        assert!(config.validate().is_err());

        let mut config = LedgerConfig::default();
        config.retry.base_delay = Duration::from_secs(1);
        assert!(config.validate().is_err());

        let mut config = LedgerConfig::default();
        config.default_page_limit = 500;
        assert!(config.validate().is_err());

        let mut config = LedgerConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
