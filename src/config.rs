//! Configuration loading and validation

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

// Re-export component configs
pub use crate::batch::BatchConfig;
pub use crate::limits::LimitGuardConfig;
pub use crate::monitor::MonitorConfig;
pub use crate::orchestrator::RetryConfig;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub limits: LimitGuardConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

/// Core engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Custodial wallet address payouts are drawn from
    #[serde(default)]
    pub custodial_address: String,

    /// Smallest accepted payout in base units
    #[serde(default = "default_min_payout")]
    pub min_payout: u64,

    /// Largest accepted payout in base units
    #[serde(default = "default_max_payout")]
    pub max_payout: u64,

    /// Cap on payouts in flight (submitted or confirming) at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_payouts: usize,

    /// Registry snapshot path; in-memory only when unset
    #[serde(default)]
    pub persistence_path: Option<String>,
}

fn default_min_payout() -> u64 {
    1_000_000 // 1 USDT
}
fn default_max_payout() -> u64 {
    10_000_000_000 // 10k USDT
}
fn default_max_concurrent() -> usize {
    10
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            custodial_address: String::new(),
            min_payout: default_min_payout(),
            max_payout: default_max_payout(),
            max_concurrent_payouts: default_max_concurrent(),
            persistence_path: None,
        }
    }
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix PAYOUT_)
            .add_source(
                config::Environment::with_prefix("PAYOUT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.engine.min_payout == 0 {
            anyhow::bail!("engine.min_payout must be positive");
        }

        if self.engine.min_payout > self.engine.max_payout {
            anyhow::bail!(
                "engine.min_payout {} exceeds engine.max_payout {}",
                self.engine.min_payout,
                self.engine.max_payout
            );
        }

        if self.engine.max_concurrent_payouts == 0 {
            anyhow::bail!("engine.max_concurrent_payouts must be positive");
        }

        if !self.engine.custodial_address.is_empty() {
            crate::address::validate(&self.engine.custodial_address)
                .map_err(|e| anyhow::anyhow!("engine.custodial_address: {}", e))?;
        }

        if self.limits.hourly_limit > self.limits.daily_limit {
            anyhow::bail!(
                "limits.hourly_limit {} exceeds limits.daily_limit {}",
                self.limits.hourly_limit,
                self.limits.daily_limit
            );
        }

        if self.limits.failure_threshold == 0 {
            anyhow::bail!("limits.failure_threshold must be positive");
        }

        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be positive");
        }

        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            anyhow::bail!(
                "retry.base_delay_ms {} exceeds retry.max_delay_ms {}",
                self.retry.base_delay_ms,
                self.retry.max_delay_ms
            );
        }

        if self.batch.max_batch_size == 0 {
            anyhow::bail!("batch.max_batch_size must be positive");
        }

        if self.monitor.required_confirmations == 0 {
            anyhow::bail!("monitor.required_confirmations must be positive");
        }

        if self.monitor.poll_interval_secs == 0 {
            anyhow::bail!("monitor.poll_interval_secs must be positive");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            limits: LimitGuardConfig::default(),
            retry: RetryConfig::default(),
            batch: BatchConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_min_payout() {
        let mut config = Config::default();
        config.engine.min_payout = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_payout_bounds() {
        let mut config = Config::default();
        config.engine.min_payout = 100;
        config.engine.max_payout = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_custodial_address() {
        let mut config = Config::default();
        config.engine.custodial_address = "not-an-address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_accepts_valid_custodial_address() {
        let mut config = Config::default();
        config.engine.custodial_address = "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_inverted_limits() {
        let mut config = Config::default();
        config.limits.hourly_limit = config.limits.daily_limit + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = Config::load("does-not-exist.toml").unwrap();
        assert_eq!(config.engine.max_concurrent_payouts, 10);
        assert_eq!(config.monitor.required_confirmations, 19);
    }
}
