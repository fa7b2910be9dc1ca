use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the history cache daemon.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Whether drained history is processed as a server or a proxy.
    #[serde(default)]
    pub role: Role,

    /// Number of concurrent sync workers. Default: 4.
    #[serde(default = "default_syncers")]
    pub syncers: usize,

    /// Cache sizing and sync cadence.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Synthetic load used by the `simulate` command.
    #[serde(default)]
    pub simulate: SimulateConfig,
}

/// Processing role of the sync workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Item merge, history, triggers and trends.
    #[default]
    Server,
    /// Raw values and log positions only.
    Proxy,
}

/// Cache sizing and sync cadence.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Bytes reserved for history slots. Default: 8MiB.
    #[serde(default = "default_history_cache_size")]
    pub history_cache_size: usize,

    /// Bytes reserved for string values. Default: 16MiB.
    #[serde(default = "default_text_cache_size")]
    pub text_cache_size: usize,

    /// Bytes budgeted for open trend aggregates. Default: 4MiB.
    #[serde(default = "default_trend_cache_size")]
    pub trend_cache_size: usize,

    /// Records drained per sync round. Default: 1000.
    #[serde(default = "default_sync_batch_max")]
    pub sync_batch_max: usize,

    /// Pause between incremental syncs; also the longest a value may be
    /// held back behind an in-flight item. Default: 5s.
    #[serde(default = "default_syncer_frequency", with = "humantime_serde")]
    pub syncer_frequency: Duration,

    /// Longest a producer waits for space before rechecking. Default: 1s.
    #[serde(default = "default_backoff", with = "humantime_serde")]
    pub backoff: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// Synthetic producers for the `simulate` command.
#[derive(Debug, Clone, Deserialize)]
pub struct SimulateConfig {
    /// Distinct items written. Default: 1000.
    #[serde(default = "default_simulate_items")]
    pub items: u64,

    /// Producer threads. Default: 2.
    #[serde(default = "default_simulate_producers")]
    pub producers: usize,

    /// Pause between two passes over all items. Default: 1s.
    #[serde(default = "default_simulate_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Share of items producing log values, in percent. Default: 10.
    #[serde(default = "default_simulate_log_percent")]
    pub log_percent: u8,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_syncers() -> usize {
    4
}

fn default_history_cache_size() -> usize {
    8 * 1024 * 1024
}

fn default_text_cache_size() -> usize {
    16 * 1024 * 1024
}

fn default_trend_cache_size() -> usize {
    4 * 1024 * 1024
}

fn default_sync_batch_max() -> usize {
    1000
}

fn default_syncer_frequency() -> Duration {
    Duration::from_secs(5)
}

fn default_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

fn default_simulate_items() -> u64 {
    1000
}

fn default_simulate_producers() -> usize {
    2
}

fn default_simulate_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_simulate_log_percent() -> u8 {
    10
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            role: Role::default(),
            syncers: default_syncers(),
            cache: CacheConfig::default(),
            health: HealthConfig::default(),
            simulate: SimulateConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            history_cache_size: default_history_cache_size(),
            text_cache_size: default_text_cache_size(),
            trend_cache_size: default_trend_cache_size(),
            sync_batch_max: default_sync_batch_max(),
            syncer_frequency: default_syncer_frequency(),
            backoff: default_backoff(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

impl Default for SimulateConfig {
    fn default() -> Self {
        Self {
            items: default_simulate_items(),
            producers: default_simulate_producers(),
            interval: default_simulate_interval(),
            log_percent: default_simulate_log_percent(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.syncers == 0 {
            bail!("syncers must be positive");
        }

        self.cache.validate()?;

        if self.simulate.producers == 0 {
            bail!("simulate.producers must be positive");
        }
        if self.simulate.items == 0 {
            bail!("simulate.items must be positive");
        }
        if self.simulate.log_percent > 100 {
            bail!("simulate.log_percent must be at most 100");
        }

        Ok(())
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.history_cache_size == 0 {
            bail!("cache.history_cache_size must be positive");
        }
        if self.text_cache_size == 0 {
            bail!("cache.text_cache_size must be positive");
        }
        if self.text_cache_size > u32::MAX as usize {
            bail!("cache.text_cache_size must not exceed {} bytes", u32::MAX);
        }
        if self.sync_batch_max == 0 {
            bail!("cache.sync_batch_max must be positive");
        }
        if self.syncer_frequency.is_zero() {
            bail!("cache.syncer_frequency must be positive");
        }
        if self.backoff.is_zero() {
            bail!("cache.backoff must be positive");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.role, Role::Server);
        assert_eq!(cfg.syncers, 4);
        assert_eq!(cfg.cache.history_cache_size, 8 * 1024 * 1024);
        assert_eq!(cfg.cache.text_cache_size, 16 * 1024 * 1024);
        assert_eq!(cfg.cache.sync_batch_max, 1000);
        assert_eq!(cfg.cache.syncer_frequency, Duration::from_secs(5));
        assert_eq!(cfg.health.addr, ":9090");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let cfg: Config = serde_yaml::from_str(
            r#"
role: proxy
syncers: 2
cache:
  history_cache_size: 1048576
  sync_batch_max: 500
  syncer_frequency: 2s
  backoff: 250ms
"#,
        )
        .expect("valid yaml");

        assert_eq!(cfg.role, Role::Proxy);
        assert_eq!(cfg.syncers, 2);
        assert_eq!(cfg.cache.history_cache_size, 1024 * 1024);
        assert_eq!(cfg.cache.text_cache_size, 16 * 1024 * 1024);
        assert_eq!(cfg.cache.sync_batch_max, 500);
        assert_eq!(cfg.cache.syncer_frequency, Duration::from_secs(2));
        assert_eq!(cfg.cache.backoff, Duration::from_millis(250));
    }

    #[test]
    fn test_validation_zero_batch() {
        let mut cfg = Config::default();
        cfg.cache.sync_batch_max = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("sync_batch_max"));
    }

    #[test]
    fn test_validation_zero_syncers() {
        let cfg = Config {
            syncers: 0,
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("syncers"));
    }

    #[test]
    fn test_validation_log_percent() {
        let mut cfg = Config::default();
        cfg.simulate.log_percent = 101;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("log_percent"));
    }

    #[test]
    fn test_unknown_role_rejected() {
        let result: Result<Config, _> = serde_yaml::from_str("role: agent\n");
        assert!(result.is_err());
    }
}
