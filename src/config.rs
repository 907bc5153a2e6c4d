use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the netflowd collector.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Traffic-inspection agent connection configuration.
    pub agent: AgentConfig,

    /// Reconnect policy for the agent socket.
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Usage aggregation configuration.
    #[serde(default)]
    pub aggregate: AggregateConfig,

    /// Device enrichment cache configuration.
    #[serde(default)]
    pub device_cache: DeviceCacheConfig,

    /// Retention horizon for all time-series stores, in days. Default: 7.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Agent socket endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Agent host or IP.
    pub host: String,

    /// Agent port. Default: 7150.
    #[serde(default = "default_agent_port")]
    pub port: u16,
}

/// Reconnect policy for the persistent agent connection.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    /// Delay between reconnect attempts. Default: 5s.
    #[serde(default = "default_reconnect_delay", with = "humantime_serde")]
    pub delay: Duration,

    /// Consecutive-failure ceiling before the extended cooldown.
    /// Default: 9999.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delay: default_reconnect_delay(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// Usage aggregation cadence and join window.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregateConfig {
    /// How often the aggregation cycle runs. Default: 60s.
    #[serde(default = "default_aggregate_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Trailing window joined per cycle. Flows purged later than this
    /// after arrival are never aggregated. Default: 60s.
    #[serde(default = "default_join_window", with = "humantime_serde")]
    pub join_window: Duration,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            interval: default_aggregate_interval(),
            join_window: default_join_window(),
        }
    }
}

/// Device cache refresh cadence.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCacheConfig {
    /// Full-replace refresh interval. Default: 5m.
    #[serde(default = "default_cache_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,
}

impl Default for DeviceCacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval: default_cache_refresh_interval(),
        }
    }
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address for /metrics and /healthz. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_agent_port() -> u16 {
    7150
}

fn default_reconnect_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_max_attempts() -> u32 {
    9999
}

fn default_aggregate_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_join_window() -> Duration {
    Duration::from_secs(60)
}

fn default_cache_refresh_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_retention_days() -> u32 {
    7
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

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
        if self.agent.host.is_empty() {
            bail!("agent.host is required");
        }

        if self.agent.port == 0 {
            bail!("agent.port must be > 0");
        }

        if self.retention_days == 0 {
            bail!("retention_days must be > 0");
        }

        if self.reconnect.delay.is_zero() {
            bail!("reconnect.delay must be > 0");
        }

        if self.reconnect.max_attempts == 0 {
            bail!("reconnect.max_attempts must be > 0");
        }

        if self.aggregate.interval.is_zero() {
            bail!("aggregate.interval must be > 0");
        }

        if self.aggregate.join_window.is_zero() {
            bail!("aggregate.join_window must be > 0");
        }

        if self.device_cache.refresh_interval.is_zero() {
            bail!("device_cache.refresh_interval must be > 0");
        }

        Ok(())
    }
}
