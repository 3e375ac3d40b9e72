use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tarry_broker::BrokerConfig;
use tarry_metrics::MetricsConfig;

const DEFAULT_HTTP_BIND: &str = "0.0.0.0:8000";
const DEFAULT_STATS_INTERVAL_MS: u64 = 60_000;
const DEFAULT_STATS_HISTORY: usize = 60;
const DEFAULT_STATS_LOG_SECS: u64 = 10;

/// Process configuration, read from `TARRY_*` environment variables with
/// optional YAML overrides.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub http_bind: SocketAddr,
    pub broker: BrokerConfig,
    pub stats: MetricsConfig,
    // number of samples kept for /stats
    pub stats_history: usize,
}

#[derive(Debug, Default, Deserialize)]
struct ServerConfigOverride {
    http_bind: Option<String>,
    reservation_timeout_ms: Option<u64>,
    max_backlog_per_client: Option<usize>,
    stats_interval_ms: Option<u64>,
    stats_history: Option<usize>,
    stats_log_secs: Option<u64>,
    stats_log: Option<bool>,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.parse::<T>().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        let http_bind = std::env::var("TARRY_HTTP_BIND")
            .unwrap_or_else(|_| DEFAULT_HTTP_BIND.to_string())
            .parse()
            .with_context(|| "parse TARRY_HTTP_BIND")?;

        let defaults = BrokerConfig::default();
        let reservation_timeout_ms = env_parse::<u64>("TARRY_RESERVATION_TIMEOUT_MS")
            .filter(|value| *value > 0)
            .unwrap_or(defaults.reservation_timeout_ms);
        // 0 is meaningful here: unbounded backlog
        let max_backlog_per_client =
            env_parse::<usize>("TARRY_MAX_BACKLOG").unwrap_or(defaults.max_backlog_per_client);

        let sample_interval_ms = env_parse::<u64>("TARRY_STATS_INTERVAL_MS")
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_STATS_INTERVAL_MS);
        let stats_history = env_parse::<usize>("TARRY_STATS_HISTORY")
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_STATS_HISTORY);
        let log_secs = env_parse::<u64>("TARRY_STATS_LOG_SECS")
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_STATS_LOG_SECS);
        let log_broker = env_flag("TARRY_STATS_LOG").unwrap_or(true);

        Ok(Self {
            http_bind,
            broker: BrokerConfig {
                reservation_timeout_ms,
                max_backlog_per_client,
            },
            stats: MetricsConfig {
                sample_interval: Duration::from_millis(sample_interval_ms),
                log_interval: Duration::from_secs(log_secs),
                log_broker,
            },
            stats_history,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("TARRY_CONFIG") {
            let contents =
                fs::read_to_string(&path).with_context(|| format!("read TARRY_CONFIG: {path}"))?;
            let override_cfg: ServerConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse tarry config yaml")?;
            config.apply(override_cfg)?;
        }
        Ok(config)
    }

    fn apply(&mut self, override_cfg: ServerConfigOverride) -> Result<()> {
        if let Some(value) = override_cfg.http_bind {
            self.http_bind = value.parse().with_context(|| "parse http_bind")?;
        }
        if let Some(value) = override_cfg.reservation_timeout_ms
            && value > 0
        {
            self.broker.reservation_timeout_ms = value;
        }
        if let Some(value) = override_cfg.max_backlog_per_client {
            self.broker.max_backlog_per_client = value;
        }
        if let Some(value) = override_cfg.stats_interval_ms
            && value > 0
        {
            self.stats.sample_interval = Duration::from_millis(value);
        }
        if let Some(value) = override_cfg.stats_history
            && value > 0
        {
            self.stats_history = value;
        }
        if let Some(value) = override_cfg.stats_log_secs
            && value > 0
        {
            self.stats.log_interval = Duration::from_secs(value);
        }
        if let Some(value) = override_cfg.stats_log {
            self.stats.log_broker = value;
        }
        Ok(())
    }
}
