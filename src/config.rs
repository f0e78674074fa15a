use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::aggregator::{AggregatorSettings, WatermarkCommit};
use crate::reconciler::ReconcilerSettings;
use crate::retry::RetryPolicy;
use crate::trajectories::{DEFAULT_RETENTION_SECS, DEFAULT_STALENESS_THRESHOLD_SECS};

pub const DEFAULT_OPENSKY_BASE_URL: &str = "https://opensky-network.org/api";

/// Tracker configuration, TOML file layer plus environment overrides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Required once environment overrides are applied
    pub database_url: Option<String>,
    pub pool_size: u32,
    /// Serve Prometheus metrics on this port when set
    pub metrics_port: Option<u16>,
    pub opensky: OpenSkySettings,
    pub retry: RetrySettings,
    pub schedule: ScheduleSettings,
    pub tracking: TrackingSettings,
    pub aggregation: AggregationSettings,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            pool_size: 10,
            metrics_port: None,
            opensky: OpenSkySettings::default(),
            retry: RetrySettings::default(),
            schedule: ScheduleSettings::default(),
            tracking: TrackingSettings::default(),
            aggregation: AggregationSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenSkySettings {
    pub base_url: String,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for OpenSkySettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_OPENSKY_BASE_URL.to_string(),
            username: None,
            password: None,
            request_timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleSettings {
    pub poll_interval_secs: u64,
    pub reconcile_interval_secs: u64,
    pub aggregate_interval_secs: u64,
    pub route_refresh_interval_secs: u64,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            reconcile_interval_secs: 20,
            aggregate_interval_secs: 3600,
            route_refresh_interval_secs: 86400,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingSettings {
    pub staleness_threshold_secs: i64,
    pub retention_secs: i64,
    pub route_cache_ttl_secs: u64,
    pub route_lookup_timeout_ms: u64,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            staleness_threshold_secs: DEFAULT_STALENESS_THRESHOLD_SECS,
            retention_secs: DEFAULT_RETENTION_SECS,
            route_cache_ttl_secs: 600,
            route_lookup_timeout_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationSettings {
    pub watermark_commit: WatermarkCommit,
    /// 0 keeps airport stats forever
    pub stats_retention_days: u32,
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            watermark_commit: WatermarkCommit::EndOfRun,
            stats_retention_days: 30,
        }
    }
}

impl TrackerConfig {
    /// Load a TOML file, or defaults when `path` is `None`, then apply
    /// environment overrides and validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        let config: TrackerConfig =
            toml::from_str(&contents).with_context(|| format!("Failed to parse {:?}", path))?;
        Ok(config)
    }

    /// Override file values with DATABASE_URL, OPENSKY_USERNAME,
    /// OPENSKY_PASSWORD, OPENSKY_BASE_URL and METRICS_PORT
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Some(username) = lookup("OPENSKY_USERNAME") {
            self.opensky.username = Some(username);
        }
        if let Some(password) = lookup("OPENSKY_PASSWORD") {
            self.opensky.password = Some(password);
        }
        if let Some(base_url) = lookup("OPENSKY_BASE_URL") {
            self.opensky.base_url = base_url;
        }
        if let Some(port) = lookup("METRICS_PORT").and_then(|p| p.parse().ok()) {
            self.metrics_port = Some(port);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            bail!("pool_size must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.opensky.request_timeout_secs == 0 {
            bail!("opensky.request_timeout_secs must be positive");
        }

        let intervals = [
            ("poll_interval_secs", self.schedule.poll_interval_secs),
            ("reconcile_interval_secs", self.schedule.reconcile_interval_secs),
            ("aggregate_interval_secs", self.schedule.aggregate_interval_secs),
            (
                "route_refresh_interval_secs",
                self.schedule.route_refresh_interval_secs,
            ),
        ];
        for (name, value) in intervals {
            if value == 0 {
                bail!("schedule.{} must be positive", name);
            }
        }

        if self.tracking.staleness_threshold_secs <= 0 {
            bail!("tracking.staleness_threshold_secs must be positive");
        }
        if self.tracking.retention_secs <= 0 {
            bail!("tracking.retention_secs must be positive");
        }
        if self.tracking.route_lookup_timeout_ms == 0 {
            bail!("tracking.route_lookup_timeout_ms must be positive");
        }

        Ok(())
    }

    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL must be set in the environment or the config file")
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
        }
    }

    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            staleness_threshold_secs: self.tracking.staleness_threshold_secs,
            retention_secs: self.tracking.retention_secs,
        }
    }

    pub fn aggregator_settings(&self) -> AggregatorSettings {
        AggregatorSettings {
            watermark_commit: self.aggregation.watermark_commit,
            stats_retention_days: self.aggregation.stats_retention_days,
        }
    }

    pub fn route_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.tracking.route_cache_ttl_secs)
    }

    pub fn route_lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.tracking.route_lookup_timeout_ms)
    }
}

/// Resolve the config file path.
///
/// Priority:
/// 1. `--config` flag
/// 2. `TRACKER_CONFIG` env var
/// 3. `./tracker.toml` if it exists
pub fn config_path(flag: Option<PathBuf>) -> Option<PathBuf> {
    if flag.is_some() {
        return flag;
    }

    if let Ok(path) = std::env::var("TRACKER_CONFIG") {
        return Some(PathBuf::from(path));
    }

    let local = PathBuf::from("./tracker.toml");
    local.exists().then_some(local)
}
