use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use batch_fetch::FetchConfig;
use batch_runner::RunnerConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use war_finalizer::Policy;

pub(crate) const CONFIG_PATH_ENV: &str = "WAR_TRACKER_CONFIG_PATH";
pub(crate) const API_KEYS_ENV: &str = "WAR_TRACKER_API_KEYS";
pub(crate) const MAX_LOOKBACK_DAYS: i64 = 365;

#[derive(Debug, Error)]
pub(crate) enum ConfigError {
    #[error("read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct TrackerConfig {
    pub(crate) api: ApiConfig,
    pub(crate) fetch: FetchSection,
    pub(crate) war: WarConfig,
    pub(crate) clans: ClansConfig,
    pub(crate) bus: BusConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct ApiConfig {
    pub(crate) base_url: String,
    pub(crate) keys: Vec<String>,
    pub(crate) rate: u32,
    pub(crate) period_ms: u64,
    pub(crate) request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.clashofclans.com/v1".to_string(),
            keys: Vec::new(),
            rate: 1_200,
            period_ms: 1_000,
            request_timeout_secs: 1_800,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct FetchSection {
    pub(crate) group_size: usize,
    pub(crate) connection_limit: usize,
    pub(crate) group_pause_secs: u64,
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            group_size: 60_000,
            connection_limit: 500,
            group_pause_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct WarConfig {
    pub(crate) poll_interval_secs: u64,
    pub(crate) lookback_days: i64,
    pub(crate) open_war_log_every: u64,
    pub(crate) grace_secs: u64,
    pub(crate) max_attempts: u32,
    pub(crate) maintenance_backoff_secs: u64,
    pub(crate) max_maintenance_backoffs: u32,
    pub(crate) default_retry_secs: u64,
}

impl Default for WarConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            lookback_days: 28,
            open_war_log_every: 30,
            grace_secs: 1_200,
            max_attempts: 10,
            maintenance_backoff_secs: 900,
            max_maintenance_backoffs: 96,
            default_retry_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct ClansConfig {
    pub(crate) enabled: bool,
    pub(crate) interval_secs: u64,
    pub(crate) batch_size: usize,
    pub(crate) concurrency: usize,
    pub(crate) rate: u32,
}

impl Default for ClansConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            batch_size: 50_000,
            concurrency: 1_000,
            rate: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum SinkKind {
    Ring,
    Jsonl,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct BusConfig {
    pub(crate) enabled: bool,
    pub(crate) sink: SinkKind,
    pub(crate) spool_dir: PathBuf,
    pub(crate) ring_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sink: SinkKind::Jsonl,
            spool_dir: PathBuf::from("datasets/bus"),
            ring_capacity: 32_768,
        }
    }
}

impl TrackerConfig {
    pub(crate) fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            base_url: self.api.base_url.clone(),
            group_size: self.fetch.group_size,
            connection_limit: self.fetch.connection_limit,
            request_timeout: Duration::from_secs(self.api.request_timeout_secs),
            group_pause: Duration::from_secs(self.fetch.group_pause_secs),
        }
    }

    pub(crate) fn finalize_policy(&self) -> Policy {
        Policy {
            max_attempts: self.war.max_attempts,
            maintenance_backoff: Duration::from_secs(self.war.maintenance_backoff_secs),
            max_maintenance_backoffs: self.war.max_maintenance_backoffs,
            default_retry: Duration::from_secs(self.war.default_retry_secs),
        }
    }

    pub(crate) fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            interval: Duration::from_secs(self.clans.interval_secs),
            batch_size: self.clans.batch_size,
            concurrency: self.clans.concurrency,
        }
    }

    fn sanitize(mut self) -> Self {
        self.api.rate = self.api.rate.max(1);
        self.api.period_ms = self.api.period_ms.max(1);
        self.api.request_timeout_secs = self.api.request_timeout_secs.max(1);
        self.fetch.group_size = self.fetch.group_size.max(1);
        self.fetch.connection_limit = self.fetch.connection_limit.clamp(1, 10_000);
        self.war.poll_interval_secs = self.war.poll_interval_secs.max(1);
        self.war.lookback_days = self.war.lookback_days.clamp(1, MAX_LOOKBACK_DAYS);
        self.war.open_war_log_every = self.war.open_war_log_every.max(1);
        self.war.max_attempts = self.war.max_attempts.max(1);
        self.clans.interval_secs = self.clans.interval_secs.max(1);
        self.clans.batch_size = self.clans.batch_size.max(1);
        self.clans.concurrency = self.clans.concurrency.max(1);
        self.clans.rate = self.clans.rate.max(1);
        self.bus.ring_capacity = self.bus.ring_capacity.max(16);
        self
    }

    /// Replaces the configured keys with a comma separated list, if given.
    fn with_key_override(mut self, raw: Option<String>) -> Self {
        if let Some(raw) = raw.filter(|v| !v.trim().is_empty()) {
            self.api.keys = raw
                .split(',')
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect();
        }
        self
    }
}

pub(crate) fn tracker_config_path(explicit: Option<&Path>) -> PathBuf {
    explicit.map(Path::to_path_buf).unwrap_or_else(|| {
        std::env::var(CONFIG_PATH_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("configs/tracker.toml"))
    })
}

pub(crate) fn parse_tracker_config(raw: &str, path: &Path) -> Result<TrackerConfig, ConfigError> {
    toml::from_str::<TrackerConfig>(raw)
        .map(TrackerConfig::sanitize)
        .map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

/// Reads the tracker config. A missing file yields defaults; API keys from
/// the environment take precedence over the file.
pub(crate) fn load_tracker_config(explicit: Option<&Path>) -> Result<TrackerConfig, ConfigError> {
    let path = tracker_config_path(explicit);
    let cfg = match fs::read_to_string(&path) {
        Ok(raw) => parse_tracker_config(&raw, &path)?,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no tracker config file, using defaults");
            TrackerConfig::default()
        }
        Err(source) => return Err(ConfigError::Read { path, source }),
    };
    Ok(cfg.with_key_override(std::env::var(API_KEYS_ENV).ok()))
}
