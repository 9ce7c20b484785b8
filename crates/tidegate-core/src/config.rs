//! tidegate.toml configuration parser.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::WorkerPool;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid duration for {key}: {value:?}")]
    InvalidDuration { key: &'static str, value: String },

    #[error("invalid worker pool: {0}")]
    InvalidPool(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TidegateConfig {
    pub consul: ConsulConfig,
    /// Default provider region for pools that don't set one.
    pub region: String,
    /// How often the control loop evaluates every pool.
    pub cluster_scaling_interval: String,
    pub termination: TerminationConfig,
    /// Skip a pool's cycle when its state could not be read.
    pub pause_on_stale_state: bool,
    pub log_level: String,
    #[serde(rename = "worker_pool")]
    pub worker_pools: Vec<WorkerPoolConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConsulConfig {
    /// `host:port` of the Consul HTTP API.
    pub address: String,
    /// ACL token sent as `X-Consul-Token`.
    pub token: Option<String>,
    /// Prefix every state key is written under.
    pub key_root: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TerminationConfig {
    pub poll_interval: String,
    pub timeout: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerPoolConfig {
    pub name: String,
    #[serde(default = "default_retry_threshold")]
    pub retry_threshold: u32,
    pub region: Option<String>,
    #[serde(default = "default_provider")]
    pub provider: String,
}

fn default_retry_threshold() -> u32 {
    3
}

fn default_provider() -> String {
    "aws".to_string()
}

impl Default for TidegateConfig {
    fn default() -> Self {
        Self {
            consul: ConsulConfig::default(),
            region: "us-east-1".to_string(),
            cluster_scaling_interval: "10s".to_string(),
            termination: TerminationConfig::default(),
            pause_on_stale_state: false,
            log_level: "info,tidegate=debug".to_string(),
            worker_pools: Vec::new(),
        }
    }
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8500".to_string(),
            token: None,
            key_root: "tidegate/config".to_string(),
        }
    }
}

impl Default for TerminationConfig {
    fn default() -> Self {
        Self {
            poll_interval: "10s".to_string(),
            timeout: "3m".to_string(),
        }
    }
}

impl TidegateConfig {
    /// Parse a single TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let value = read_toml(path)?;
        Self::from_value(value, path)
    }

    /// Load every `*.toml` file in `dir`, in lexical order, merging later
    /// files over earlier ones. An empty directory yields the defaults.
    pub fn load_dir(dir: &Path) -> Result<Self, ConfigError> {
        let entries = std::fs::read_dir(dir).map_err(|source| ConfigError::Io {
            path: dir.display().to_string(),
            source,
        })?;

        let mut files: Vec<_> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        files.sort();

        let mut merged = toml::Value::Table(toml::Table::new());
        for file in &files {
            merge_values(&mut merged, read_toml(file)?);
        }
        Self::from_value(merged, dir)
    }

    /// Load from a file or a directory, whichever `path` is.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if path.is_dir() {
            Self::load_dir(path)
        } else {
            Self::from_file(path)
        }
    }

    fn from_value(value: toml::Value, origin: &Path) -> Result<Self, ConfigError> {
        let config = value
            .try_into::<TidegateConfig>()
            .map_err(|source| ConfigError::Parse {
                path: origin.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Check durations parse and pool names are present and unique.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scaling_interval()?;
        self.poll_interval()?;
        self.termination_timeout()?;

        let mut seen = HashSet::new();
        for pool in &self.worker_pools {
            if pool.name.trim().is_empty() {
                return Err(ConfigError::InvalidPool("empty pool name".to_string()));
            }
            if !seen.insert(pool.name.as_str()) {
                return Err(ConfigError::InvalidPool(format!(
                    "duplicate pool name: {}",
                    pool.name
                )));
            }
        }
        Ok(())
    }

    pub fn scaling_interval(&self) -> Result<Duration, ConfigError> {
        duration_key("cluster_scaling_interval", &self.cluster_scaling_interval)
    }

    pub fn poll_interval(&self) -> Result<Duration, ConfigError> {
        duration_key("termination.poll_interval", &self.termination.poll_interval)
    }

    pub fn termination_timeout(&self) -> Result<Duration, ConfigError> {
        duration_key("termination.timeout", &self.termination.timeout)
    }

    /// Resolve pool entries into descriptors, filling in the default region.
    pub fn pools(&self) -> Vec<WorkerPool> {
        self.worker_pools
            .iter()
            .map(|p| WorkerPool {
                name: p.name.clone(),
                retry_threshold: p.retry_threshold,
                region: p.region.clone().unwrap_or_else(|| self.region.clone()),
                provider: p.provider.clone(),
            })
            .collect()
    }

    /// Look up a pool by name.
    pub fn pool(&self, name: &str) -> Option<WorkerPool> {
        self.pools().into_iter().find(|p| p.name == name)
    }
}

fn read_toml(path: &Path) -> Result<toml::Value, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

/// Recursively merge `overlay` into `base`. Tables merge key by key;
/// any other value is replaced.
fn merge_values(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn duration_key(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).ok_or_else(|| ConfigError::InvalidDuration {
        key,
        value: value.to_string(),
    })
}

/// Parse a duration string like "500ms", "10s", "3m", or plain seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
