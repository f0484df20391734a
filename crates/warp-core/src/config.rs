//! Client configuration parser (`warpd.toml`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::duration::parse_duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// How often the tracker looks at service check results.
    pub check_poll_interval: Option<String>,
    /// Upper bound for a single check execution.
    pub probe_timeout: Option<String>,
    /// Used when a group's update strategy has an unparseable value.
    pub default_min_healthy_time: Option<String>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_poll_interval: Some("500ms".to_string()),
            probe_timeout: Some("1m".to_string()),
            default_min_healthy_time: Some("10s".to_string()),
        }
    }
}

impl HealthConfig {
    pub fn check_poll_interval(&self) -> Duration {
        self.check_poll_interval
            .as_deref()
            .and_then(parse_duration)
            .filter(|d| !d.is_zero())
            .unwrap_or(Duration::from_millis(500))
    }

    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
            .as_deref()
            .and_then(parse_duration)
            .unwrap_or(Duration::from_secs(60))
    }

    pub fn default_min_healthy_time(&self) -> Duration {
        self.default_min_healthy_time
            .as_deref()
            .and_then(parse_duration)
            .unwrap_or(Duration::from_secs(10))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    pub data_dir: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/warpgrid"),
        }
    }
}

impl StateConfig {
    /// Location of the check results database.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("checks.redb")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    /// `tracing` filter directive, overridden by `RUST_LOG`.
    pub filter: Option<String>,
}

impl ClientConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
