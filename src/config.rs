//! Layered configuration for rosie.
//!
//! Values are resolved from (lowest to highest priority): built-in defaults,
//! an optional TOML file, `ROSIE_*` environment variables, and CLI flags.
//! Nested keys in the environment use `__`, e.g. `ROSIE_QUEUE__PATH`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "rosie.toml";
pub const DEFAULT_QUEUE_NAME: &str = "rosiepi";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Stable node identity. Falls back to the host name when unset.
    pub node_name: Option<String>,
    pub http_bind: SocketAddr,
    /// Boards attached to this node, tested in order for every job.
    pub boards: Vec<String>,
    pub commit_url_base: String,
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
    pub queue: QueueConfig,
    pub controller: ControllerConfig,
    pub delivery: DeliveryConfig,
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// SQLite database file shared by every process on the queue.
    pub path: PathBuf,
    pub name: String,
    pub busy_timeout_ms: u64,
    /// Terminal jobs older than this are purged. `None` keeps them forever.
    pub result_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub poll_interval_ms: u64,
    pub reconnect_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_name: None,
            http_bind: SocketAddr::from(([0, 0, 0, 0], 5000)),
            boards: vec![
                "metro_m4_express".to_string(),
                "feather_nrf52840".to_string(),
            ],
            commit_url_base: "https://github.com/adafruit/circuitpython/commit/".to_string(),
            simulation: false,
            verbose: false,
            json_logs: false,
            queue: QueueConfig::default(),
            controller: ControllerConfig::default(),
            delivery: DeliveryConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("rosie_queue.db"),
            name: DEFAULT_QUEUE_NAME.to_string(),
            busy_timeout_ms: 5000,
            result_ttl_secs: None,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            reconnect_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

impl AppConfig {
    /// Load the configuration, applying `overrides` (typically CLI flags) last.
    ///
    /// `overrides` should skip `None` fields when serialized so that unset
    /// flags do not clobber lower layers.
    pub fn new<T: Serialize>(config_file: Option<&Path>, overrides: Option<&T>) -> Result<Self> {
        let mut figment = Self::figment(config_file);
        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let mut config: AppConfig = figment
            .extract()
            .context("Failed to load configuration")?;

        if config.node_name.as_deref().is_none_or(str::is_empty) {
            config.node_name = Some(hostname());
        }

        Ok(config)
    }

    /// Defaults, TOML file, and environment, without CLI overrides.
    pub fn figment(config_file: Option<&Path>) -> Figment {
        let file = config_file
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed("ROSIE_").split("__"))
    }

    pub fn node_name(&self) -> &str {
        self.node_name.as_deref().unwrap_or("unknown")
    }

    pub fn webhook_url(&self) -> Option<&str> {
        self.delivery
            .webhook_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
    }
}

impl QueueConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn result_ttl(&self) -> Option<Duration> {
        self.result_ttl_secs.map(Duration::from_secs)
    }
}

impl AgentConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

fn hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => {
            let name = name.to_string_lossy().trim().to_string();
            if name.is_empty() {
                "unknown".to_string()
            } else {
                name
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Could not read host name, using \"unknown\"");
            "unknown".to_string()
        }
    }
}
