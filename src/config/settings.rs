//! Bridge configuration settings

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file looked up in the working directory
pub const DEFAULT_CONFIG_PATH: &str = "config.yml";

/// Main configuration for the bridge process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Log level configuration
    pub log_level: String,

    /// Store transport configuration
    pub store: StoreConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Runtime configuration
    pub runtime: RuntimeConfig,
}

/// Which transport backs pooled connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Redis server over TCP
    Redis,
    /// In-process broker, for tests and dry runs
    Memory,
}

impl std::str::FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "redis" => Ok(StoreBackend::Redis),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(anyhow::anyhow!(
                "Invalid store backend '{}'. Must be 'redis' or 'memory'",
                other
            )),
        }
    }
}

/// Store transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,

    /// Delay between reconnect attempts of a dropped link, in milliseconds
    pub reconnect_delay_ms: u64,

    /// Timeout of a single connect attempt, in seconds
    pub connect_timeout_secs: u64,

    /// Interval between PINGs on an idle command connection, in milliseconds
    pub health_check_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for daily rolling log files; console only when unset
    pub file_dir: Option<PathBuf>,
}

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Runtime mode: "single_threaded" or "multi_threaded"
    pub mode: String,

    /// Number of worker threads for multi-threaded mode (0 = auto-detect CPU cores)
    pub worker_threads: Option<usize>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            store: StoreConfig::default(),
            logging: LoggingConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Redis,
            reconnect_delay_ms: 2000,
            connect_timeout_secs: 5,
            health_check_ms: 1000,
        }
    }
}

impl StoreConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_ms.max(1))
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mode: "single_threaded".to_string(), // Node callbacks never need more than one thread
            worker_threads: None,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: BridgeConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load configuration from the given file (or `config.yml` when present),
    /// then apply environment variable overrides.
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_yaml_file(DEFAULT_CONFIG_PATH)?
            }
            None => Self::default(),
        };

        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Environment variables take precedence over the file
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(level) = std::env::var("BRIDGE_LOG_LEVEL") {
            self.log_level = level;
        }

        if let Ok(backend) = std::env::var("BRIDGE_STORE_BACKEND") {
            self.store.backend = backend
                .parse()
                .context("Invalid BRIDGE_STORE_BACKEND")?;
        }

        if let Ok(delay) = std::env::var("BRIDGE_RECONNECT_DELAY_MS") {
            if let Ok(delay) = delay.parse() {
                self.store.reconnect_delay_ms = delay;
            }
        }

        if let Ok(timeout) = std::env::var("BRIDGE_CONNECT_TIMEOUT_SECS") {
            if let Ok(timeout) = timeout.parse() {
                self.store.connect_timeout_secs = timeout;
            }
        }

        if let Ok(interval) = std::env::var("BRIDGE_HEALTH_CHECK_MS") {
            if let Ok(interval) = interval.parse() {
                self.store.health_check_ms = interval;
            }
        }

        if let Ok(mode) = std::env::var("BRIDGE_RUNTIME_MODE") {
            self.runtime.mode = mode;
        }

        if let Ok(dir) = std::env::var("BRIDGE_LOG_DIR") {
            self.logging.file_dir = Some(PathBuf::from(dir));
        }

        Ok(())
    }
}
