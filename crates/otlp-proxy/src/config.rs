//! Configuration loading and validation.
//!
//! Configuration is read from a `config.toml` file found either next to the
//! binary or under `./config`. Every option except the collector target URL
//! has a documented default; unknown `forwarding_mode` values fall back to
//! `pool` with a warning rather than failing the boot.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::{fs, io};

use http::HeaderValue;
use serde::{Deserialize, Deserializer};
use tracing::{info, warn};

const CONFIG_SEARCH_PATHS: [&str; 2] = ["config.toml", "config/config.toml"];

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Errors raised while loading configuration. All of these are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no config file found (looked for {})", CONFIG_SEARCH_PATHS.join(", "))]
    NotFound,

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which forwarding backend to run. Selected once at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ForwardingMode {
    /// Fixed worker set plus a bounded queue; deterministic rejection (default).
    #[default]
    Pool,
    /// One spawned unit per submit, bounded only by in-flight tokens; never rejects.
    Semaphore,
    /// Bounded queue feeding dispatchers that spawn detached senders.
    Hybrid,
}

impl FromStr for ForwardingMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pool" => Ok(ForwardingMode::Pool),
            "semaphore" => Ok(ForwardingMode::Semaphore),
            "hybrid" => Ok(ForwardingMode::Hybrid),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ForwardingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardingMode::Pool => write!(f, "pool"),
            ForwardingMode::Semaphore => write!(f, "semaphore"),
            ForwardingMode::Hybrid => write!(f, "hybrid"),
        }
    }
}

impl<'de> Deserialize<'de> for ForwardingMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        match ForwardingMode::from_str(&value) {
            Ok(mode) => Ok(mode),
            Err(()) => {
                warn!("unknown forwarding_mode {value:?}, defaulting to \"pool\"");
                Ok(ForwardingMode::Pool)
            }
        }
    }
}

/// All recognized configuration options.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Upstream collector base URL, e.g. `http://localhost:4318`. Required.
    pub otel_collector_target_url: String,

    /// Verbatim `Authorization` value injected into forwarded requests.
    /// Empty disables injection entirely.
    #[serde(default)]
    pub otel_collector_api_key: String,

    #[serde(default = "default_server_port")]
    pub server_port: u16,

    /// CORS allowed origins. `"*"` mirrors the request origin back so
    /// credentialed browser requests stay valid.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,

    #[serde(default = "default_max_request_size_mb")]
    pub max_request_size_mb: usize,

    #[serde(default = "default_shutdown_drain_seconds")]
    pub shutdown_drain_seconds: u64,

    #[serde(default = "default_shutdown_timeout_seconds")]
    pub shutdown_timeout_seconds: u64,

    #[serde(default)]
    pub forwarding_mode: ForwardingMode,

    /// Worker count for the pool and hybrid modes. Values <= 0 auto-size
    /// to 50 x CPU count (the workload is I/O-bound).
    #[serde(default)]
    pub worker_pool_size: i64,

    #[serde(default = "default_job_queue_size")]
    pub job_queue_size: i64,

    /// In-flight HTTP concurrency ceiling for the semaphore and hybrid modes.
    #[serde(default = "default_semaphore_max_concurrent")]
    pub semaphore_max_concurrent: i64,

    /// When true, `/v1/logs` is proxied synchronously and the collector's
    /// response is relayed to the caller.
    #[serde(default)]
    pub sync_logs_debug: bool,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_server_port() -> u16 {
    8080
}

fn default_allowed_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_max_request_size_mb() -> usize {
    1
}

fn default_shutdown_drain_seconds() -> u64 {
    2
}

fn default_shutdown_timeout_seconds() -> u64 {
    10
}

fn default_job_queue_size() -> i64 {
    10_000
}

fn default_semaphore_max_concurrent() -> i64 {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            otel_collector_target_url: String::new(),
            otel_collector_api_key: String::new(),
            server_port: default_server_port(),
            allowed_origins: default_allowed_origins(),
            max_request_size_mb: default_max_request_size_mb(),
            shutdown_drain_seconds: default_shutdown_drain_seconds(),
            shutdown_timeout_seconds: default_shutdown_timeout_seconds(),
            forwarding_mode: ForwardingMode::default(),
            worker_pool_size: 0,
            job_queue_size: default_job_queue_size(),
            semaphore_max_concurrent: default_semaphore_max_concurrent(),
            sync_logs_debug: false,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Loads configuration from the first `config.toml` found on the search path.
    pub fn load() -> Result<Config, ConfigError> {
        for path in CONFIG_SEARCH_PATHS {
            if Path::new(path).is_file() {
                return Config::from_file(path);
            }
        }
        Err(ConfigError::NotFound)
    }

    /// Loads and validates configuration from a specific file.
    pub fn from_file(path: &str) -> Result<Config, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let config = Config::from_toml_str(&raw)?;
        info!("configuration loaded from {path}");
        Ok(config)
    }

    /// Parses and validates configuration from TOML text.
    pub fn from_toml_str(raw: &str) -> Result<Config, ConfigError> {
        let mut config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates required fields and normalizes out-of-range values.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.otel_collector_target_url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "otel_collector_target_url is required".to_string(),
            ));
        }

        if self.otel_collector_api_key.is_empty() {
            warn!("otel_collector_api_key is empty - forwarding will not include authentication");
        } else if HeaderValue::from_str(&self.otel_collector_api_key).is_err() {
            return Err(ConfigError::Invalid(
                "otel_collector_api_key is not a valid header value".to_string(),
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "invalid log level {:?}, must be one of: {}",
                self.log_level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }

        if self.semaphore_max_concurrent <= 0 {
            warn!(
                "semaphore_max_concurrent <= 0 ({}), defaulting to {}",
                self.semaphore_max_concurrent,
                default_semaphore_max_concurrent()
            );
            self.semaphore_max_concurrent = default_semaphore_max_concurrent();
        }

        Ok(())
    }

    /// Logs the effective configuration, one line per option. The API key value
    /// itself is never logged.
    pub fn log_summary(&self) {
        info!("  otel_collector_target_url: {}", self.otel_collector_target_url);
        info!(
            "  otel_collector_api_key: {}",
            if self.otel_collector_api_key.is_empty() {
                "(not set)"
            } else {
                "(set)"
            }
        );
        info!("  server_port: {}", self.server_port);
        info!("  allowed_origins: {:?}", self.allowed_origins);
        info!("  max_request_size_mb: {}", self.max_request_size_mb);
        info!("  shutdown_drain_seconds: {}", self.shutdown_drain_seconds);
        info!("  shutdown_timeout_seconds: {}", self.shutdown_timeout_seconds);
        info!("  forwarding_mode: {}", self.forwarding_mode);
        info!("  worker_pool_size: {} (<= 0 = auto)", self.worker_pool_size);
        info!("  job_queue_size: {}", self.job_queue_size);
        if self.forwarding_mode != ForwardingMode::Pool {
            info!("  semaphore_max_concurrent: {}", self.semaphore_max_concurrent);
        }
        info!("  sync_logs_debug: {}", self.sync_logs_debug);
        info!("  log_level: {}", self.log_level);
    }
}
