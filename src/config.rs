//! Configuration management for ratelim.

use std::path::Path;

use config::{Config, Environment, File, Map};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{RatelimError, Result};
use crate::ratelimit::LimiterDefaults;

/// Prefix of environment variables that override file settings.
const ENV_PREFIX: &str = "RATELIM";

/// Main configuration for ratelim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatelimConfig {
    /// Parameters for limiters created for new keys
    #[serde(default)]
    pub limiter: LimiterDefaults,

    /// Default HTTP transport configuration
    #[serde(default)]
    pub transport: TransportConfig,
}

/// Settings for the default HTTP transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// TCP connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// TCP keepalive interval in seconds
    #[serde(default = "default_tcp_keepalive")]
    pub tcp_keepalive_secs: u64,

    /// How long idle pooled connections are kept, in seconds
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Idle connections kept per host
    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle_per_host: usize,

    /// Overall timeout applied by the client to every request
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            tcp_keepalive_secs: default_tcp_keepalive(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            pool_max_idle_per_host: default_pool_max_idle(),
            request_timeout_secs: None,
        }
    }
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_tcp_keepalive() -> u64 {
    30
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_pool_max_idle() -> usize {
    100
}

impl RatelimConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| RatelimError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from an optional file, overridden by `RATELIM_*`
    /// environment variables.
    ///
    /// Nested keys are separated by `__`, e.g. `RATELIM_LIMITER__RATE=10`.
    /// The file format follows its extension.
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Like [`load`](Self::load), but reads overrides from `env` instead of
    /// the process environment when it is given.
    fn load_with_env<P: AsRef<Path>>(
        path: Option<P>,
        env: Option<Map<String, String>>,
    ) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            let path = path.as_ref();
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(File::from(path));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
