//! `.relay.toml` configuration loading: search the data directory (or an
//! explicit path), parse with `toml`, default everything that's absent.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use relay_breaker::CircuitBreakerConfig;
use relay_ratelimit::RateLimitConfig;

/// Per-endpoint mailbox-depth admission policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpressureConfig {
    #[serde(default = "default_max_mailbox_size")]
    pub max_mailbox_size: u64,
    #[serde(default = "default_pressure_warning_at")]
    pub pressure_warning_at: f64,
}

fn default_max_mailbox_size() -> u64 {
    10_000
}

fn default_pressure_warning_at() -> f64 {
    0.8
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            max_mailbox_size: default_max_mailbox_size(),
            pressure_warning_at: default_pressure_warning_at(),
        }
    }
}

/// Top-level configuration for one relay instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub data_dir: PathBuf,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub backpressure: BackpressureConfig,
    /// Whether the rate limiter's in-memory window should be rebuilt from
    /// the derived index at startup. Default `false`: the window starts
    /// empty and only reflects activity since process start, preferring
    /// explicit opt-in over implicit background work.
    #[serde(default)]
    pub rebuild_rate_limit_on_startup: bool,
}

impl RelayConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            rate_limit: RateLimitConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            backpressure: BackpressureConfig::default(),
            rebuild_rate_limit_on_startup: false,
        }
    }

    /// Look for `.relay.toml` under `root`; `Ok(None)` if absent.
    pub fn load_from_workspace(root: &Path) -> Result<Option<Self>> {
        let config_path = root.join(".relay.toml");
        if !config_path.exists() {
            return Ok(None);
        }
        Self::load_from_file(&config_path).map(Some)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: RelayConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(config)
    }
}
