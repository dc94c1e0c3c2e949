//! Sliding-window per-sender rate limiting.
//!
//! The window log is kept purely in memory: each sender's recent send
//! timestamps, pruned lazily on every check. Whether to rebuild this log
//! from the derived index on startup is an embedder decision, not
//! something this crate does automatically — `relay-core` documents the
//! chosen default.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Configuration for a `RateLimiter`. `overrides` maps a sender identifier
/// to a higher `max_per_window` than the default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_per_window")]
    pub max_per_window: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default)]
    pub overrides: HashMap<String, u32>,
}

fn default_enabled() -> bool {
    true
}

fn default_max_per_window() -> u32 {
    60
}

fn default_window_secs() -> u64 {
    60
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_per_window: default_max_per_window(),
            window_secs: default_window_secs(),
            overrides: HashMap::new(),
        }
    }
}

/// Sliding-window log per sender, guarded by a single mutex — the critical
/// section is small and short-held.
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<String, Vec<i64>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn limit_for(&self, sender: &str) -> u32 {
        self.config
            .overrides
            .get(sender)
            .copied()
            .unwrap_or(self.config.max_per_window)
    }

    /// Returns whether `sender` may send at `now_ms`. If allowed, the send
    /// is recorded; if rejected, the window is left unchanged — a rejected
    /// message is consulted against the counter but never increments it.
    pub fn check(&self, sender: &str, now_ms: i64) -> bool {
        if !self.config.enabled {
            return true;
        }

        let cutoff = now_ms - (self.config.window_secs as i64 * 1000);
        let limit = self.limit_for(sender);

        let mut windows = self.windows.lock().expect("rate limiter mutex poisoned");
        let entry = windows.entry(sender.to_string()).or_default();
        entry.retain(|&ts| ts > cutoff);

        if entry.len() >= limit as usize {
            return false;
        }

        entry.push(now_ms);
        true
    }

    /// Pre-seed a sender's window, e.g. when rebuilding from the index on
    /// startup. Does not enforce the limit; callers own that decision.
    pub fn seed(&self, sender: &str, timestamps_ms: impl IntoIterator<Item = i64>) {
        let mut windows = self.windows.lock().expect("rate limiter mutex poisoned");
        windows
            .entry(sender.to_string())
            .or_default()
            .extend(timestamps_ms);
    }
}
