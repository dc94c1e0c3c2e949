//! Per-endpoint CLOSED/OPEN/HALF_OPEN circuit breaker.
//!
//! One state machine per endpoint hash; `CircuitBreakerRegistry` owns the
//! map and hands out a lock per endpoint rather than one lock for the whole
//! table, so a trip on one endpoint never blocks a check on another.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use relay_types::RejectReason;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: i64,
    #[serde(default = "default_success_to_close")]
    pub success_to_close: u32,
    #[serde(default = "default_half_open_probe_count")]
    pub half_open_probe_count: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_ms() -> i64 {
    30_000
}

fn default_success_to_close() -> u32 {
    1
}

fn default_half_open_probe_count() -> u32 {
    1
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
            success_to_close: default_success_to_close(),
            half_open_probe_count: default_half_open_probe_count(),
        }
    }
}

/// Single endpoint's breaker state.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: i64,
    half_open_successes: u32,
    half_open_in_flight: u32,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: 0,
            half_open_successes: 0,
            half_open_in_flight: 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Admission check. Transitions OPEN -> HALF_OPEN when the cooldown has
    /// elapsed; strictly caps concurrent half-open probes.
    pub fn check(&mut self, now_ms: i64) -> Result<(), RejectReason> {
        match self.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                if now_ms - self.opened_at >= self.config.cooldown_ms {
                    self.state = CircuitState::HalfOpen;
                    self.half_open_successes = 0;
                    self.half_open_in_flight = 1;
                    Ok(())
                } else {
                    Err(RejectReason::CircuitOpen)
                }
            }
            CircuitState::HalfOpen => {
                if self.half_open_in_flight < self.config.half_open_probe_count {
                    self.half_open_in_flight += 1;
                    Ok(())
                } else {
                    Err(RejectReason::CircuitOpen)
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                self.half_open_in_flight = self.half_open_in_flight.saturating_sub(1);
                self.half_open_successes += 1;
                if self.half_open_successes >= self.config.success_to_close {
                    self.state = CircuitState::Closed;
                    self.consecutive_failures = 0;
                    self.half_open_successes = 0;
                    self.half_open_in_flight = 0;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&mut self, now_ms: i64) {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.state = CircuitState::Open;
                    self.opened_at = now_ms;
                }
            }
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.opened_at = now_ms;
                self.half_open_successes = 0;
                self.half_open_in_flight = 0;
            }
            CircuitState::Open => {
                self.opened_at = now_ms;
            }
        }
    }
}

/// Owns one `CircuitBreaker` per endpoint hash.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Mutex<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    fn with_breaker<T>(&self, endpoint_hash: &str, f: impl FnOnce(&mut CircuitBreaker) -> T) -> T {
        {
            let breakers = self.breakers.read().expect("breaker registry lock poisoned");
            if let Some(breaker) = breakers.get(endpoint_hash) {
                return f(&mut breaker.lock().expect("breaker mutex poisoned"));
            }
        }
        let mut breakers = self.breakers.write().expect("breaker registry lock poisoned");
        let breaker = breakers
            .entry(endpoint_hash.to_string())
            .or_insert_with(|| Mutex::new(CircuitBreaker::new(self.config.clone())));
        f(&mut breaker.lock().expect("breaker mutex poisoned"))
    }

    pub fn check(&self, endpoint_hash: &str, now_ms: i64) -> Result<(), RejectReason> {
        self.with_breaker(endpoint_hash, |b| b.check(now_ms))
    }

    pub fn record_success(&self, endpoint_hash: &str) {
        self.with_breaker(endpoint_hash, |b| b.record_success());
    }

    pub fn record_failure(&self, endpoint_hash: &str, now_ms: i64) {
        self.with_breaker(endpoint_hash, |b| b.record_failure(now_ms));
    }

    pub fn state_of(&self, endpoint_hash: &str) -> CircuitState {
        self.with_breaker(endpoint_hash, |b| b.state())
    }
}
