//! Typed error/reason taxonomy shared across relay crates.
//!
//! `RelayError` covers input/resource/integrity failures — the ones that
//! surface as typed results across component boundaries (MaildirStore,
//! SqliteIndex never throw `anyhow::Error` across their public API).
//! `RejectReason` covers the policy/capacity kinds that show up in a
//! publish result's `rejected[]` list.

use std::fmt;

/// Reasons a publish attempt can be rejected for a given target endpoint,
/// or for the whole message (budget/access violations).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    AccessDenied,
    RateLimited,
    HopLimit,
    TtlExpired,
    CycleDetected,
    BudgetExhausted,
    CircuitOpen,
    Backpressure,
}

impl RejectReason {
    /// The reason string recorded in dead-letter sidecars and publish
    /// results.
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::AccessDenied => "access_denied",
            RejectReason::RateLimited => "rate_limited",
            RejectReason::HopLimit => "hop_limit",
            RejectReason::TtlExpired => "ttl_expired",
            RejectReason::CycleDetected => "cycle_detected",
            RejectReason::BudgetExhausted => "budget_exhausted",
            RejectReason::CircuitOpen => "circuit_open",
            RejectReason::Backpressure => "backpressure",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed failure for MaildirStore/SqliteIndex/watcher operations. Never
/// wraps `anyhow::Error` — callers that want context attach it themselves
/// via `anyhow::Context` at the orchestration boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Requested message id is not present in the expected maildir subdir.
    NotFound,
    /// Malformed subject, envelope JSON, or missing required field.
    Malformed(String),
    /// JSON (de)serialization failure.
    Serialization(String),
    /// Filesystem I/O failure, with a short description (no raw `io::Error`
    /// so `RelayError` stays `Eq`-able for tests).
    Io(String),
    /// SQLite/database failure.
    Database(String),
    /// A dead letter's sidecar file is present but unreadable/corrupt (as
    /// opposed to simply missing, which is treated as "unknown" per spec).
    CorruptSidecar(String),
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::NotFound => write!(f, "not_found"),
            RelayError::Malformed(s) => write!(f, "malformed: {s}"),
            RelayError::Serialization(s) => write!(f, "serialization error: {s}"),
            RelayError::Io(s) => write!(f, "io error: {s}"),
            RelayError::Database(s) => write!(f, "database error: {s}"),
            RelayError::CorruptSidecar(s) => write!(f, "corrupt sidecar: {s}"),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<std::io::Error> for RelayError {
    fn from(e: std::io::Error) -> Self {
        RelayError::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_reason_strings_match_spec_tokens() {
        assert_eq!(RejectReason::AccessDenied.as_str(), "access_denied");
        assert_eq!(RejectReason::RateLimited.as_str(), "rate_limited");
        assert_eq!(RejectReason::HopLimit.as_str(), "hop_limit");
        assert_eq!(RejectReason::TtlExpired.as_str(), "ttl_expired");
        assert_eq!(RejectReason::CycleDetected.as_str(), "cycle_detected");
        assert_eq!(RejectReason::BudgetExhausted.as_str(), "budget_exhausted");
        assert_eq!(RejectReason::CircuitOpen.as_str(), "circuit_open");
        assert_eq!(RejectReason::Backpressure.as_str(), "backpressure");
    }

    #[test]
    fn not_found_display() {
        assert_eq!(RelayError::NotFound.to_string(), "not_found");
    }
}
