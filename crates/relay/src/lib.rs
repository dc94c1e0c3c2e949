//! # Relay
//!
//! A local message bus for multi-agent systems: durable Maildir-based
//! mailboxes, a derived SQLite index for query/replay, subject-pattern
//! subscriptions (NATS-style wildcards), access control, rate limiting,
//! circuit breakers, backpressure, a dead-letter queue, and pluggable
//! outbound adapters (webhook included).
//!
//! ## Pipeline
//!
//! [`core::RelayCore::publish`] is the single entry point: allocate a
//! message id, run it through [`access`], [`ratelimit`], and [`budget`],
//! expand to every endpoint whose registered subject matches under
//! [`subject`] rules, then write each through [`maildir`] and [`index`],
//! gated per endpoint by [`breaker`] and the backpressure check.
//!
//! ## Modules
//!
//! - [`types`] — wire types: `Envelope`, `Budget`, `Endpoint`, error/reason taxonomy
//! - [`subject`] — NATS-style subject pattern matching
//! - [`maildir`] — durable per-endpoint mailbox store
//! - [`index`] — derived, rebuildable SQLite index
//! - [`access`] — allow/deny rule evaluation
//! - [`budget`] — TTL/hop/call-budget/cycle enforcement
//! - [`ratelimit`] — sliding-window per-sender rate limiting
//! - [`breaker`] — per-endpoint circuit breaker
//! - [`webhook`] — HMAC-signed inbound/outbound webhook adapter support
//! - [`retry`] — configurable backoff for adapter authors (not used by the core pipeline)
//! - [`duration`] — humantime (de)serialization helpers shared by config types
//! - [`core`] — `RelayCore`: the publish pipeline and every registry it composes
//! - [`binding`] — `BindingRouter`, gated behind the `binding` feature
//!
//! For command-line usage, see the `relay-cli` crate.

pub use relay_access as access;
pub use relay_breaker as breaker;
pub use relay_budget as budget;
pub use relay_core as core;
pub use relay_duration as duration;
pub use relay_index as index;
pub use relay_maildir as maildir;
pub use relay_ratelimit as ratelimit;
pub use relay_retry as retry;
pub use relay_subject as subject;
pub use relay_types as types;
pub use relay_webhook as webhook;

#[cfg(feature = "binding")]
pub use relay_binding as binding;
