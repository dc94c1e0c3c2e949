//! Domain types for the relay message bus.
//!
//! This crate holds the immutable wire types (`Envelope`, `Budget`), the
//! registration records (`Endpoint`, `AccessRule`, `Subscription`), the
//! derived index row shape, dead-letter records, the adapter binding model,
//! and the error/reason taxonomy shared by every other relay crate.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub mod error;
pub mod subject_syntax;

pub use error::{RejectReason, RelayError};

/// Monotonic message identifier. A thin wrapper so call sites don't leak
/// `ulid::Ulid` as part of the public API shape.
pub type MessageId = ulid::Ulid;

/// Per-message counters that bound fan-out: hop count, TTL, ancestor chain,
/// and remaining call budget. Mutated only at publish/republish hops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    /// Number of times this logical message has been republished.
    #[serde(default)]
    pub hop_count: u32,
    /// Hard ceiling on `hop_count`; republish at or past this fails `hop_limit`.
    #[serde(default = "default_max_hops")]
    pub max_hops: u32,
    /// Prior `from` values on this logical message, oldest first.
    #[serde(default)]
    pub ancestor_chain: Vec<String>,
    /// Absolute expiry, Unix milliseconds. Never extended on republish.
    pub ttl: i64,
    /// Remaining republish budget; decremented on each hop.
    #[serde(default = "default_call_budget")]
    pub call_budget_remaining: i64,
}

fn default_max_hops() -> u32 {
    5
}

fn default_call_budget() -> i64 {
    10
}

impl Budget {
    /// A fresh budget with the given TTL (Unix ms) and default hop/call
    /// budget limits for everything else.
    pub fn new(ttl: i64) -> Self {
        Self {
            hop_count: 0,
            max_hops: default_max_hops(),
            ancestor_chain: Vec::new(),
            ttl,
            call_budget_remaining: default_call_budget(),
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.ttl
    }
}

/// Immutable message record. Constructed only by `RelayCore` during publish;
/// every other component treats it as read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: MessageId,
    pub subject: String,
    pub from: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub created_at: DateTime<Utc>,
    pub budget: Budget,
    pub payload: serde_json::Value,
    /// Fields present in the JSON we didn't define — preserved verbatim on
    /// re-serialization so forward-compatible producers round-trip cleanly.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Envelope {
    /// Serialize to canonical JSON bytes (stable key order, via serde's
    /// struct field order which `serde_json` preserves for non-map types).
    pub fn to_canonical_json(&self) -> Result<Vec<u8>, RelayError> {
        serde_json::to_vec(self).map_err(|e| RelayError::Serialization(e.to_string()))
    }

    pub fn from_canonical_json(bytes: &[u8]) -> Result<Self, RelayError> {
        serde_json::from_slice(bytes).map_err(|e| RelayError::Serialization(e.to_string()))
    }

    /// Apply the republish transition: bump hop count, append the
    /// previous `from` to the ancestor chain, decrement the call budget,
    /// and adopt the new `from`/subject. TTL is inherited unchanged.
    pub fn republish(&self, new_subject: impl Into<String>, new_from: impl Into<String>) -> Self {
        let previous_from = self.from.clone();
        let mut budget = self.budget.clone();
        budget.hop_count += 1;
        budget.ancestor_chain.push(previous_from);
        budget.call_budget_remaining -= 1;

        Self {
            id: MessageId::new(),
            subject: new_subject.into(),
            from: new_from.into(),
            reply_to: self.reply_to.clone(),
            created_at: Utc::now(),
            budget,
            payload: self.payload.clone(),
            extra: self.extra.clone(),
        }
    }
}

/// A registered subject that owns a durable mailbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub subject: String,
    pub hash: String,
    pub maildir_path: PathBuf,
    pub registered_at: DateTime<Utc>,
}

impl Endpoint {
    pub fn new(subject: impl Into<String>, data_dir: &std::path::Path) -> Self {
        let subject = subject.into();
        let hash = endpoint_hash(&subject);
        let maildir_path = data_dir.join(&hash);
        Self {
            subject,
            hash,
            maildir_path,
            registered_at: Utc::now(),
        }
    }
}

/// Deterministic, collision-resistant, filesystem-safe directory name for a
/// subject: the first 16 bytes (32 hex chars) of SHA-256(subject).
pub fn endpoint_hash(subject: &str) -> String {
    let digest = Sha256::digest(subject.as_bytes());
    hex_encode(&digest[..16])
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(out, "{:02x}", b).expect("writing to String never fails");
    }
    out
}

/// Allow/deny evaluation outcome for (from, to) pattern pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessAction {
    Allow,
    Deny,
}

/// A single access-control rule. Rules are deduplicated by `(from, to)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRule {
    pub from: String,
    pub to: String,
    pub action: AccessAction,
    pub priority: i32,
}

/// Derived, rebuildable index row over a Maildir entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedMessageRow {
    pub id: MessageId,
    pub subject: String,
    pub endpoint_hash: String,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Carries the envelope's `from`, used by the rate limiter when it is
    /// asked to count sender activity via the index rather than in memory.
    #[serde(default)]
    pub sender: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Delivered,
    Failed,
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Sidecar reason file written alongside a dead-lettered envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterReason {
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// An envelope that could not be delivered, paired with its reason (or
/// `None` when the sidecar is missing — readers report "unknown").
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub envelope: Envelope,
    pub reason: Option<DeadLetterReason>,
}

impl DeadLetter {
    pub fn reason_text(&self) -> &str {
        self.reason
            .as_ref()
            .map(|r| r.reason.as_str())
            .unwrap_or("unknown")
    }
}

/// Strategy used by the `BindingRouter` to derive an agent session key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStrategy {
    /// `{bindingId}:chat:{chatId|default}`.
    PerChat,
    /// `{bindingId}:user:{userId|chatId}`. Falls back to `chatId` when no
    /// user id is present in the inbound envelope's metadata — this is
    /// intentional graceful degradation, not a stopgap.
    PerUser,
    /// Fresh session on every inbound message; never cached.
    Stateless,
}

/// An (adapterId, optional chatId, optional channelType) -> agent directory
/// mapping. Persisted as a single JSON file by `relay-binding`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterBinding {
    pub id: uuid::Uuid,
    pub adapter_id: String,
    pub agent_id: String,
    pub agent_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_type: Option<String>,
    pub session_strategy: SessionStrategy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_hash_is_deterministic() {
        assert_eq!(
            endpoint_hash("relay.agent.alice"),
            endpoint_hash("relay.agent.alice")
        );
    }

    #[test]
    fn endpoint_hash_differs_for_different_subjects() {
        assert_ne!(
            endpoint_hash("relay.agent.alice"),
            endpoint_hash("relay.agent.bob")
        );
    }

    #[test]
    fn endpoint_hash_is_32_hex_chars() {
        let h = endpoint_hash("relay.agent.alice");
        assert_eq!(h.len(), 32);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn budget_new_has_default_limits() {
        let b = Budget::new(12345);
        assert_eq!(b.hop_count, 0);
        assert_eq!(b.max_hops, 5);
        assert!(b.ancestor_chain.is_empty());
        assert_eq!(b.call_budget_remaining, 10);
    }

    #[test]
    fn budget_expiry_boundary() {
        let b = Budget::new(1_000);
        assert!(!b.is_expired(999));
        assert!(b.is_expired(1_000));
        assert!(b.is_expired(1_001));
    }

    #[test]
    fn envelope_round_trips_unknown_fields() {
        let env = Envelope {
            id: MessageId::new(),
            subject: "relay.agent.alice".to_string(),
            from: "sys".to_string(),
            reply_to: None,
            created_at: Utc::now(),
            budget: Budget::new(9_999_999_999_999),
            payload: serde_json::json!({"msg": "hi"}),
            extra: BTreeMap::from([("future_field".to_string(), serde_json::json!("preserved"))]),
        };
        let bytes = env.to_canonical_json().unwrap();
        let back = Envelope::from_canonical_json(&bytes).unwrap();
        assert_eq!(back.extra.get("future_field").unwrap(), "preserved");
        assert_eq!(back.subject, "relay.agent.alice");
        assert_eq!(back.payload, env.payload);
    }

    #[test]
    fn republish_transition() {
        let env = Envelope {
            id: MessageId::new(),
            subject: "relay.agent.alice".to_string(),
            from: "sys".to_string(),
            reply_to: None,
            created_at: Utc::now(),
            budget: Budget::new(9_999_999_999_999),
            payload: serde_json::json!({}),
            extra: BTreeMap::new(),
        };
        let next = env.republish("relay.agent.bob", "relay.agent.alice");
        assert_eq!(next.budget.hop_count, 1);
        assert_eq!(next.budget.ancestor_chain, vec!["sys".to_string()]);
        assert_eq!(next.budget.call_budget_remaining, 9);
        assert_eq!(next.budget.ttl, env.budget.ttl);
        assert_ne!(next.id, env.id);
    }

    #[test]
    fn access_rule_equality_is_used_for_dedup_keys() {
        let r1 = AccessRule {
            from: "a".into(),
            to: "b".into(),
            action: AccessAction::Allow,
            priority: 1,
        };
        let r2 = AccessRule {
            from: "a".into(),
            to: "b".into(),
            action: AccessAction::Deny,
            priority: 99,
        };
        // same (from, to) key, different rule body — callers key a map on
        // (from, to), so these two "collide" by design.
        assert_eq!((r1.from, r1.to), (r2.from, r2.to));
    }

    #[test]
    fn dead_letter_reason_falls_back_to_unknown() {
        let env = Envelope {
            id: MessageId::new(),
            subject: "relay.agent.alice".to_string(),
            from: "sys".to_string(),
            reply_to: None,
            created_at: Utc::now(),
            budget: Budget::new(9_999_999_999_999),
            payload: serde_json::json!({}),
            extra: BTreeMap::new(),
        };
        let dl = DeadLetter {
            envelope: env,
            reason: None,
        };
        assert_eq!(dl.reason_text(), "unknown");
    }

    proptest::proptest! {
        #[test]
        fn envelope_payload_and_extra_survive_json_round_trip(
            msg in "[a-zA-Z0-9 ]{0,40}",
            count in 0i64..1_000_000,
            extra_key in "[a-z]{1,10}",
            extra_val in "[a-zA-Z0-9]{0,20}",
        ) {
            let env = Envelope {
                id: MessageId::new(),
                subject: "relay.agent.alice".to_string(),
                from: "sys".to_string(),
                reply_to: None,
                created_at: Utc::now(),
                budget: Budget::new(9_999_999_999_999),
                payload: serde_json::json!({"msg": msg, "count": count}),
                extra: BTreeMap::from([(extra_key.clone(), serde_json::json!(extra_val))]),
            };
            let bytes = env.to_canonical_json().unwrap();
            let back = Envelope::from_canonical_json(&bytes).unwrap();
            prop_assert_eq!(back.payload, env.payload);
            prop_assert_eq!(back.extra.get(&extra_key).unwrap(), &serde_json::json!(extra_val));
        }
    }
}
