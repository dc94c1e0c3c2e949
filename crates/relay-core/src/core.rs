//! Publish pipeline orchestration: the single entry point every adapter,
//! CLI, and embedder calls through. Owns the registries and composes them
//! (access, rate limit, budget, subject expansion, per-endpoint breaker and
//! backpressure) without reimplementing any of their policy itself.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use relay_access::AccessController;
use relay_breaker::CircuitBreakerRegistry;
use relay_budget::advance as advance_budget;
use relay_index::SqliteIndex;
use relay_maildir::MaildirStore;
use relay_ratelimit::RateLimiter;
use relay_types::{AccessRule, Budget, Endpoint, Envelope, IndexedMessageRow, MessageId, MessageStatus, RejectReason, RelayError};

use crate::adapter::{AdapterContext, AdapterHost, AdapterRegistry};
use crate::config::RelayConfig;
use crate::dlq::DeadLetterQueue;
use crate::reporter::Reporter;
use crate::subscription::{Handler, SubscriptionRegistry, Unsubscribe};
use crate::watcher::WatcherManager;

/// Outcome of a single publish call.
#[derive(Debug, Clone)]
pub struct PublishResult {
    pub message_id: MessageId,
    pub delivered_to: Vec<String>,
    pub rejected: Vec<(String, RejectReason)>,
    /// `(ratio, warn)` of the most pressured endpoint the message was
    /// written to, if any.
    pub mailbox_pressure: Option<(f64, bool)>,
}

/// Caller-supplied overrides for [`RelayCore::publish_with`], matching the
/// `{from, replyTo?, budget?}` shape of the public `publish` contract.
#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub reply_to: Option<String>,
    pub budget: Option<Budget>,
    /// TTL used to build a fresh `Budget` when `budget` is `None`.
    pub ttl_ms: i64,
}

impl PublishOptions {
    pub fn new(ttl_ms: i64) -> Self {
        Self {
            reply_to: None,
            budget: None,
            ttl_ms,
        }
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_budget(mut self, budget: Budget) -> Self {
        self.budget = Some(budget);
        self
    }
}

/// The live message bus: Maildir, index, and every policy registry wired
/// together. Construct via [`RelayCore::open`]; `Arc`-wrap to share across
/// the watcher and adapter threads it owns.
pub struct RelayCore {
    data_dir: PathBuf,
    maildir: Arc<MaildirStore>,
    index: Arc<SqliteIndex>,
    access: AccessController,
    rate_limiter: RateLimiter,
    breakers: Arc<CircuitBreakerRegistry>,
    subscriptions: Arc<SubscriptionRegistry>,
    adapters: AdapterRegistry,
    config: RelayConfig,
    endpoints: RwLock<HashMap<String, Endpoint>>,
    watcher: Arc<WatcherManager>,
    reporter: Arc<Mutex<dyn Reporter + Send>>,
}

impl RelayCore {
    /// Opens (creating if absent) the SQLite index at `{data_dir}/index.db`
    /// and wires every registry from `config`. Does not start the watcher;
    /// call [`RelayCore::start`] once all endpoints from a prior run have
    /// been re-registered.
    pub fn open(config: RelayConfig, reporter: Arc<Mutex<dyn Reporter + Send>>) -> anyhow::Result<Arc<Self>> {
        std::fs::create_dir_all(&config.data_dir)?;
        let maildir = Arc::new(MaildirStore::new(config.data_dir.clone()));
        let index = Arc::new(SqliteIndex::open(config.data_dir.join("index.db"))?);
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
        let subscriptions = SubscriptionRegistry::new();
        let watcher = Arc::new(WatcherManager::new(
            config.data_dir.clone(),
            Arc::clone(&maildir),
            Arc::clone(&index),
            Arc::clone(&subscriptions),
            Arc::clone(&breakers),
        ));

        if config.rebuild_rate_limit_on_startup {
            reporter
                .lock()
                .expect("reporter lock poisoned")
                .info("rebuild_rate_limit_on_startup is set but the in-memory window has no prior state to seed from a fresh process; starting empty");
        }

        Ok(Arc::new(Self {
            data_dir: config.data_dir.clone(),
            maildir,
            index,
            access: AccessController::new(),
            rate_limiter: RateLimiter::new(config.rate_limit.clone()),
            breakers,
            subscriptions,
            adapters: AdapterRegistry::new(),
            config,
            endpoints: RwLock::new(HashMap::new()),
            watcher,
            reporter,
        }))
    }

    /// Starts the filesystem watcher (and its periodic sweep). Call once,
    /// after registering the endpoints the process cares about.
    pub fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        self.watcher.start(Arc::clone(&self.reporter))
    }

    /// Stops the watcher and every adapter. In-flight handler invocations
    /// finish on their own threads; the index connection closes when the
    /// last `Arc<SqliteIndex>` drops.
    pub fn stop(&self) {
        self.watcher.stop();
        self.adapters.stop_all();
    }

    pub fn register_endpoint(&self, subject: &str) -> anyhow::Result<Endpoint> {
        let endpoint = Endpoint::new(subject, &self.data_dir);
        self.maildir.ensure_endpoint_dirs(&endpoint.hash)?;
        self.watcher.add_endpoint(&endpoint.hash, subject);
        self.endpoints
            .write()
            .expect("endpoint map lock poisoned")
            .insert(subject.to_string(), endpoint.clone());
        Ok(endpoint)
    }

    pub fn unregister_endpoint(&self, subject: &str) {
        if let Some(endpoint) = self.endpoints.write().expect("endpoint map lock poisoned").remove(subject) {
            self.watcher.remove_endpoint(&endpoint.hash);
        }
    }

    pub fn list_endpoints(&self) -> Vec<Endpoint> {
        self.endpoints.read().expect("endpoint map lock poisoned").values().cloned().collect()
    }

    pub fn add_access_rule(&self, rule: AccessRule) {
        self.access.add_rule(rule);
    }

    pub fn remove_access_rule(&self, from: &str, to: &str) -> bool {
        self.access.remove_rule(from, to)
    }

    pub fn list_access_rules(&self) -> Vec<AccessRule> {
        self.access.list_rules()
    }

    /// In-memory push subscription; lost on restart.
    pub fn on_signal(self: &Arc<Self>, pattern: impl Into<String>, handler: Handler) -> Unsubscribe {
        self.subscriptions.subscribe(pattern, handler)
    }

    pub fn register_adapter(&self, adapter: Box<dyn crate::adapter::RelayAdapter>) -> anyhow::Result<()> {
        self.adapters.register(adapter, &CoreAdapterHost { core: self })
    }

    /// Runs the full publish pipeline with default options (no reply-to, a
    /// fresh budget built from `ttl_ms`). See [`RelayCore::publish_with`]
    /// for the full `{from, replyTo?, budget?}` contract.
    pub fn publish(&self, subject: &str, from: &str, payload: serde_json::Value, ttl_ms: i64) -> anyhow::Result<PublishResult> {
        self.publish_with(subject, from, payload, PublishOptions::new(ttl_ms))
    }

    /// Runs the full publish pipeline: access check, rate limit, budget
    /// evaluation, fan-out to every endpoint whose registered subject
    /// matches, each gated by its own circuit breaker and backpressure
    /// check before the write. Endpoints are processed in parallel; a
    /// rejection at one endpoint never blocks delivery to another.
    ///
    /// `options.budget`, when given, continues an existing hop chain (used
    /// by `BindingRouter` when it republishes an inbound envelope onto
    /// `relay.agent.{sessionId}`) rather than starting a fresh one.
    pub fn publish_with(&self, subject: &str, from: &str, payload: serde_json::Value, options: PublishOptions) -> anyhow::Result<PublishResult> {
        let now = Utc::now();
        let now_ms = now.timestamp_millis();

        // Whole-publish rejections (access/rate-limit/budget) never reach a
        // registered endpoint's mailbox, so the dead letter is filed under
        // the hash of the target subject itself rather than any endpoint.
        let reject_hash = relay_types::endpoint_hash(subject);

        let decision = self.access.check(from, subject);
        if !decision.allowed {
            let rejected_envelope = Envelope {
                id: MessageId::new(),
                subject: subject.to_string(),
                from: from.to_string(),
                reply_to: options.reply_to,
                created_at: now,
                budget: options.budget.unwrap_or_else(|| Budget::new(options.ttl_ms)),
                payload,
                extra: BTreeMap::new(),
            };
            self.dead_letter_reject(&reject_hash, &rejected_envelope, "access_denied");
            return Ok(PublishResult {
                message_id: rejected_envelope.id,
                delivered_to: Vec::new(),
                rejected: vec![(subject.to_string(), RejectReason::AccessDenied)],
                mailbox_pressure: None,
            });
        }

        if !self.rate_limiter.check(from, now_ms) {
            let rejected_envelope = Envelope {
                id: MessageId::new(),
                subject: subject.to_string(),
                from: from.to_string(),
                reply_to: options.reply_to,
                created_at: now,
                budget: options.budget.unwrap_or_else(|| Budget::new(options.ttl_ms)),
                payload,
                extra: BTreeMap::new(),
            };
            self.dead_letter_reject(&reject_hash, &rejected_envelope, "rate_limited");
            return Ok(PublishResult {
                message_id: rejected_envelope.id,
                delivered_to: Vec::new(),
                rejected: vec![(subject.to_string(), RejectReason::RateLimited)],
                mailbox_pressure: None,
            });
        }

        let budget = options.budget.unwrap_or_else(|| Budget::new(options.ttl_ms));
        let budget = match advance_budget(&budget, from, now_ms) {
            Ok(b) => b,
            Err(reason) => {
                let rejected_envelope = Envelope {
                    id: MessageId::new(),
                    subject: subject.to_string(),
                    from: from.to_string(),
                    reply_to: options.reply_to,
                    created_at: now,
                    budget,
                    payload,
                    extra: BTreeMap::new(),
                };
                self.dead_letter_reject(&reject_hash, &rejected_envelope, reason.as_str());
                return Ok(PublishResult {
                    message_id: rejected_envelope.id,
                    delivered_to: Vec::new(),
                    rejected: vec![(subject.to_string(), reason)],
                    mailbox_pressure: None,
                });
            }
        };

        let envelope = Envelope {
            id: MessageId::new(),
            subject: subject.to_string(),
            from: from.to_string(),
            reply_to: options.reply_to,
            created_at: now,
            budget,
            payload,
            extra: BTreeMap::new(),
        };

        let targets: Vec<Endpoint> = self
            .endpoints
            .read()
            .expect("endpoint map lock poisoned")
            .values()
            .filter(|e| relay_subject::matches(&e.subject, subject))
            .cloned()
            .collect();

        if targets.is_empty() {
            return Ok(PublishResult {
                message_id: envelope.id,
                delivered_to: Vec::new(),
                rejected: Vec::new(),
                mailbox_pressure: None,
            });
        }

        let results: Vec<(String, Result<Option<(f64, bool)>, RejectReason>)> = std::thread::scope(|scope| {
            let handles: Vec<_> = targets
                .iter()
                .map(|endpoint| {
                    let envelope = envelope.clone();
                    scope.spawn(move || (endpoint.subject.clone(), self.deliver_to_endpoint(endpoint, &envelope, now_ms)))
                })
                .collect();
            handles.into_iter().map(|h| h.join().expect("delivery thread panicked")).collect()
        });

        let mut delivered_to = Vec::new();
        let mut rejected = Vec::new();
        let mut mailbox_pressure = None;
        for (subject, outcome) in results {
            match outcome {
                Ok(Some(pressure)) => {
                    delivered_to.push(subject);
                    mailbox_pressure = Some(pressure);
                }
                Ok(None) => {
                    // Infrastructure failure already logged in deliver_to_endpoint.
                }
                Err(reason) => rejected.push((subject, reason)),
            }
        }

        Ok(PublishResult {
            message_id: envelope.id,
            delivered_to,
            rejected,
            mailbox_pressure,
        })
    }

    /// Best-effort emission of the reserved `relay.system.backpressure.{hash}`
    /// signal: looks up handlers registered via `on_signal` and invokes each
    /// with a synthetic envelope carrying `{hash, ratio}`. Never blocks or
    /// fails a publish; handler errors are swallowed, not surfaced.
    fn emit_backpressure_signal(&self, endpoint_hash: &str, ratio: f64) {
        let subject = format!("relay.system.backpressure.{endpoint_hash}");
        let handlers = self.subscriptions.get_subscribers(&subject);
        if handlers.is_empty() {
            return;
        }
        let signal = Envelope {
            id: MessageId::new(),
            subject: subject.clone(),
            from: "relay.system".to_string(),
            reply_to: None,
            created_at: Utc::now(),
            budget: Budget::new(i64::MAX),
            payload: serde_json::json!({"endpointHash": endpoint_hash, "ratio": ratio}),
            extra: BTreeMap::new(),
        };
        for handler in handlers {
            let _ = handler(&signal);
        }
    }

    /// Files a dead letter for a publish-wide rejection (access/rate-limit/
    /// budget) that never reached a registered endpoint's mailbox. Best
    /// effort: a failure here is logged, not propagated, since the caller
    /// already has a rejection reason to return.
    fn dead_letter_reject(&self, endpoint_hash: &str, envelope: &Envelope, reason: &str) {
        if let Err(e) = self.dead_letters().reject(endpoint_hash, envelope, reason) {
            self.reporter
                .lock()
                .expect("reporter lock poisoned")
                .warn(&format!("dead-lettering rejected publish {} failed: {e}", envelope.id));
        }
    }

    fn deliver_to_endpoint(&self, endpoint: &Endpoint, envelope: &Envelope, now_ms: i64) -> Result<Option<(f64, bool)>, RejectReason> {
        self.breakers.check(&endpoint.hash, now_ms)?;

        let current_size = self.index.count_new_by_endpoint(&endpoint.hash).unwrap_or(0);
        let pressure = crate::backpressure::check(&self.config.backpressure, current_size)?;
        if pressure.warn {
            self.emit_backpressure_signal(&endpoint.hash, pressure.ratio);
        }

        if let Err(e) = self.maildir.write(&endpoint.hash, envelope) {
            // A filesystem failure here is an infrastructure fault, not a
            // policy rejection, so it doesn't map to a `RejectReason`; count
            // it against the breaker and surface it as "not delivered".
            self.reporter.lock().expect("reporter lock poisoned").error(&format!("write to {} failed: {e}", endpoint.subject));
            self.breakers.record_failure(&endpoint.hash, now_ms);
            return Ok(None);
        }

        let row = IndexedMessageRow {
            id: envelope.id,
            subject: envelope.subject.clone(),
            endpoint_hash: endpoint.hash.clone(),
            status: MessageStatus::Pending,
            created_at: envelope.created_at,
            expires_at: None,
            sender: Some(envelope.from.clone()),
        };
        if let Err(e) = self.index.insert_message(&row) {
            self.reporter.lock().expect("reporter lock poisoned").warn(&format!("index insert for {} failed: {e}", endpoint.subject));
        }

        if let Some(result) = self.adapters.deliver(&endpoint.subject, envelope, None::<&AdapterContext>) {
            if !result.success {
                self.reporter
                    .lock()
                    .expect("reporter lock poisoned")
                    .warn(&format!("adapter delivery to {} failed: {:?}", endpoint.subject, result.error));
            }
        }

        Ok(Some((pressure.ratio, pressure.warn)))
    }

    pub fn dead_letters(&self) -> DeadLetterQueue<'_> {
        DeadLetterQueue::new(&self.maildir, &self.index)
    }

    pub fn index(&self) -> &SqliteIndex {
        &self.index
    }

    pub fn maildir(&self) -> &MaildirStore {
        &self.maildir
    }

    pub fn data_dir(&self) -> &std::path::Path {
        &self.data_dir
    }
}

/// Narrow `AdapterHost` view over `RelayCore`, handed to adapters at
/// `start()` so they can register/unregister endpoints without needing the
/// whole core type in scope (see `crate::adapter`).
struct CoreAdapterHost<'a> {
    core: &'a RelayCore,
}

impl AdapterHost for CoreAdapterHost<'_> {
    fn register_endpoint(&self, subject: &str) -> anyhow::Result<()> {
        self.core.register_endpoint(subject).map(|_| ())
    }

    fn unregister_endpoint(&self, subject: &str) {
        self.core.unregister_endpoint(subject);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::NullReporter;

    fn core() -> Arc<RelayCore> {
        let dir = tempfile::tempdir().unwrap();
        let config = RelayConfig::new(dir.path());
        let core = RelayCore::open(config, Arc::new(Mutex::new(NullReporter))).unwrap();
        std::mem::forget(dir); // keep tempdir alive for the test's duration
        core
    }

    #[test]
    fn publish_with_no_registered_endpoints_delivers_nowhere() {
        let core = core();
        let result = core.publish("relay.agent.alice", "sys", serde_json::json!({}), i64::MAX).unwrap();
        assert!(result.delivered_to.is_empty());
        assert!(result.rejected.is_empty());
    }

    #[test]
    fn publish_to_registered_endpoint_writes_to_maildir() {
        let core = core();
        core.register_endpoint("relay.agent.alice").unwrap();
        let result = core.publish("relay.agent.alice", "sys", serde_json::json!({"msg": "hi"}), i64::MAX).unwrap();
        assert_eq!(result.delivered_to, vec!["relay.agent.alice".to_string()]);
        assert!(result.rejected.is_empty());

        let hash = relay_types::endpoint_hash("relay.agent.alice");
        assert_eq!(core.maildir().list_new(&hash).unwrap(), vec![result.message_id]);
    }

    #[test]
    fn hop_limit_rejection_writes_a_dead_letter() {
        let core = core();
        let budget = Budget {
            max_hops: 2,
            hop_count: 2,
            call_budget_remaining: 1,
            ttl: Utc::now().timestamp_millis() + 60_000,
            ancestor_chain: Vec::new(),
        };
        let result = core
            .publish_with(
                "relay.agent.alice",
                "sys",
                serde_json::json!({}),
                PublishOptions::new(60_000).with_budget(budget),
            )
            .unwrap();
        assert!(result.delivered_to.is_empty());
        assert_eq!(result.rejected, vec![("relay.agent.alice".to_string(), RejectReason::HopLimit)]);

        let hash = relay_types::endpoint_hash("relay.agent.alice");
        let dead = core.dead_letters().list_dead(Some(&hash)).unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason_text(), "hop_limit");
    }

    #[test]
    fn publish_denied_by_access_rule_is_rejected() {
        let core = core();
        core.register_endpoint("relay.agent.alice").unwrap();
        core.add_access_rule(AccessRule {
            from: "sys".to_string(),
            to: "relay.agent.alice".to_string(),
            action: relay_types::AccessAction::Deny,
            priority: 10,
        });
        let result = core.publish("relay.agent.alice", "sys", serde_json::json!({}), i64::MAX).unwrap();
        assert_eq!(result.rejected, vec![("relay.agent.alice".to_string(), RejectReason::AccessDenied)]);
    }

    #[test]
    fn publish_past_backpressure_ceiling_rejects_that_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RelayConfig::new(dir.path());
        config.backpressure.max_mailbox_size = 1;
        let core = RelayCore::open(config, Arc::new(Mutex::new(NullReporter))).unwrap();
        core.register_endpoint("relay.agent.alice").unwrap();

        let first = core.publish("relay.agent.alice", "sys", serde_json::json!({}), i64::MAX).unwrap();
        assert_eq!(first.delivered_to.len(), 1);

        let second = core.publish("relay.agent.alice", "sys", serde_json::json!({}), i64::MAX).unwrap();
        assert_eq!(second.rejected.len(), 1);
        std::mem::forget(dir);
    }

    #[test]
    fn crossing_pressure_warning_ratio_emits_backpressure_signal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RelayConfig::new(dir.path());
        config.backpressure.max_mailbox_size = 2;
        config.backpressure.pressure_warning_at = 0.4;
        let core = RelayCore::open(config, Arc::new(Mutex::new(NullReporter))).unwrap();
        core.register_endpoint("relay.agent.alice").unwrap();

        let seen_ratio = Arc::new(Mutex::new(None));
        let seen_ratio2 = Arc::clone(&seen_ratio);
        core.on_signal(
            "relay.system.backpressure.>",
            Arc::new(move |env| {
                *seen_ratio2.lock().unwrap() = env.payload.get("ratio").and_then(|v| v.as_f64());
                Ok(())
            }),
        );

        // First publish: mailbox empty, ratio 0.0, below the 0.4 threshold.
        core.publish("relay.agent.alice", "sys", serde_json::json!({}), i64::MAX).unwrap();
        assert!(seen_ratio.lock().unwrap().is_none());

        // Second publish: mailbox holds 1 of 2, ratio 0.5 crosses 0.4.
        core.publish("relay.agent.alice", "sys", serde_json::json!({}), i64::MAX).unwrap();
        assert_eq!(*seen_ratio.lock().unwrap(), Some(0.5));
        std::mem::forget(dir);
    }
}
