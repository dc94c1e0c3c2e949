//! BindingRouter: the canonical consumer of the message bus's own
//! subscribe/publish contracts. Subscribes to `relay.human.>`, resolves
//! each inbound envelope to an agent session via a scored binding lookup,
//! and republishes onto `relay.agent.{sessionId}`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use relay_core::{PublishOptions, RelayCore, Unsubscribe};
use relay_types::{AdapterBinding, Envelope, SessionStrategy};
use uuid::Uuid;

const MAX_SESSIONS: usize = 10_000;

/// `relay.human.{platform}.[group.]{chatId}` parsed into its components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundSubject {
    pub adapter_id: String,
    pub chat_id: String,
    pub channel_type: Option<String>,
}

/// Parses a subject of the shape `relay.human.{platform}.[group.]{chatId}`.
/// Returns `None` for anything that doesn't have at least a platform and a
/// chat id.
pub fn parse_inbound_subject(subject: &str) -> Option<InboundSubject> {
    let mut parts = subject.split('.');
    if parts.next()? != "relay" {
        return None;
    }
    if parts.next()? != "human" {
        return None;
    }
    let adapter_id = parts.next()?.to_string();
    let rest: Vec<&str> = parts.collect();
    match rest.as_slice() {
        [chat_id] => Some(InboundSubject {
            adapter_id,
            chat_id: chat_id.to_string(),
            channel_type: None,
        }),
        [channel_type, chat_id] => Some(InboundSubject {
            adapter_id,
            chat_id: chat_id.to_string(),
            channel_type: Some(channel_type.to_string()),
        }),
        _ => None,
    }
}

/// Most-specific-first binding score; `0` means eliminated (an explicit
/// field on the binding conflicts with the request).
fn score_binding(binding: &AdapterBinding, inbound: &InboundSubject) -> u8 {
    if binding.adapter_id != inbound.adapter_id {
        return 0;
    }
    let chat_exact = match &binding.chat_id {
        Some(b) if b == &inbound.chat_id => true,
        Some(_) => return 0,
        None => false,
    };
    let channel_exact = match (&binding.channel_type, &inbound.channel_type) {
        (Some(b), Some(r)) if b == r => true,
        (Some(_), _) => return 0,
        (None, _) => false,
    };
    match (chat_exact, channel_exact) {
        (true, true) => 7,
        (true, false) => 5,
        (false, true) => 3,
        (false, false) => 1,
    }
}

/// Derives the session-cache key for a binding's strategy. `user_id` comes
/// from the inbound envelope's metadata when present.
fn session_key(binding: &AdapterBinding, inbound: &InboundSubject, user_id: Option<&str>) -> Option<String> {
    match binding.session_strategy {
        SessionStrategy::PerChat => Some(format!("{}:chat:{}", binding.id, inbound.chat_id)),
        SessionStrategy::PerUser => {
            let key = user_id.unwrap_or(&inbound.chat_id);
            Some(format!("{}:user:{}", binding.id, key))
        }
        SessionStrategy::Stateless => None,
    }
}

/// `createSession(agentDir) -> {id}`, injected so the router stays
/// decoupled from whatever process hosts agent sessions.
pub trait SessionFactory: Send + Sync {
    fn create_session(&self, agent_dir: &Path) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct SessionMapEntry {
    binding_id: Uuid,
    session_id: String,
}

/// Bounded `(bindingId, context) -> sessionId` cache with oldest-insertion
/// eviction and persistence, plus an in-flight table so concurrent
/// requests for the same key dedupe onto one `create_session` call.
struct SessionCache {
    entries: Mutex<HashMap<String, SessionMapEntry>>,
    order: Mutex<VecDeque<String>>,
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    persist_path: Option<PathBuf>,
}

impl SessionCache {
    fn new(persist_path: Option<PathBuf>) -> Self {
        let mut cache = Self {
            entries: Mutex::new(HashMap::new()),
            order: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(HashMap::new()),
            persist_path,
        };
        cache.load();
        cache
    }

    fn load(&mut self) {
        let Some(path) = &self.persist_path else { return };
        let Ok(bytes) = fs::read(path) else { return };
        let Ok(map): Result<HashMap<String, SessionMapEntry>, _> = serde_json::from_slice(&bytes) else {
            return;
        };
        let mut order = VecDeque::with_capacity(map.len());
        for key in map.keys() {
            order.push_back(key.clone());
        }
        *self.entries.get_mut().expect("session cache lock poisoned") = map;
        *self.order.get_mut().expect("session order lock poisoned") = order;
    }

    fn persist(&self) {
        let Some(path) = &self.persist_path else { return };
        let entries = self.entries.lock().expect("session cache lock poisoned");
        let Ok(data) = serde_json::to_vec_pretty(&*entries) else { return };
        drop(entries);
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let tmp = path.with_extension("tmp");
        if let Ok(mut f) = fs::File::create(&tmp) {
            if f.write_all(&data).is_ok() {
                let _ = f.sync_all();
                let _ = fs::rename(&tmp, path);
            }
        }
    }

    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().expect("session cache lock poisoned").get(key).map(|e| e.session_id.clone())
    }

    fn insert(&self, key: &str, binding_id: Uuid, session_id: String) {
        let mut entries = self.entries.lock().expect("session cache lock poisoned");
        let is_new = !entries.contains_key(key);
        entries.insert(
            key.to_string(),
            SessionMapEntry {
                binding_id,
                session_id,
            },
        );
        drop(entries);

        if is_new {
            let mut order = self.order.lock().expect("session order lock poisoned");
            order.push_back(key.to_string());
            while order.len() > MAX_SESSIONS {
                if let Some(oldest) = order.pop_front() {
                    self.entries.lock().expect("session cache lock poisoned").remove(&oldest);
                }
            }
        }
        self.persist();
    }

    /// Returns the cached session id, creating one via `factory` if absent.
    /// Concurrent calls for the same `key` block on a per-key mutex so only
    /// one of them actually calls `create_session`.
    fn get_or_create(&self, key: &str, binding_id: Uuid, agent_dir: &Path, factory: &dyn SessionFactory) -> anyhow::Result<String> {
        if let Some(id) = self.get(key) {
            return Ok(id);
        }

        let key_lock = {
            let mut in_flight = self.in_flight.lock().expect("in-flight table lock poisoned");
            Arc::clone(in_flight.entry(key.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))))
        };
        let _guard = key_lock.lock().expect("per-key session lock poisoned");

        if let Some(id) = self.get(key) {
            return Ok(id);
        }
        let session_id = factory.create_session(agent_dir)?;
        self.insert(key, binding_id, session_id.clone());
        Ok(session_id)
    }

    /// Removes every entry whose binding id is not in `active_binding_ids`,
    /// then persists.
    fn evict_orphans(&self, active_binding_ids: &HashSet<Uuid>) {
        let mut entries = self.entries.lock().expect("session cache lock poisoned");
        let orphans: Vec<String> = entries
            .iter()
            .filter(|(_, e)| !active_binding_ids.contains(&e.binding_id))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &orphans {
            entries.remove(key);
        }
        drop(entries);

        let mut order = self.order.lock().expect("session order lock poisoned");
        order.retain(|k| !orphans.contains(k));
        drop(order);

        self.persist();
    }
}

/// Maps `relay.human.*` adapter traffic to agent sessions and republishes
/// it onto `relay.agent.{sessionId}`.
pub struct BindingRouter {
    core: Arc<RelayCore>,
    bindings: RwLock<Vec<AdapterBinding>>,
    sessions: SessionCache,
    factory: Box<dyn SessionFactory>,
}

impl BindingRouter {
    pub fn new(core: Arc<RelayCore>, factory: Box<dyn SessionFactory>, persist_path: Option<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            core,
            bindings: RwLock::new(Vec::new()),
            sessions: SessionCache::new(persist_path),
            factory,
        })
    }

    pub fn add_binding(&self, binding: AdapterBinding) {
        self.bindings.write().expect("binding table lock poisoned").push(binding);
    }

    pub fn remove_binding(&self, id: Uuid) {
        self.bindings.write().expect("binding table lock poisoned").retain(|b| b.id != id);
    }

    pub fn list_bindings(&self) -> Vec<AdapterBinding> {
        self.bindings.read().expect("binding table lock poisoned").clone()
    }

    /// Subscribes to `relay.human.>` on the core and starts routing
    /// inbound envelopes. Keep the returned handle; call `.unsubscribe()`
    /// to stop routing.
    pub fn start(self: &Arc<Self>) -> Unsubscribe {
        let router = Arc::clone(self);
        self.core.on_signal(
            "relay.human.>",
            Arc::new(move |envelope: &Envelope| router.handle_inbound(envelope).map_err(|e| e.to_string())),
        )
    }

    fn find_binding(&self, inbound: &InboundSubject) -> Option<AdapterBinding> {
        self.bindings
            .read()
            .expect("binding table lock poisoned")
            .iter()
            .map(|b| (b, score_binding(b, inbound)))
            .filter(|(_, score)| *score > 0)
            .max_by_key(|(_, score)| *score)
            .map(|(b, _)| b.clone())
    }

    fn handle_inbound(&self, envelope: &Envelope) -> anyhow::Result<()> {
        let Some(inbound) = parse_inbound_subject(&envelope.subject) else {
            anyhow::bail!("malformed inbound subject: {}", envelope.subject);
        };
        let Some(binding) = self.find_binding(&inbound) else {
            anyhow::bail!("no binding matches {:?}", inbound);
        };

        let user_id = envelope.extra.get("user_id").and_then(|v| v.as_str());
        let session_id = match session_key(&binding, &inbound, user_id) {
            Some(key) => self.sessions.get_or_create(&key, binding.id, &binding.agent_dir, self.factory.as_ref())?,
            None => self.factory.create_session(&binding.agent_dir)?,
        };

        let target = format!("relay.agent.{session_id}");
        let mut options = PublishOptions::new(envelope.budget.ttl).with_budget(envelope.budget.clone());
        if let Some(reply_to) = &envelope.reply_to {
            options = options.with_reply_to(reply_to.clone());
        }
        self.core.publish_with(&target, &envelope.from, envelope.payload.clone(), options)?;
        Ok(())
    }

    /// Given the current set of live binding ids, drops session-map entries
    /// belonging to bindings that no longer exist.
    pub fn cleanup_orphans(&self, active_binding_ids: &HashSet<Uuid>) {
        self.sessions.evict_orphans(active_binding_ids);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use relay_core::NullReporter;
    use relay_core::RelayConfig;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingFactory {
        calls: AtomicU64,
    }
    impl SessionFactory for CountingFactory {
        fn create_session(&self, _agent_dir: &Path) -> anyhow::Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("session-{n}"))
        }
    }

    fn binding(id: Uuid, adapter_id: &str, chat_id: Option<&str>, strategy: SessionStrategy) -> AdapterBinding {
        AdapterBinding {
            id,
            adapter_id: adapter_id.to_string(),
            agent_id: "agent-1".to_string(),
            agent_dir: PathBuf::from("/agents/agent-1"),
            chat_id: chat_id.map(str::to_string),
            channel_type: None,
            session_strategy: strategy,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn parses_direct_chat_subject() {
        let parsed = parse_inbound_subject("relay.human.telegram.1001").unwrap();
        assert_eq!(parsed.adapter_id, "telegram");
        assert_eq!(parsed.chat_id, "1001");
        assert_eq!(parsed.channel_type, None);
    }

    #[test]
    fn parses_group_chat_subject() {
        let parsed = parse_inbound_subject("relay.human.telegram.group.1001").unwrap();
        assert_eq!(parsed.channel_type, Some("group".to_string()));
        assert_eq!(parsed.chat_id, "1001");
    }

    #[test]
    fn malformed_subject_returns_none() {
        assert!(parse_inbound_subject("relay.human.telegram").is_none());
        assert!(parse_inbound_subject("relay.agent.alice").is_none());
    }

    #[test]
    fn most_specific_binding_wins() {
        let inbound = InboundSubject {
            adapter_id: "telegram".to_string(),
            chat_id: "1001".to_string(),
            channel_type: None,
        };
        let wildcard = binding(Uuid::new_v4(), "telegram", None, SessionStrategy::PerChat);
        let exact = binding(Uuid::new_v4(), "telegram", Some("1001"), SessionStrategy::PerChat);
        assert!(score_binding(&exact, &inbound) > score_binding(&wildcard, &inbound));
    }

    #[test]
    fn chat_id_mismatch_eliminates_binding() {
        let inbound = InboundSubject {
            adapter_id: "telegram".to_string(),
            chat_id: "1001".to_string(),
            channel_type: None,
        };
        let other_chat = binding(Uuid::new_v4(), "telegram", Some("9999"), SessionStrategy::PerChat);
        assert_eq!(score_binding(&other_chat, &inbound), 0);
    }

    #[test]
    fn concurrent_get_or_create_dedupes_to_one_session() {
        let cache = SessionCache::new(None);
        let factory = CountingFactory { calls: AtomicU64::new(0) };
        let binding_id = Uuid::new_v4();
        let id1 = cache.get_or_create("k", binding_id, Path::new("/a"), &factory).unwrap();
        let id2 = cache.get_or_create("k", binding_id, Path::new("/a"), &factory).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(factory.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn orphan_cleanup_drops_entries_for_inactive_bindings() {
        let cache = SessionCache::new(None);
        let factory = CountingFactory { calls: AtomicU64::new(0) };
        let live = Uuid::new_v4();
        let dead = Uuid::new_v4();
        cache.get_or_create("live-key", live, Path::new("/a"), &factory).unwrap();
        cache.get_or_create("dead-key", dead, Path::new("/a"), &factory).unwrap();

        let mut active = HashSet::new();
        active.insert(live);
        cache.evict_orphans(&active);

        assert!(cache.get("live-key").is_some());
        assert!(cache.get("dead-key").is_none());
    }

    #[test]
    fn handle_inbound_republishes_to_agent_session() {
        let dir = tempfile::tempdir().unwrap();
        let config = RelayConfig::new(dir.path());
        let core = RelayCore::open(config, Arc::new(Mutex::new(NullReporter))).unwrap();

        let factory = Box::new(CountingFactory { calls: AtomicU64::new(0) });
        let router = BindingRouter::new(Arc::clone(&core), factory, None);
        let binding_id = Uuid::new_v4();
        router.add_binding(binding(binding_id, "telegram", Some("1001"), SessionStrategy::PerChat));

        core.register_endpoint("relay.agent.session-0").unwrap();

        let envelope = Envelope {
            id: relay_types::MessageId::new(),
            subject: "relay.human.telegram.1001".to_string(),
            from: "telegram-adapter".to_string(),
            reply_to: None,
            created_at: Utc::now(),
            budget: relay_types::Budget::new(i64::MAX),
            payload: serde_json::json!({"text": "hi"}),
            extra: std::collections::BTreeMap::new(),
        };

        router.handle_inbound(&envelope).unwrap();

        let hash = relay_types::endpoint_hash("relay.agent.session-0");
        assert_eq!(core.maildir().list_new(&hash).unwrap().len(), 1);
        std::mem::forget(dir);
    }
}
