//! Adapter plug-in lifecycle: load, start, stop, and dispatch to external
//! channel adapters (Telegram, webhook, claude-code, ...). Static
//! registration is the common case; the registry still reconciles a
//! config-driven set so a future dynamic loader has somewhere to plug in.

use std::collections::HashMap;
use std::sync::Mutex;

use relay_types::Envelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Connected,
    Disconnected,
    Error,
    Starting,
    Stopping,
}

#[derive(Debug, Clone, Default)]
pub struct AdapterStatus {
    pub state: Option<AdapterState>,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub last_error: Option<String>,
}

impl AdapterStatus {
    pub fn new(state: AdapterState) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Caller-supplied context for an outbound `deliver` call (e.g. reply
/// metadata, custom headers). Opaque to the core; adapters interpret it.
#[derive(Debug, Clone, Default)]
pub struct AdapterContext {
    pub headers: HashMap<String, String>,
    pub metadata: serde_json::Value,
}

/// The subset of `RelayCore` an adapter needs at `start`/`stop` time:
/// registering/unregistering the endpoints it owns. Kept narrow so
/// `relay-core`'s adapter module doesn't need the whole `RelayCore` type
/// defined first.
pub trait AdapterHost {
    fn register_endpoint(&self, subject: &str) -> anyhow::Result<()>;
    fn unregister_endpoint(&self, subject: &str);
}

/// An external channel adapter. `start`/`stop` are idempotent.
pub trait RelayAdapter: Send {
    fn id(&self) -> &str;
    fn subject_prefixes(&self) -> &[String];
    fn display_name(&self) -> &str;

    fn start(&mut self, host: &dyn AdapterHost) -> anyhow::Result<()>;
    fn stop(&mut self) -> anyhow::Result<()>;

    fn deliver(&self, subject: &str, envelope: &Envelope, context: Option<&AdapterContext>) -> DeliveryResult;

    fn get_status(&self) -> AdapterStatus;

    /// Lightweight credential check without starting the full lifecycle.
    fn test_connection(&self) -> anyhow::Result<()> {
        anyhow::bail!("test_connection not supported by adapter {}", self.id())
    }
}

/// Owns the set of live adapters, keyed by id. Each adapter is behind its
/// own mutex so one adapter's `deliver` call never blocks another's.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: Mutex<HashMap<String, Mutex<Box<dyn RelayAdapter>>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, mut adapter: Box<dyn RelayAdapter>, host: &dyn AdapterHost) -> anyhow::Result<()> {
        adapter.start(host)?;
        let id = adapter.id().to_string();
        self.adapters
            .lock()
            .expect("adapter registry lock poisoned")
            .insert(id, Mutex::new(adapter));
        Ok(())
    }

    pub fn unregister(&self, id: &str) -> anyhow::Result<()> {
        let removed = self
            .adapters
            .lock()
            .expect("adapter registry lock poisoned")
            .remove(id);
        if let Some(adapter) = removed {
            adapter.lock().expect("adapter mutex poisoned").stop()?;
        }
        Ok(())
    }

    pub fn stop_all(&self) {
        let adapters = self.adapters.lock().expect("adapter registry lock poisoned");
        for adapter in adapters.values() {
            let _ = adapter.lock().expect("adapter mutex poisoned").stop();
        }
    }

    /// Picks the first registered adapter whose `subject_prefixes` matches
    /// `subject` under NATS-style wildcard rules and calls `deliver`.
    pub fn deliver(
        &self,
        subject: &str,
        envelope: &Envelope,
        context: Option<&AdapterContext>,
    ) -> Option<DeliveryResult> {
        let adapters = self.adapters.lock().expect("adapter registry lock poisoned");
        for adapter in adapters.values() {
            let adapter = adapter.lock().expect("adapter mutex poisoned");
            if adapter.subject_prefixes().iter().any(|p| relay_subject::matches(p, subject)) {
                return Some(adapter.deliver(subject, envelope, context));
            }
        }
        None
    }

    pub fn statuses(&self) -> Vec<(String, AdapterStatus)> {
        let adapters = self.adapters.lock().expect("adapter registry lock poisoned");
        adapters
            .iter()
            .map(|(id, adapter)| (id.clone(), adapter.lock().expect("adapter mutex poisoned").get_status()))
            .collect()
    }
}
