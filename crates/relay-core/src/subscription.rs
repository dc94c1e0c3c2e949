//! In-memory, process-local subscription table. Lost on crash; consumers
//! re-register at startup — push subscriptions are not persisted across
//! restarts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use relay_types::Envelope;

/// A push handler: returns `Ok(())` on successful delivery, `Err` to move
/// the envelope to `failed/` and tick the circuit breaker.
pub type Handler = Arc<dyn Fn(&Envelope) -> Result<(), String> + Send + Sync>;

struct Subscription {
    id: u64,
    pattern: String,
    handler: Handler,
}

/// Pattern -> handler table, read by every watcher event and mutated by
/// `subscribe`/`unsubscribe`. A reader-writer lock: reads dominate.
#[derive(Default)]
pub struct SubscriptionRegistry {
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
}

/// Returned by `subscribe`; dropping it does NOT unsubscribe — call
/// `.unsubscribe()` explicitly. `subscribe` returns the means to undo
/// itself rather than requiring callers to track the pattern/handler pair.
pub struct Unsubscribe {
    registry: Arc<SubscriptionRegistry>,
    id: u64,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {
        self.registry.remove(self.id);
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(self: &Arc<Self>, pattern: impl Into<String>, handler: Handler) -> Unsubscribe {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscriptions
            .write()
            .expect("subscription registry lock poisoned")
            .push(Subscription {
                id,
                pattern: pattern.into(),
                handler,
            });
        Unsubscribe {
            registry: Arc::clone(self),
            id,
        }
    }

    fn remove(&self, id: u64) {
        self.subscriptions
            .write()
            .expect("subscription registry lock poisoned")
            .retain(|s| s.id != id);
    }

    /// All handlers whose pattern matches `subject`, via `relay-subject`.
    pub fn get_subscribers(&self, subject: &str) -> Vec<Handler> {
        self.subscriptions
            .read()
            .expect("subscription registry lock poisoned")
            .iter()
            .filter(|s| relay_subject::matches(&s.pattern, subject))
            .map(|s| Arc::clone(&s.handler))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.read().expect("subscription registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
