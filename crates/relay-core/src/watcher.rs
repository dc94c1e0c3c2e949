//! Filesystem watcher over every endpoint's `new/` directory. `notify`
//! events are the fast path; a periodic sweep covers events a native
//! watcher drops under load, treating the watcher as may-miss-events rather
//! than authoritative.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use notify::event::CreateKind;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use relay_breaker::CircuitBreakerRegistry;
use relay_index::SqliteIndex;
use relay_maildir::MaildirStore;
use relay_types::{MessageId, MessageStatus};

use crate::reporter::Reporter;
use crate::subscription::SubscriptionRegistry;

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_secs(2);

enum ControlMessage {
    Stop,
}

/// One `notify` watcher plus a sweep loop, shared across every registered
/// endpoint. Delivery happens on whichever thread observes the file first
/// (watcher event or sweep), with `MaildirStore::claim`'s atomic rename
/// ensuring only one of them wins per message.
pub struct WatcherManager {
    data_dir: PathBuf,
    maildir: Arc<MaildirStore>,
    index: Arc<SqliteIndex>,
    subscriptions: Arc<SubscriptionRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    endpoints: Mutex<HashMap<String, String>>,
    control_tx: Mutex<Option<std_mpsc::Sender<ControlMessage>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WatcherManager {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        maildir: Arc<MaildirStore>,
        index: Arc<SqliteIndex>,
        subscriptions: Arc<SubscriptionRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            maildir,
            index,
            subscriptions,
            breakers,
            endpoints: Mutex::new(HashMap::new()),
            control_tx: Mutex::new(None),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Registers an endpoint for watching. Safe to call before or after
    /// `start`; if the watcher is already running, the directory is added
    /// to the live `notify::Watcher` immediately.
    pub fn add_endpoint(&self, endpoint_hash: &str, subject: &str) {
        self.endpoints
            .lock()
            .expect("watcher endpoint map poisoned")
            .insert(endpoint_hash.to_string(), subject.to_string());
    }

    pub fn remove_endpoint(&self, endpoint_hash: &str) {
        self.endpoints
            .lock()
            .expect("watcher endpoint map poisoned")
            .remove(endpoint_hash);
    }

    /// Spawns the notify-event thread and the periodic-sweep thread.
    /// Idempotent only in the sense that calling it twice spawns two
    /// independent watcher threads; callers should call it once at startup.
    pub fn start(self: &Arc<Self>, reporter: Arc<Mutex<dyn Reporter + Send>>) -> anyhow::Result<()> {
        let (tx, rx) = std_mpsc::channel::<Result<Event, notify::Error>>();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            Config::default().with_poll_interval(POLL_INTERVAL),
        )?;

        for hash in self.endpoints.lock().expect("watcher endpoint map poisoned").keys() {
            self.watch_dir(&mut watcher, hash, &reporter);
        }

        let (control_tx, control_rx) = std_mpsc::channel();
        *self.control_tx.lock().expect("control channel lock poisoned") = Some(control_tx);

        let event_manager = Arc::clone(self);
        let event_reporter = Arc::clone(&reporter);
        let event_handle = std::thread::spawn(move || {
            let _watcher = watcher;
            loop {
                match rx.recv_timeout(Duration::from_millis(500)) {
                    Ok(Ok(event)) => event_manager.handle_event(event, &event_reporter),
                    Ok(Err(e)) => event_reporter.lock().expect("reporter lock poisoned").warn(&format!("watcher error: {e}")),
                    Err(std_mpsc::RecvTimeoutError::Timeout) => {}
                    Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
                }
                if matches!(control_rx.try_recv(), Ok(ControlMessage::Stop)) {
                    break;
                }
            }
        });

        let sweep_manager = Arc::clone(self);
        let sweep_reporter = Arc::clone(&reporter);
        let sweep_handle = std::thread::spawn(move || loop {
            std::thread::sleep(SWEEP_INTERVAL);
            sweep_manager.sweep(&sweep_reporter);
        });

        self.handles.lock().expect("watcher handles lock poisoned").push(event_handle);
        self.handles.lock().expect("watcher handles lock poisoned").push(sweep_handle);
        Ok(())
    }

    /// Signals the event thread to stop. The sweep thread is daemon-style
    /// and exits when the process does; in-flight handler invocations are
    /// left to finish on their own threads.
    pub fn stop(&self) {
        if let Some(tx) = self.control_tx.lock().expect("control channel lock poisoned").take() {
            let _ = tx.send(ControlMessage::Stop);
        }
    }

    fn watch_dir(&self, watcher: &mut RecommendedWatcher, endpoint_hash: &str, reporter: &Arc<Mutex<dyn Reporter + Send>>) {
        let dir = self.data_dir.join(endpoint_hash).join("new");
        if let Err(e) = std::fs::create_dir_all(&dir) {
            reporter
                .lock()
                .expect("reporter lock poisoned")
                .warn(&format!("could not create {}: {e}", dir.display()));
            return;
        }
        if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
            reporter
                .lock()
                .expect("reporter lock poisoned")
                .warn(&format!("could not watch {}: {e}", dir.display()));
        }
    }

    fn handle_event(&self, event: Event, reporter: &Arc<Mutex<dyn Reporter + Send>>) {
        if !matches!(event.kind, EventKind::Create(CreateKind::File) | EventKind::Create(CreateKind::Any)) {
            return;
        }
        for path in event.paths {
            let Some(endpoint_hash) = path
                .parent()
                .and_then(|p| p.parent())
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str())
                .map(str::to_string)
            else {
                continue;
            };
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<MessageId>().ok())
            else {
                continue;
            };
            self.deliver_one(&endpoint_hash, id, reporter);
        }
    }

    /// Lists every endpoint's `new/` directory and attempts delivery of
    /// anything still there. Messages already claimed by the notify path
    /// are simply not found when this thread tries to claim them.
    fn sweep(&self, reporter: &Arc<Mutex<dyn Reporter + Send>>) {
        let hashes: Vec<String> = self
            .endpoints
            .lock()
            .expect("watcher endpoint map poisoned")
            .keys()
            .cloned()
            .collect();
        for hash in hashes {
            let ids = match self.maildir.list_new(&hash) {
                Ok(ids) => ids,
                Err(e) => {
                    reporter.lock().expect("reporter lock poisoned").warn(&format!("sweep list_new({hash}) failed: {e}"));
                    continue;
                }
            };
            for id in ids {
                self.deliver_one(&hash, id, reporter);
            }
        }
    }

    fn deliver_one(&self, endpoint_hash: &str, id: MessageId, reporter: &Arc<Mutex<dyn Reporter + Send>>) {
        // Peek the subject without claiming: if nothing subscribes yet,
        // the envelope stays in new/ untouched for a subscriber that
        // registers later (or the next sweep) to find.
        let peeked = match self.maildir.read_envelope(endpoint_hash, "new", id) {
            Ok(Some(env)) => env,
            Ok(None) => return,
            Err(e) => {
                reporter.lock().expect("reporter lock poisoned").warn(&format!("read {id} failed: {e}"));
                return;
            }
        };
        if self.subscriptions.get_subscribers(&peeked.subject).is_empty() {
            return;
        }

        let envelope = match self.maildir.claim(endpoint_hash, id) {
            Ok(env) => env,
            Err(relay_types::RelayError::NotFound) => return,
            Err(e) => {
                reporter.lock().expect("reporter lock poisoned").warn(&format!("claim {id} failed: {e}"));
                return;
            }
        };

        let handlers = self.subscriptions.get_subscribers(&envelope.subject);
        if handlers.is_empty() {
            // Subscriber unregistered between the peek and the claim.
            // Release the claim by moving the envelope back: MaildirStore
            // has no cur/ -> new/ op, so treat this as "no_subscriber" in
            // failed/ rather than lose the claim silently.
            let _ = self.maildir.fail(endpoint_hash, id, "no_subscriber");
            let _ = self.index.update_status(id, MessageStatus::Failed);
            return;
        }

        let results: Vec<Result<(), String>> = handlers.iter().map(|h| h(&envelope)).collect();
        let now_ms = chrono::Utc::now().timestamp_millis();

        if results.iter().all(Result::is_ok) {
            if let Err(e) = self.maildir.complete(endpoint_hash, id) {
                reporter.lock().expect("reporter lock poisoned").warn(&format!("complete {id} failed: {e}"));
            }
            let _ = self.index.update_status(id, MessageStatus::Delivered);
            self.breakers.record_success(endpoint_hash);
        } else {
            let reason = results
                .into_iter()
                .filter_map(Result::err)
                .next()
                .unwrap_or_else(|| "handler_error".to_string());
            if let Err(e) = self.maildir.fail(endpoint_hash, id, &reason) {
                reporter.lock().expect("reporter lock poisoned").warn(&format!("fail {id} failed: {e}"));
            }
            let _ = self.index.update_status(id, MessageStatus::Failed);
            self.breakers.record_failure(endpoint_hash, now_ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::NullReporter;
    use relay_breaker::CircuitBreakerConfig;
    use relay_types::{Budget, Envelope, IndexedMessageRow};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const HASH: &str = "h1";

    fn envelope(subject: &str) -> Envelope {
        Envelope {
            id: MessageId::new(),
            subject: subject.to_string(),
            from: "sys".to_string(),
            reply_to: None,
            created_at: chrono::Utc::now(),
            budget: Budget::new(i64::MAX),
            payload: serde_json::json!({}),
            extra: BTreeMap::new(),
        }
    }

    /// Writes `env` to `new/` and indexes it pending, mirroring what
    /// `RelayCore::deliver_to_endpoint` does on the publish path before the
    /// watcher ever sees the file.
    fn write_and_index(manager: &WatcherManager, env: &Envelope) {
        manager.maildir.write(HASH, env).unwrap();
        manager
            .index
            .insert_message(&IndexedMessageRow {
                id: env.id,
                subject: env.subject.clone(),
                endpoint_hash: HASH.to_string(),
                status: MessageStatus::Pending,
                created_at: env.created_at,
                expires_at: None,
                sender: Some(env.from.clone()),
            })
            .unwrap();
    }

    fn manager() -> (tempfile::TempDir, Arc<WatcherManager>) {
        let dir = tempfile::tempdir().unwrap();
        let maildir = Arc::new(MaildirStore::new(dir.path()));
        maildir.ensure_endpoint_dirs(HASH).unwrap();
        let index = Arc::new(SqliteIndex::open_in_memory().unwrap());
        let subscriptions = SubscriptionRegistry::new();
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));
        let manager = Arc::new(WatcherManager::new(dir.path(), maildir, index, subscriptions, breakers));
        manager.add_endpoint(HASH, "relay.agent.alice");
        (dir, manager)
    }

    fn reporter() -> Arc<Mutex<dyn Reporter + Send>> {
        Arc::new(Mutex::new(NullReporter))
    }

    #[test]
    fn delivered_message_moves_from_new_to_cur_then_is_gone() {
        let (_dir, manager) = manager();
        manager.subscriptions.subscribe("relay.agent.*", Arc::new(|_env| Ok(())));

        let env = envelope("relay.agent.alice");
        write_and_index(&manager, &env);
        manager.deliver_one(HASH, env.id, &reporter());

        assert!(manager.maildir.list_new(HASH).unwrap().is_empty());
        assert!(manager.maildir.list_current(HASH).unwrap().is_empty());
        assert_eq!(manager.index.get_by_endpoint(HASH).unwrap()[0].status, MessageStatus::Delivered);
    }

    #[test]
    fn no_subscriber_leaves_envelope_in_new() {
        let (_dir, manager) = manager();

        let env = envelope("relay.agent.alice");
        write_and_index(&manager, &env);
        manager.deliver_one(HASH, env.id, &reporter());

        assert_eq!(manager.maildir.list_new(HASH).unwrap(), vec![env.id]);
        assert!(manager.maildir.list_current(HASH).unwrap().is_empty());
        assert!(manager.maildir.list_failed(HASH).unwrap().is_empty());
    }

    #[test]
    fn concurrent_claim_has_exactly_one_winner() {
        let (_dir, manager) = manager();
        manager.subscriptions.subscribe("relay.agent.*", Arc::new(|_env| Ok(())));

        let env = envelope("relay.agent.alice");
        write_and_index(&manager, &env);

        let claims: Vec<_> = std::thread::scope(|scope| {
            (0..4)
                .map(|_| scope.spawn(|| manager.maildir.claim(HASH, env.id)))
                .collect::<Vec<_>>()
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect()
        });

        let wins = claims.iter().filter(|r| r.is_ok()).count();
        let not_found = claims
            .iter()
            .filter(|r| matches!(r, Err(relay_types::RelayError::NotFound)))
            .count();
        assert_eq!(wins, 1);
        assert_eq!(not_found, 3);
    }

    #[test]
    fn failed_handler_moves_message_to_failed_and_ticks_breaker() {
        let (_dir, manager) = manager();
        manager
            .subscriptions
            .subscribe("relay.agent.*", Arc::new(|_env| Err("boom".to_string())));

        let env = envelope("relay.agent.alice");
        write_and_index(&manager, &env);
        manager.deliver_one(HASH, env.id, &reporter());

        assert!(manager.maildir.list_new(HASH).unwrap().is_empty());
        assert_eq!(manager.maildir.list_failed(HASH).unwrap(), vec![env.id]);
        assert_eq!(manager.index.get_by_endpoint(HASH).unwrap()[0].status, MessageStatus::Failed);
    }

    #[test]
    fn sweep_delivers_everything_still_in_new() {
        let (_dir, manager) = manager();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        manager.subscriptions.subscribe(
            "relay.agent.*",
            Arc::new(move |_env| {
                count2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        for _ in 0..3 {
            write_and_index(&manager, &envelope("relay.agent.alice"));
        }
        manager.sweep(&reporter());

        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(manager.maildir.list_new(HASH).unwrap().is_empty());
    }
}
