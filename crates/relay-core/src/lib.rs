//! The relay publish pipeline: Maildir writes, the derived SQLite index,
//! access control, rate limiting, circuit breakers, backpressure, the
//! dead-letter queue, the in-process subscription table, the filesystem
//! watcher, and the adapter lifecycle, composed behind one `RelayCore`.

pub mod adapter;
pub mod backpressure;
pub mod config;
pub mod core;
pub mod dlq;
pub mod reporter;
pub mod subscription;
pub mod watcher;

pub use adapter::{AdapterContext, AdapterHost, AdapterRegistry, AdapterState, AdapterStatus, DeliveryResult, RelayAdapter};
pub use config::RelayConfig;
pub use core::{PublishOptions, PublishResult, RelayCore};
pub use dlq::DeadLetterQueue;
pub use reporter::{NullReporter, Reporter, StderrReporter};
pub use subscription::{Handler, SubscriptionRegistry, Unsubscribe};
pub use watcher::WatcherManager;
