//! labvm-watch — pod status watchers for newly created workloads.
//!
//! # Architecture
//!
//! ```text
//! WatcherRegistry
//!   ├── Per-workload background task
//!   │   ├── ClusterClient::watch_pods(app=<name>) → PodEventStream
//!   │   ├── PodWatcher: skip Pending, first settled phase → StatusEvent
//!   │   └── StatusNotifier::notify (at most once, best effort)
//!   ├── Optional PortForwarder (kubectl port-forward, after `running`)
//!   └── Daemon shutdown receiver forwarded into every task
//! ```
//!
//! Watchers are never retried: a stream that ends or fails before the pods
//! settle reports nothing.

pub mod forward;
pub mod notifier;
pub mod registry;
pub mod watcher;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use forward::{ForwardError, PortForwarder};
pub use notifier::{HttpNotifier, NotifyError, StatusNotifier};
pub use registry::WatcherRegistry;
pub use watcher::{PodWatcher, WatchOutcome, status_for};
