//! Watcher registry — one supervised pod watcher task per workload name.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use labvm_cluster::{ClusterClient, ClusterResult, PodSelector};
use labvm_core::WorkloadStatus;

use crate::forward::PortForwarder;
use crate::notifier::StatusNotifier;
use crate::watcher::{PodWatcher, WatchOutcome};

/// Per-workload watcher state.
struct WatcherSlot {
    /// Distinguishes a replaced watcher from its successor.
    generation: u64,
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

type Slots = Arc<RwLock<HashMap<String, WatcherSlot>>>;

/// Starts, replaces and stops pod watchers.
///
/// A watcher removes itself from the registry when it finishes. Starting a
/// watcher for a name that already has one stops the old one first.
pub struct WatcherRegistry {
    cluster: Arc<dyn ClusterClient>,
    notifier: Arc<dyn StatusNotifier>,
    forwarder: Option<PortForwarder>,
    /// Daemon-wide shutdown, forwarded into every watcher.
    shutdown: watch::Receiver<bool>,
    watchers: Slots,
    next_generation: AtomicU64,
}

impl WatcherRegistry {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        notifier: Arc<dyn StatusNotifier>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            cluster,
            notifier,
            forwarder: None,
            shutdown,
            watchers: Arc::new(RwLock::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Forward a local port to each workload once it reports running.
    pub fn with_port_forwarder(mut self, forwarder: PortForwarder) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    /// Open a pod watch for `vm_name` and supervise it in a background task.
    ///
    /// Fails only if the watch cannot be opened.
    pub async fn start(&self, vm_name: &str, workload_id: i64) -> ClusterResult<()> {
        let events = self
            .cluster
            .watch_pods(&PodSelector::for_workload(vm_name))
            .await?;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let watcher = PodWatcher::new(vm_name, self.notifier.clone());
        let global = self.shutdown.clone();
        let forwarder = self.forwarder.clone();
        let watchers = self.watchers.clone();
        let name = vm_name.to_string();

        // Held across spawn and insert so the task cannot remove itself
        // before its slot exists.
        let mut slots = self.watchers.write().await;

        let handle = tokio::spawn(async move {
            let outcome = tokio::select! {
                outcome = watcher.run(events, shutdown_rx) => outcome,
                _ = shutdown_signalled(global) => WatchOutcome::Cancelled,
            };
            debug!(vm_name = %name, ?outcome, "pod watcher finished");

            if let (WatchOutcome::Reported(WorkloadStatus::Running), Some(forwarder)) =
                (outcome, forwarder)
            {
                if let Err(e) = forwarder.start(&name, workload_id).await {
                    warn!(vm_name = %name, error = %e, "port-forward not started");
                }
            }

            let mut slots = watchers.write().await;
            if slots.get(&name).is_some_and(|slot| slot.generation == generation) {
                slots.remove(&name);
            }
        });

        if let Some(old) = slots.insert(
            vm_name.to_string(),
            WatcherSlot {
                generation,
                handle,
                shutdown_tx,
            },
        ) {
            // Stop the old watcher if one was running.
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
            debug!(%vm_name, "previous pod watcher replaced");
        }

        info!(%vm_name, "pod watcher started");
        Ok(())
    }

    /// Stop every watcher and port-forward (graceful shutdown).
    pub async fn stop_all(&self) {
        {
            let mut slots = self.watchers.write().await;
            for (name, slot) in slots.drain() {
                let _ = slot.shutdown_tx.send(true);
                slot.handle.abort();
                debug!(vm_name = %name, "pod watcher stopped");
            }
        }
        if let Some(forwarder) = &self.forwarder {
            forwarder.stop_all().await;
        }
        info!("all pod watchers stopped");
    }

    /// Names with an active watcher, sorted.
    pub async fn active(&self) -> Vec<String> {
        let slots = self.watchers.read().await;
        let mut names: Vec<String> = slots.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn is_watching(&self, vm_name: &str) -> bool {
        self.watchers.read().await.contains_key(vm_name)
    }
}

/// Resolves once shutdown is requested or the sender is gone.
async fn shutdown_signalled(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
