//! Pod status watcher — reports the first settled phase of a new workload.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use labvm_cluster::{PodEvent, PodEventStream, PodPhase};
use labvm_core::{StatusEvent, WorkloadStatus};

use crate::notifier::StatusNotifier;

/// How a watcher finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// A non-pending phase was seen and reported (delivery may still have
    /// failed; that is logged, not returned).
    Reported(WorkloadStatus),
    /// The event stream closed while the pods were still pending.
    StreamEnded,
    /// The event stream yielded an error.
    StreamFailed,
    /// Shutdown was signalled.
    Cancelled,
}

/// Status the record store gets for a settled pod phase.
pub fn status_for(phase: PodPhase) -> WorkloadStatus {
    match phase {
        PodPhase::Failed => WorkloadStatus::Error,
        _ => WorkloadStatus::Running,
    }
}

pub struct PodWatcher {
    vm_name: String,
    notifier: Arc<dyn StatusNotifier>,
}

impl PodWatcher {
    pub fn new(vm_name: &str, notifier: Arc<dyn StatusNotifier>) -> Self {
        Self {
            vm_name: vm_name.to_string(),
            notifier,
        }
    }

    /// Consume `events` until the first non-pending phase, notify once, and
    /// return. Nothing is reported when the stream ends early or shutdown
    /// fires first.
    pub async fn run(
        &self,
        mut events: PodEventStream,
        mut shutdown: watch::Receiver<bool>,
    ) -> WatchOutcome {
        let vm_name = self.vm_name.as_str();
        if *shutdown.borrow() {
            return WatchOutcome::Cancelled;
        }
        debug!(%vm_name, "pod watcher started");

        loop {
            tokio::select! {
                next = events.next() => match next {
                    Some(Ok(event)) if event.phase.is_pending() => {
                        debug!(%vm_name, pod = %event.pod, "pod still pending");
                    }
                    Some(Ok(event)) => {
                        let status = status_for(event.phase);
                        self.report(status, &event).await;
                        return WatchOutcome::Reported(status);
                    }
                    Some(Err(e)) => {
                        warn!(%vm_name, error = %e, "pod watch failed, no status reported");
                        return WatchOutcome::StreamFailed;
                    }
                    None => {
                        debug!(%vm_name, "pod watch closed before pods settled");
                        return WatchOutcome::StreamEnded;
                    }
                },
                _ = shutdown.changed() => {
                    debug!(%vm_name, "pod watcher cancelled");
                    return WatchOutcome::Cancelled;
                }
            }
        }
    }

    async fn report(&self, status: WorkloadStatus, event: &PodEvent) {
        let vm_name = self.vm_name.as_str();
        info!(%vm_name, pod = %event.pod, phase = %event.phase, %status, "pod settled");

        let status_event = StatusEvent::now(vm_name, status, &event.message);
        if let Err(e) = self.notifier.notify(&status_event).await {
            warn!(%vm_name, %status, error = %e, "status callback failed, dropped");
        }
    }
}
