//! Orchestrator — the single sequential consumer of the request queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use labvm_cluster::{ClusterClient, ClusterError, ManifestTemplate};
use labvm_core::{LifecycleOperation, OpCode};
use labvm_queue::{Delivery, QueueResult, Redelivery, RequestQueue};
use labvm_watch::WatcherRegistry;

use crate::error::{DispatchError, DispatchResult};

/// Pause after a failed `pull` before trying the queue again.
const PULL_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Effect of a successfully applied operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Created,
    /// Create of a workload that already exists (redelivery or duplicate).
    AlreadyExisted,
    Deleted,
    /// Delete of a workload that does not exist.
    AlreadyAbsent,
    /// Unknown opcode, dropped.
    Discarded,
}

/// How a delivery was settled with the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    Acked(Applied),
    /// Published under another partition key; acknowledged untouched.
    Ignored,
    Nacked(Redelivery),
    Rejected,
}

pub struct Orchestrator {
    queue: RequestQueue,
    cluster: Arc<dyn ClusterClient>,
    template: ManifestTemplate,
    watchers: Arc<WatcherRegistry>,
}

impl Orchestrator {
    pub fn new(
        queue: RequestQueue,
        cluster: Arc<dyn ClusterClient>,
        template: ManifestTemplate,
        watchers: Arc<WatcherRegistry>,
    ) -> Self {
        Self {
            queue,
            cluster,
            template,
            watchers,
        }
    }

    /// Consume the queue until `shutdown` fires, then stop every watcher.
    ///
    /// An operation already being applied when shutdown arrives is finished
    /// and settled first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(partition_key = %self.queue.partition_key(), "orchestrator started");

        while !*shutdown.borrow() {
            let pulled = tokio::select! {
                pulled = self.queue.pull() => pulled,
                _ = shutdown.changed() => break,
            };

            match pulled {
                Ok(delivery) => {
                    if let Err(e) = self.process(&delivery).await {
                        // Unsettled: the message stays at the head and is
                        // pulled again.
                        error!(seq = delivery.seq, error = %e, "failed to settle delivery");
                        if pause(&mut shutdown).await {
                            break;
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "queue pull failed");
                    if pause(&mut shutdown).await {
                        break;
                    }
                }
            }
        }

        info!("orchestrator shutting down");
        self.watchers.stop_all().await;
    }

    /// Apply one delivery and settle it with the queue.
    ///
    /// Only a failure to talk to the queue itself is returned.
    pub async fn process(&self, delivery: &Delivery) -> QueueResult<Settled> {
        let seq = delivery.seq;

        if delivery.key != self.queue.partition_key() {
            debug!(seq, key = %delivery.key, "message under foreign partition key, ignoring");
            self.queue.ack(delivery)?;
            return Ok(Settled::Ignored);
        }

        let op = match LifecycleOperation::from_wire(&delivery.payload) {
            Ok(op) => op,
            Err(e) => {
                warn!(seq, error = %e, "undecodable lifecycle operation, dead-lettering");
                self.queue
                    .reject(delivery, &format!("undecodable payload: {e}"))?;
                return Ok(Settled::Rejected);
            }
        };

        let vm_name = op.workload_name.as_str();
        match self.apply(&op).await {
            Ok(applied) => {
                self.queue.ack(delivery)?;
                debug!(seq, %vm_name, ?applied, "operation settled");
                Ok(Settled::Acked(applied))
            }
            Err(e) if e.is_permanent() => {
                error!(seq, %vm_name, opcode = %op.opcode, error = %e, "operation cannot be applied, dead-lettering");
                self.queue.reject(delivery, &e.to_string())?;
                Ok(Settled::Rejected)
            }
            Err(e) => {
                let redelivery = self.queue.nack(delivery, &e.to_string())?;
                if redelivery == Redelivery::DeadLettered {
                    error!(seq, %vm_name, error = %e, "operation dead-lettered after repeated failures");
                }
                Ok(Settled::Nacked(redelivery))
            }
        }
    }

    /// Apply a lifecycle operation to the cluster. Does not touch the queue.
    pub async fn apply(&self, op: &LifecycleOperation) -> DispatchResult<Applied> {
        let vm_name = op.workload_name.as_str();
        match op.opcode {
            OpCode::Create => {
                validate_name(vm_name)?;
                self.create(vm_name, op.workload_id).await
            }
            OpCode::Delete => {
                validate_name(vm_name)?;
                self.delete(vm_name).await
            }
            OpCode::Unknown(code) => {
                warn!(code, %vm_name, "unknown opcode, discarding");
                Ok(Applied::Discarded)
            }
        }
    }

    async fn create(&self, vm_name: &str, workload_id: i64) -> DispatchResult<Applied> {
        let manifest = self.template.render(vm_name)?;

        let applied = match self.cluster.create_workload(&manifest).await {
            Ok(handle) => {
                info!(%vm_name, uid = ?handle.uid, "workload created");
                Applied::Created
            }
            Err(ClusterError::AlreadyExists(_)) => {
                info!(%vm_name, "workload already exists, treating as created");
                Applied::AlreadyExisted
            }
            Err(e) => return Err(e.into()),
        };

        // Also on AlreadyExists: a watcher from before a restart is gone.
        self.watchers.start(vm_name, workload_id).await?;
        Ok(applied)
    }

    async fn delete(&self, vm_name: &str) -> DispatchResult<Applied> {
        match self.cluster.delete_workload(vm_name).await {
            Ok(()) => {
                info!(%vm_name, "workload deleted");
                Ok(Applied::Deleted)
            }
            Err(ClusterError::NotFound(_)) => {
                info!(%vm_name, "workload already absent, treating as deleted");
                Ok(Applied::AlreadyAbsent)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn validate_name(vm_name: &str) -> DispatchResult<()> {
    if vm_name.trim().is_empty() {
        return Err(DispatchError::InvalidOperation(
            "workload name is empty".to_string(),
        ));
    }
    Ok(())
}

/// Sleep for `PULL_ERROR_BACKOFF`. Returns true if shutdown fired meanwhile.
async fn pause(shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(PULL_ERROR_BACKOFF) => false,
        _ = shutdown.changed() => true,
    }
}
