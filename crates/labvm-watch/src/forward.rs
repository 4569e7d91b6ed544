//! Port forwarding to running workloads.
//!
//! Runs `kubectl port-forward deployments/<name> <base_port + id>:<target>`
//! as a supervised child per workload. Children are killed when replaced
//! and on shutdown.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use labvm_core::config::PortForwardConfig;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("local port {base} + {workload_id} is out of range")]
    PortOutOfRange { base: u16, workload_id: i64 },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

struct ForwardSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Supervises one port-forward child process per workload.
#[derive(Clone)]
pub struct PortForwarder {
    config: PortForwardConfig,
    forwards: Arc<RwLock<HashMap<String, ForwardSlot>>>,
}

impl PortForwarder {
    pub fn new(config: PortForwardConfig) -> Self {
        Self {
            config,
            forwards: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Local port for a workload id.
    pub fn local_port(&self, workload_id: i64) -> Result<u16, ForwardError> {
        i64::from(self.config.base_port)
            .checked_add(workload_id)
            .and_then(|port| u16::try_from(port).ok())
            .filter(|port| *port != 0)
            .ok_or(ForwardError::PortOutOfRange {
                base: self.config.base_port,
                workload_id,
            })
    }

    /// Start forwarding to `vm_name`, replacing any existing forward for it.
    /// Returns the local port.
    pub async fn start(&self, vm_name: &str, workload_id: i64) -> Result<u16, ForwardError> {
        let local_port = self.local_port(workload_id)?;
        let target = format!("deployments/{vm_name}");
        let ports = format!("{local_port}:{}", self.config.target_port);

        let mut child = Command::new(&self.config.kubectl)
            .arg("port-forward")
            .arg(&target)
            .arg(&ports)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ForwardError::Spawn {
                program: self.config.kubectl.clone(),
                source,
            })?;

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let name = vm_name.to_string();
        let handle = tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) if status.success() => debug!(vm_name = %name, "port-forward exited"),
                    Ok(status) => warn!(vm_name = %name, %status, "port-forward exited with failure"),
                    Err(e) => warn!(vm_name = %name, error = %e, "port-forward wait failed"),
                },
                _ = shutdown_rx.changed() => {
                    if let Err(e) = child.kill().await {
                        warn!(vm_name = %name, error = %e, "failed to kill port-forward");
                    }
                    debug!(vm_name = %name, "port-forward stopped");
                }
            }
        });

        let mut forwards = self.forwards.write().await;
        if let Some(old) = forwards.insert(
            vm_name.to_string(),
            ForwardSlot {
                handle,
                shutdown_tx,
            },
        ) {
            let _ = old.shutdown_tx.send(true);
        }

        info!(%vm_name, local_port, target_port = self.config.target_port, "port-forward started");
        Ok(local_port)
    }

    /// Kill every child and wait for the supervisors to finish.
    pub async fn stop_all(&self) {
        let slots: Vec<(String, ForwardSlot)> = self.forwards.write().await.drain().collect();
        for (name, slot) in slots {
            let _ = slot.shutdown_tx.send(true);
            let _ = slot.handle.await;
            debug!(vm_name = %name, "port-forward stopped");
        }
    }

    /// Workload names with a live forward process.
    pub async fn active(&self) -> Vec<String> {
        let forwards = self.forwards.read().await;
        let mut names: Vec<String> = forwards
            .iter()
            .filter(|(_, slot)| !slot.handle.is_finished())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}
