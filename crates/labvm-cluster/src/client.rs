//! The `ClusterClient` seam and the pod event types it streams.

use std::fmt;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use k8s_openapi::api::apps::v1::Deployment;

use crate::error::ClusterResult;

/// Label every workload's pods carry: `app=<workload name>`.
pub const WORKLOAD_LABEL: &str = "app";

/// Stream of pod events for one selector. Ends when the control plane
/// closes the watch or the watched pods are deleted.
pub type PodEventStream = BoxStream<'static, ClusterResult<PodEvent>>;

/// Handle returned by a successful create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadHandle {
    pub name: String,
    pub uid: Option<String>,
}

/// Equality label selector for the pods of one workload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PodSelector {
    pub label: String,
    pub value: String,
}

impl PodSelector {
    /// Selector matching the pods of the workload `name`.
    pub fn for_workload(name: &str) -> Self {
        Self {
            label: WORKLOAD_LABEL.to_string(),
            value: name.to_string(),
        }
    }
}

impl fmt::Display for PodSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.label, self.value)
    }
}

/// Pod lifecycle phase as reported by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    /// Parse the `status.phase` string. A pod without a phase yet is pending.
    pub fn from_status(phase: Option<&str>) -> Self {
        match phase {
            None | Some("Pending") => PodPhase::Pending,
            Some("Running") => PodPhase::Running,
            Some("Succeeded") => PodPhase::Succeeded,
            Some("Failed") => PodPhase::Failed,
            Some(_) => PodPhase::Unknown,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, PodPhase::Pending)
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PodPhase::Pending => "Pending",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
            PodPhase::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// One observed pod state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodEvent {
    /// Pod name (not the workload name).
    pub pod: String,
    pub phase: PodPhase,
    /// `status.message`, empty when the control plane gave none.
    pub message: String,
}

/// Operations the orchestrator needs from the cluster control plane.
///
/// Implementations do not retry. Conflicts and missing resources must be
/// reported as `ClusterError::AlreadyExists` / `ClusterError::NotFound`.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Create the workload described by `manifest`.
    async fn create_workload(&self, manifest: &Deployment) -> ClusterResult<WorkloadHandle>;

    /// Delete the workload `name`. Child pods are torn down before the
    /// delete completes (foreground propagation).
    async fn delete_workload(&self, name: &str) -> ClusterResult<()>;

    /// Open a watch on the pods matching `selector`. Existing pods are
    /// reported first.
    async fn watch_pods(&self, selector: &PodSelector) -> ClusterResult<PodEventStream>;
}
