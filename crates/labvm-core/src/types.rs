//! Domain types shared by the queue, the orchestrator and the watchers.
//!
//! `LifecycleOperation` is the unit carried on the request queue. Its JSON
//! form is the wire format agreed with the producer:
//! `{"OpCode": 1, "Vmid": 7, "Vmname": "vm-abc"}`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fixed partition key every lifecycle operation is published under.
pub const DEFAULT_PARTITION_KEY: &str = "k8s";

// ── Lifecycle operations ──────────────────────────────────────────

/// Operation code of a queued lifecycle request.
///
/// Unrecognised wire values are kept as `Unknown` so that the consumer can
/// discard them with a warning instead of failing to decode the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum OpCode {
    Create,
    Delete,
    Unknown(i64),
}

impl From<i64> for OpCode {
    fn from(code: i64) -> Self {
        match code {
            1 => OpCode::Create,
            2 => OpCode::Delete,
            other => OpCode::Unknown(other),
        }
    }
}

impl From<OpCode> for i64 {
    fn from(op: OpCode) -> Self {
        match op {
            OpCode::Create => 1,
            OpCode::Delete => 2,
            OpCode::Unknown(code) => code,
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpCode::Create => f.write_str("create"),
            OpCode::Delete => f.write_str("delete"),
            OpCode::Unknown(code) => write!(f, "unknown({code})"),
        }
    }
}

/// A create or delete request for one workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleOperation {
    #[serde(rename = "OpCode")]
    pub opcode: OpCode,
    /// Record-store id of the workload. Never used to address the cluster.
    #[serde(rename = "Vmid")]
    pub workload_id: i64,
    /// Globally unique workload name; doubles as the cluster resource name.
    #[serde(rename = "Vmname")]
    pub workload_name: String,
}

impl LifecycleOperation {
    pub fn create(workload_id: i64, workload_name: impl Into<String>) -> Self {
        Self {
            opcode: OpCode::Create,
            workload_id,
            workload_name: workload_name.into(),
        }
    }

    pub fn delete(workload_id: i64, workload_name: impl Into<String>) -> Self {
        Self {
            opcode: OpCode::Delete,
            workload_id,
            workload_name: workload_name.into(),
        }
    }

    /// Encode to the queue wire format.
    pub fn to_wire(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decode from the queue wire format.
    pub fn from_wire(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }
}

// ── Workload status ───────────────────────────────────────────────

/// Coarse workload status as stored by the central record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadStatus {
    Pending,
    Creating,
    Running,
    Stopped,
    Error,
}

impl WorkloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadStatus::Pending => "pending",
            WorkloadStatus::Creating => "creating",
            WorkloadStatus::Running => "running",
            WorkloadStatus::Stopped => "stopped",
            WorkloadStatus::Error => "error",
        }
    }
}

impl fmt::Display for WorkloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of the status callback posted to the central record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub vm_name: String,
    pub status: WorkloadStatus,
    pub message: String,
    /// Serialized as RFC 3339.
    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    /// Build an event stamped with the current time.
    pub fn now(vm_name: &str, status: WorkloadStatus, message: &str) -> Self {
        Self {
            vm_name: vm_name.to_string(),
            status,
            message: message.to_string(),
            timestamp: Utc::now(),
        }
    }
}
