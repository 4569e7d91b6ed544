//! labvm-cluster — the orchestrator's view of the cluster control plane.
//!
//! # Components
//!
//! - **`client`** — `ClusterClient` trait: create a workload, delete it with
//!   foreground propagation, watch its pods
//! - **`kube_client`** — `KubeClusterClient`, the production implementation
//! - **`template`** — renders the Deployment manifest for a workload name
//! - **`fake`** — in-memory cluster for tests (feature `test-utils`)
//!
//! Errors are classified by API status (`AlreadyExists`, `NotFound`,
//! `Other`) so callers can treat the first two as idempotent no-ops without
//! inspecting error text. Nothing here retries.

pub mod client;
pub mod error;
pub mod kube_client;
pub mod template;

#[cfg(any(test, feature = "test-utils"))]
pub mod fake;

pub use client::{ClusterClient, PodEvent, PodEventStream, PodPhase, PodSelector, WorkloadHandle};
pub use error::{ClusterError, ClusterResult, TemplateError};
pub use kube_client::KubeClusterClient;
pub use template::ManifestTemplate;

#[cfg(any(test, feature = "test-utils"))]
pub use fake::{ClusterOp, FakeCluster};

pub use k8s_openapi::api::apps::v1::Deployment;
