//! In-memory `ClusterClient` for tests.
//!
//! Workloads are names in a map. Pod status is driven by the test through
//! `set_phase`, which is broadcast to every open watch on that workload.
//! Every call is recorded in an operation log.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use k8s_openapi::api::apps::v1::Deployment;
use tokio::sync::mpsc;

use crate::client::{ClusterClient, PodEvent, PodEventStream, PodPhase, PodSelector, WorkloadHandle};
use crate::error::{ClusterError, ClusterResult};

/// A recorded call against the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterOp {
    Create(String),
    Delete(String),
    Watch(String),
}

type EventSender = mpsc::UnboundedSender<ClusterResult<PodEvent>>;

#[derive(Default)]
struct FakeState {
    /// Workload name → last pod event, `None` until a phase is set.
    workloads: HashMap<String, Option<PodEvent>>,
    ops: Vec<ClusterOp>,
    watches: HashMap<String, Vec<EventSender>>,
    create_failures: VecDeque<ClusterError>,
    delete_failures: VecDeque<ClusterError>,
    watch_failures: VecDeque<ClusterError>,
    next_uid: u64,
}

/// Shared handle to an in-memory cluster. Clones see the same state.
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<FakeState>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `name` exist without going through `create_workload`.
    pub fn insert_workload(&self, name: &str) {
        self.lock().workloads.entry(name.to_string()).or_insert(None);
    }

    /// Set the pod phase of `name` and broadcast it to open watches.
    pub fn set_phase(&self, name: &str, phase: PodPhase, message: &str) {
        let event = PodEvent {
            pod: format!("{name}-pod"),
            phase,
            message: message.to_string(),
        };
        let mut state = self.lock();
        state
            .workloads
            .insert(name.to_string(), Some(event.clone()));
        if let Some(senders) = state.watches.get_mut(name) {
            senders.retain(|tx| tx.send(Ok(event.clone())).is_ok());
        }
    }

    /// Deliver a stream error to every open watch on `name`.
    pub fn push_watch_error(&self, name: &str, error: ClusterError) {
        let mut state = self.lock();
        if let Some(senders) = state.watches.get_mut(name) {
            senders.retain(|tx| tx.send(Err(error.clone())).is_ok());
        }
    }

    /// End every open watch on `name`.
    pub fn close_watches(&self, name: &str) {
        self.lock().watches.remove(name);
    }

    /// The next `create_workload` call fails with `error`.
    pub fn fail_next_create(&self, error: ClusterError) {
        self.lock().create_failures.push_back(error);
    }

    /// The next `delete_workload` call fails with `error`.
    pub fn fail_next_delete(&self, error: ClusterError) {
        self.lock().delete_failures.push_back(error);
    }

    /// The next `watch_pods` call fails with `error`.
    pub fn fail_next_watch(&self, error: ClusterError) {
        self.lock().watch_failures.push_back(error);
    }

    /// Existing workload names, sorted.
    pub fn workloads(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().workloads.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().workloads.contains_key(name)
    }

    /// Every call made so far, in order.
    pub fn ops(&self) -> Vec<ClusterOp> {
        self.lock().ops.clone()
    }

    /// Number of watches on `name` whose receiver is still alive.
    pub fn open_watches(&self, name: &str) -> usize {
        let mut state = self.lock();
        match state.watches.get_mut(name) {
            Some(senders) => {
                senders.retain(|tx| !tx.is_closed());
                senders.len()
            }
            None => 0,
        }
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn create_workload(&self, manifest: &Deployment) -> ClusterResult<WorkloadHandle> {
        let name = manifest.metadata.name.clone().unwrap_or_default();
        let mut state = self.lock();
        state.ops.push(ClusterOp::Create(name.clone()));

        if let Some(error) = state.create_failures.pop_front() {
            return Err(error);
        }
        if state.workloads.contains_key(&name) {
            return Err(ClusterError::AlreadyExists(name));
        }

        state.workloads.insert(name.clone(), None);
        state.next_uid += 1;
        Ok(WorkloadHandle {
            name,
            uid: Some(format!("fake-uid-{}", state.next_uid)),
        })
    }

    async fn delete_workload(&self, name: &str) -> ClusterResult<()> {
        let mut state = self.lock();
        state.ops.push(ClusterOp::Delete(name.to_string()));

        if let Some(error) = state.delete_failures.pop_front() {
            return Err(error);
        }
        if state.workloads.remove(name).is_none() {
            return Err(ClusterError::NotFound(name.to_string()));
        }
        // Pods are gone with the workload; their watches end.
        state.watches.remove(name);
        Ok(())
    }

    async fn watch_pods(&self, selector: &PodSelector) -> ClusterResult<PodEventStream> {
        let name = selector.value.clone();
        let mut state = self.lock();
        state.ops.push(ClusterOp::Watch(name.clone()));

        if let Some(error) = state.watch_failures.pop_front() {
            return Err(error);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(Some(current)) = state.workloads.get(&name) {
            let _ = tx.send(Ok(current.clone()));
        }
        state.watches.entry(name).or_default().push(tx);

        let events = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(events.boxed())
    }
}
