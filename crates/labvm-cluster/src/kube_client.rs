//! `ClusterClient` over the Kubernetes API.
//!
//! Workloads are `apps/v1` Deployments in a single namespace; their pods are
//! watched by label selector through the runtime watcher, which re-lists and
//! resumes with backoff whenever the apiserver closes or expires a watch.

use async_trait::async_trait;
use futures_util::future::ready;
use futures_util::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::watcher::Event;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Client, Config};
use labvm_core::config::ClusterConfig;
use tracing::{debug, info, warn};

use crate::client::{ClusterClient, PodEvent, PodEventStream, PodPhase, PodSelector, WorkloadHandle};
use crate::error::{ClusterError, ClusterResult};

/// Production cluster client.
///
/// Cheap to clone; the underlying `kube::Client` is shared by the consumer
/// and every watcher.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    namespace: String,
}

impl KubeClusterClient {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
        }
    }

    /// Build a client from the configured kubeconfig, or from the
    /// environment (in-cluster service account, then `$KUBECONFIG` /
    /// `~/.kube/config`).
    pub async fn connect(config: &ClusterConfig) -> ClusterResult<Self> {
        let namespace = config.namespace.as_str();
        let client = match config.kubeconfig.as_deref() {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)
                    .map_err(|e| ClusterError::Connect(format!("{}: {e}", path.display())))?;
                let config =
                    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                        .await
                        .map_err(|e| ClusterError::Connect(e.to_string()))?;
                Client::try_from(config).map_err(|e| ClusterError::Connect(e.to_string()))?
            }
            None => Client::try_default()
                .await
                .map_err(|e| ClusterError::Connect(e.to_string()))?,
        };
        info!(%namespace, kubeconfig = ?config.kubeconfig, "cluster client connected");
        Ok(Self::new(client, namespace))
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn create_workload(&self, manifest: &Deployment) -> ClusterResult<WorkloadHandle> {
        let name = manifest.metadata.name.clone().unwrap_or_default();
        let created = self
            .deployments()
            .create(&PostParams::default(), manifest)
            .await
            .map_err(|e| classify(e, &name))?;
        debug!(vm_name = %name, namespace = %self.namespace, "deployment created");
        Ok(WorkloadHandle {
            name: created.metadata.name.unwrap_or(name),
            uid: created.metadata.uid,
        })
    }

    async fn delete_workload(&self, name: &str) -> ClusterResult<()> {
        self.deployments()
            .delete(name, &DeleteParams::foreground())
            .await
            .map_err(|e| classify(e, name))?;
        debug!(vm_name = %name, namespace = %self.namespace, "deployment delete accepted");
        Ok(())
    }

    async fn watch_pods(&self, selector: &PodSelector) -> ClusterResult<PodEventStream> {
        let label_selector = selector.to_string();
        // The runtime watcher retries forever; an unreachable apiserver or a
        // forbidden namespace must fail here instead.
        self.pods()
            .list(&ListParams::default().labels(&label_selector).limit(1))
            .await
            .map_err(|e| classify(e, &selector.value))?;

        let events = watcher(
            self.pods(),
            watcher::Config::default().labels(&label_selector),
        )
        .default_backoff();

        let deployments = self.deployments();
        let name = selector.value.clone();
        let workload_gone = move || {
            let deployments = deployments.clone();
            let name = name.clone();
            async move {
                match deployments.get_opt(&name).await {
                    Ok(Some(deployment)) => deployment.metadata.deletion_timestamp.is_some(),
                    Ok(None) => true,
                    Err(e) => {
                        warn!(vm_name = %name, error = %e, "workload lookup failed");
                        false
                    }
                }
            }
        };
        Ok(pod_events(events, workload_gone).boxed())
    }
}

/// What a watcher event means for the pod event stream.
enum Step {
    Emit(PodEvent),
    Skip,
    End,
}

/// Translate runtime watcher events into pod events.
///
/// A deleted pod ends the stream only once `workload_gone` confirms the
/// Deployment is missing or terminating; a replaced pod is skipped. Watch
/// errors are logged and skipped while the watcher re-lists.
fn pod_events<S, F, Fut>(
    events: S,
    workload_gone: F,
) -> impl Stream<Item = ClusterResult<PodEvent>> + Send + 'static
where
    S: Stream<Item = Result<Event<Pod>, watcher::Error>> + Send + 'static,
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    events
        .then(move |event| {
            let gone = matches!(event, Ok(Event::Delete(_))).then(|| workload_gone());
            async move {
                match (event, gone) {
                    (Ok(Event::Apply(pod) | Event::InitApply(pod)), _) => {
                        Step::Emit(pod_event(&pod))
                    }
                    (Ok(Event::Delete(pod)), Some(gone)) => {
                        if gone.await {
                            Step::End
                        } else {
                            debug!(pod = ?pod.metadata.name, "pod deleted, workload still present");
                            Step::Skip
                        }
                    }
                    (Ok(_), _) => Step::Skip,
                    (Err(e), _) => {
                        warn!(error = %e, "pod watch interrupted, resuming");
                        Step::Skip
                    }
                }
            }
        })
        .take_while(|step| ready(!matches!(step, Step::End)))
        .filter_map(|step| {
            ready(match step {
                Step::Emit(event) => Some(Ok(event)),
                Step::Skip | Step::End => None,
            })
        })
}

fn pod_event(pod: &Pod) -> PodEvent {
    let status = pod.status.as_ref();
    PodEvent {
        pod: pod.metadata.name.clone().unwrap_or_default(),
        phase: PodPhase::from_status(status.and_then(|s| s.phase.as_deref())),
        message: status.and_then(|s| s.message.clone()).unwrap_or_default(),
    }
}

/// Tag a kube error by API status code.
fn classify(err: kube::Error, name: &str) -> ClusterError {
    match err {
        kube::Error::Api(status) if status.code == 409 => {
            ClusterError::AlreadyExists(name.to_string())
        }
        kube::Error::Api(status) if status.code == 404 => ClusterError::NotFound(name.to_string()),
        other => ClusterError::Other(other.to_string()),
    }
}
