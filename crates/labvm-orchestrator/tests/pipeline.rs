//! End-to-end pipeline tests: queue → orchestrator → cluster → watcher →
//! notifier, with the in-memory queue, the fake cluster and a recording
//! notifier.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use labvm_cluster::{ClusterClient, ClusterError, ClusterOp, FakeCluster, ManifestTemplate, PodPhase};
use labvm_core::{LifecycleOperation, WorkloadStatus};
use labvm_orchestrator::{Applied, Orchestrator};
use labvm_queue::{QueueOptions, RedeliveryPolicy, RequestQueue};
use labvm_watch::WatcherRegistry;
use labvm_watch::testing::RecordingNotifier;

const WAIT: Duration = Duration::from_secs(5);

struct Pipeline {
    queue: RequestQueue,
    cluster: FakeCluster,
    notifier: RecordingNotifier,
    watchers: Arc<WatcherRegistry>,
    orchestrator: Arc<Orchestrator>,
    shutdown_tx: watch::Sender<bool>,
}

impl Pipeline {
    fn new() -> Self {
        Self::with_template(ManifestTemplate::bundled().unwrap())
    }

    fn with_template(template: ManifestTemplate) -> Self {
        let options = QueueOptions {
            redelivery: RedeliveryPolicy {
                base: Duration::from_millis(20),
                max: Duration::from_millis(80),
                max_deliveries: None,
            },
            ..QueueOptions::default()
        };
        let queue = RequestQueue::open_in_memory(options).unwrap();
        let cluster = FakeCluster::new();
        let notifier = RecordingNotifier::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let watchers = Arc::new(WatcherRegistry::new(
            Arc::new(cluster.clone()),
            Arc::new(notifier.clone()),
            shutdown_rx,
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            queue.clone(),
            Arc::new(cluster.clone()),
            template,
            watchers.clone(),
        ));
        Self {
            queue,
            cluster,
            notifier,
            watchers,
            orchestrator,
            shutdown_tx,
        }
    }

    fn start(&self) -> JoinHandle<()> {
        let orchestrator = self.orchestrator.clone();
        let shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move { orchestrator.run(shutdown).await })
    }

    /// Wait until every queued message has been settled.
    async fn drain(&self) {
        tokio::time::timeout(WAIT, async {
            while self.queue.pending_len().unwrap() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("queue did not drain");
    }

    async fn stop(&self, handle: JoinHandle<()>) {
        self.shutdown_tx.send(true).unwrap();
        tokio::time::timeout(WAIT, handle)
            .await
            .expect("orchestrator did not stop")
            .unwrap();
    }

    fn creates_of(&self, name: &str) -> usize {
        self.cluster
            .ops()
            .iter()
            .filter(|op| **op == ClusterOp::Create(name.to_string()))
            .count()
    }
}

#[tokio::test]
async fn create_scenario_reports_running() {
    let p = Pipeline::new();
    let handle = p.start();

    p.queue.enqueue(&LifecycleOperation::create(7, "vm-abc")).unwrap();
    p.drain().await;
    assert_eq!(p.cluster.workloads(), vec!["vm-abc".to_string()]);
    assert!(p.watchers.is_watching("vm-abc").await);

    p.cluster.set_phase("vm-abc", PodPhase::Pending, "");
    p.cluster.set_phase("vm-abc", PodPhase::Running, "");

    let events = p.notifier.wait_for(1, WAIT).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].vm_name, "vm-abc");
    assert_eq!(events[0].status, WorkloadStatus::Running);

    p.stop(handle).await;
}

#[tokio::test]
async fn failed_pod_reports_error_with_message() {
    let p = Pipeline::new();
    let handle = p.start();

    p.queue.enqueue(&LifecycleOperation::create(7, "vm-abc")).unwrap();
    p.drain().await;
    p.cluster.set_phase("vm-abc", PodPhase::Failed, "ImagePullBackOff");

    let events = p.notifier.wait_for(1, WAIT).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, WorkloadStatus::Error);
    assert_eq!(events[0].message, "ImagePullBackOff");

    p.stop(handle).await;
}

#[tokio::test]
async fn notifier_fires_only_after_pending_and_at_most_once() {
    let p = Pipeline::new();
    let handle = p.start();

    p.queue.enqueue(&LifecycleOperation::create(7, "vm-abc")).unwrap();
    p.drain().await;

    p.cluster.set_phase("vm-abc", PodPhase::Pending, "");
    p.cluster.set_phase("vm-abc", PodPhase::Pending, "ContainerCreating");
    assert!(
        p.notifier.wait_for(1, Duration::from_millis(200)).await.is_empty(),
        "pending phases are never reported"
    );

    p.cluster.set_phase("vm-abc", PodPhase::Running, "");
    assert_eq!(p.notifier.wait_for(1, WAIT).await.len(), 1);

    p.cluster.set_phase("vm-abc", PodPhase::Failed, "OOMKilled");
    assert_eq!(
        p.notifier.wait_for(2, Duration::from_millis(200)).await.len(),
        1,
        "later phases are not reported"
    );

    p.stop(handle).await;
}

#[tokio::test]
async fn delete_scenario_removes_workload() {
    let p = Pipeline::new();
    p.cluster.insert_workload("vm-abc");
    let handle = p.start();

    p.queue.enqueue(&LifecycleOperation::delete(7, "vm-abc")).unwrap();
    p.drain().await;

    assert!(!p.cluster.contains("vm-abc"));
    assert!(p.queue.dead_letters().unwrap().is_empty());
    assert!(p.notifier.events().is_empty());

    p.stop(handle).await;
}

#[tokio::test]
async fn operations_apply_in_publish_order() {
    let p = Pipeline::new();

    p.queue.enqueue(&LifecycleOperation::create(1, "vm-a")).unwrap();
    p.queue.enqueue(&LifecycleOperation::create(2, "vm-b")).unwrap();
    p.queue.enqueue(&LifecycleOperation::delete(1, "vm-a")).unwrap();

    let handle = p.start();
    p.drain().await;

    assert_eq!(
        p.cluster.ops(),
        vec![
            ClusterOp::Create("vm-a".to_string()),
            ClusterOp::Watch("vm-a".to_string()),
            ClusterOp::Create("vm-b".to_string()),
            ClusterOp::Watch("vm-b".to_string()),
            ClusterOp::Delete("vm-a".to_string()),
        ]
    );
    assert_eq!(p.cluster.workloads(), vec!["vm-b".to_string()]);

    p.stop(handle).await;
}

#[tokio::test]
async fn double_create_yields_one_workload() {
    let p = Pipeline::new();
    let handle = p.start();

    p.queue.enqueue(&LifecycleOperation::create(7, "vm-abc")).unwrap();
    p.queue.enqueue(&LifecycleOperation::create(7, "vm-abc")).unwrap();
    p.drain().await;

    assert_eq!(p.creates_of("vm-abc"), 2);
    assert_eq!(p.cluster.workloads(), vec!["vm-abc".to_string()]);
    assert!(p.queue.dead_letters().unwrap().is_empty());
    assert_eq!(p.watchers.active().await, vec!["vm-abc".to_string()]);

    p.stop(handle).await;
}

#[tokio::test]
async fn apply_is_idempotent_under_redelivery() {
    let p = Pipeline::new();
    let create = LifecycleOperation::create(7, "vm-abc");
    let delete = LifecycleOperation::delete(7, "vm-abc");

    assert_eq!(p.orchestrator.apply(&create).await.unwrap(), Applied::Created);
    assert_eq!(
        p.orchestrator.apply(&create).await.unwrap(),
        Applied::AlreadyExisted
    );
    assert_eq!(p.cluster.workloads(), vec!["vm-abc".to_string()]);

    assert_eq!(p.orchestrator.apply(&delete).await.unwrap(), Applied::Deleted);
    assert_eq!(
        p.orchestrator.apply(&delete).await.unwrap(),
        Applied::AlreadyAbsent
    );
    assert!(p.cluster.workloads().is_empty());

    p.watchers.stop_all().await;
}

#[tokio::test]
async fn transient_failure_is_redelivered_and_blocks_later_operations() {
    let p = Pipeline::new();
    p.cluster
        .fail_next_create(ClusterError::Other("apiserver unavailable".to_string()));
    p.cluster
        .fail_next_create(ClusterError::Other("apiserver unavailable".to_string()));
    let handle = p.start();

    p.queue.enqueue(&LifecycleOperation::create(1, "vm-a")).unwrap();
    p.queue.enqueue(&LifecycleOperation::delete(1, "vm-a")).unwrap();
    p.drain().await;

    assert_eq!(p.creates_of("vm-a"), 3);
    // The delete waited behind the failing create.
    assert_eq!(
        p.cluster.ops().last(),
        Some(&ClusterOp::Delete("vm-a".to_string()))
    );
    assert!(!p.cluster.contains("vm-a"));
    assert!(p.queue.dead_letters().unwrap().is_empty());

    p.stop(handle).await;
}

#[tokio::test]
async fn malformed_template_does_not_stop_the_consumer() {
    let template = ManifestTemplate::parse("metadata: [ {{ vm_name }}\n").unwrap();
    let p = Pipeline::with_template(template);
    p.cluster.insert_workload("vm-old");
    let handle = p.start();

    p.queue.enqueue(&LifecycleOperation::create(1, "vm-new")).unwrap();
    p.queue.enqueue(&LifecycleOperation::delete(2, "vm-old")).unwrap();
    p.drain().await;

    let dead = p.queue.dead_letters().unwrap();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].payload.contains("vm-new"));
    assert!(dead[0].reason.contains("manifest"));
    assert!(!p.cluster.contains("vm-new"));
    assert!(!p.cluster.contains("vm-old"));

    p.stop(handle).await;
}

#[tokio::test]
async fn shutdown_stops_consumer_and_watchers() {
    let p = Pipeline::new();
    let handle = p.start();

    p.queue.enqueue(&LifecycleOperation::create(7, "vm-abc")).unwrap();
    p.drain().await;
    assert!(p.watchers.is_watching("vm-abc").await);

    p.stop(handle).await;
    assert!(p.watchers.active().await.is_empty());

    // Nothing is consumed after shutdown.
    p.queue.enqueue(&LifecycleOperation::delete(7, "vm-abc")).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(p.queue.pending_len().unwrap(), 1);
    assert!(p.cluster.contains("vm-abc"));
}

#[tokio::test]
async fn unacked_operation_is_redelivered_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.redb");
    let cluster = FakeCluster::new();

    {
        let queue = RequestQueue::open(&path, QueueOptions::default()).unwrap();
        queue.enqueue(&LifecycleOperation::create(7, "vm-abc")).unwrap();
        // Pulled, created, then the process dies before the ack.
        let delivery = queue.pull().await.unwrap();
        assert!(delivery.payload.contains("vm-abc"));
        let manifest = ManifestTemplate::bundled().unwrap().render("vm-abc").unwrap();
        cluster.create_workload(&manifest).await.unwrap();
    }

    let queue = RequestQueue::open(&path, QueueOptions::default()).unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let notifier = RecordingNotifier::new();
    let watchers = Arc::new(WatcherRegistry::new(
        Arc::new(cluster.clone()),
        Arc::new(notifier.clone()),
        shutdown_rx,
    ));
    let orchestrator = Orchestrator::new(
        queue.clone(),
        Arc::new(cluster.clone()),
        ManifestTemplate::bundled().unwrap(),
        watchers.clone(),
    );

    let delivery = queue.pull().await.unwrap();
    assert_eq!(delivery.attempt, 1);
    orchestrator.process(&delivery).await.unwrap();

    assert_eq!(cluster.workloads(), vec!["vm-abc".to_string()]);
    assert_eq!(queue.pending_len().unwrap(), 0);
    // The redelivered create re-attached a watcher.
    assert!(watchers.is_watching("vm-abc").await);

    cluster.set_phase("vm-abc", PodPhase::Running, "");
    assert_eq!(notifier.wait_for(1, WAIT).await.len(), 1);
    watchers.stop_all().await;
}
