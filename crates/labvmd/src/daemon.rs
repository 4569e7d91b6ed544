//! `labvmd run` — wires the subsystems together and runs until Ctrl-C.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use labvm_cluster::{ClusterClient, KubeClusterClient, ManifestTemplate};
use labvm_core::LabConfig;
use labvm_orchestrator::Orchestrator;
use labvm_queue::{QueueOptions, RedeliveryPolicy, RequestQueue};
use labvm_watch::{HttpNotifier, PortForwarder, WatcherRegistry};

/// Load the template at `path`, or the bundled one.
pub fn load_template(path: Option<&Path>) -> anyhow::Result<ManifestTemplate> {
    let template = match path {
        Some(path) => ManifestTemplate::from_file(path)?,
        None => ManifestTemplate::bundled()?,
    };
    Ok(template)
}

pub async fn run(config: LabConfig, port_override: Option<u16>) -> anyhow::Result<()> {
    info!("labvm daemon starting");

    // ── Initialize subsystems ──────────────────────────────────

    // Request queue.
    if let Some(dir) = config.queue.path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let options = QueueOptions {
        partition_key: config.queue.partition_key.clone(),
        redelivery: RedeliveryPolicy::from_config(&config.queue)?,
    };
    let queue = RequestQueue::open(&config.queue.path, options)?;

    // Manifest template. Load failures are fatal: every create would fail.
    let template_path = config.cluster.template.as_path();
    let template = if template_path.exists() {
        load_template(Some(template_path))?
    } else {
        warn!(path = ?template_path, "template file not found, using bundled template");
        load_template(None)?
    };
    info!(path = ?template_path, "manifest template loaded");

    // Cluster client.
    let cluster: Arc<dyn ClusterClient> = Arc::new(KubeClusterClient::connect(&config.cluster).await?);

    // Status notifier.
    let notifier = Arc::new(HttpNotifier::new(
        &config.notifier.callback_url,
        config.notifier.timeout()?,
    )?);
    info!(url = %notifier.url(), "status notifier initialized");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Watcher registry.
    let mut registry = WatcherRegistry::new(cluster.clone(), notifier, shutdown_rx.clone());
    if config.port_forward.enabled {
        registry = registry.with_port_forwarder(PortForwarder::new(config.port_forward.clone()));
        info!(base_port = config.port_forward.base_port, "port forwarding enabled");
    }
    let watchers = Arc::new(registry);

    // ── Start background tasks ─────────────────────────────────

    let orchestrator = Orchestrator::new(queue.clone(), cluster, template, watchers.clone());
    let consumer_shutdown = shutdown_rx.clone();
    let consumer_handle = tokio::spawn(async move {
        orchestrator.run(consumer_shutdown).await;
    });

    // ── Start API server ───────────────────────────────────────

    let router = labvm_api::build_router(queue, watchers);
    let port = port_override.unwrap_or(config.api.port);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C, shutting down");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Wait for the consumer to settle its current delivery and stop watchers.
    let _ = consumer_handle.await;

    info!("labvm daemon stopped");
    Ok(())
}
