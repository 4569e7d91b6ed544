//! labvm-api — ingress API for the request queue.
//!
//! The producer (the central record store) publishes lifecycle operations
//! here after committing its own record. Operators can inspect what is
//! still queued, what was dead-lettered, and which workloads are watched.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/operations` | Publish a lifecycle operation (wire format) |
//! | GET | `/api/v1/operations` | List unsettled operations |
//! | GET | `/api/v1/dead-letters` | List dead-lettered operations |
//! | GET | `/api/v1/watchers` | List workloads with an active pod watcher |
//! | GET | `/healthz` | Liveness |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use labvm_queue::RequestQueue;
use labvm_watch::WatcherRegistry;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub queue: RequestQueue,
    pub watchers: Arc<WatcherRegistry>,
}

/// Build the complete API router.
pub fn build_router(queue: RequestQueue, watchers: Arc<WatcherRegistry>) -> Router {
    let api_state = ApiState { queue, watchers };

    let api_routes = Router::new()
        .route(
            "/operations",
            get(handlers::list_operations).post(handlers::publish_operation),
        )
        .route("/dead-letters", get(handlers::list_dead_letters))
        .route("/watchers", get(handlers::list_watchers))
        .with_state(api_state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
}
