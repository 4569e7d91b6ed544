//! labvm-orchestrator — the consumer side of the request queue.
//!
//! Pulls lifecycle operations one at a time, in publish order, and applies
//! them to the cluster:
//!
//! ```text
//! RequestQueue::pull ─► decode ─► Create: render manifest ─► create_workload ─► start watcher
//!                                 Delete: delete_workload (foreground)
//!                                 Unknown: discard
//!        ◄── ack (applied / idempotent no-op / discarded)
//!        ◄── nack (cluster or queue failure, redelivered after backoff)
//!        ◄── reject (bad payload or manifest, dead-lettered)
//! ```
//!
//! `AlreadyExists` on create and `NotFound` on delete count as success, so
//! redelivered operations converge.

pub mod consumer;
pub mod error;

pub use consumer::{Applied, Orchestrator, Settled};
pub use error::{DispatchError, DispatchResult};
