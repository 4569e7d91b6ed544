//! labvm-queue — the request queue between the producer and the orchestrator.
//!
//! Backed by [redb](https://docs.rs/redb). Every lifecycle operation is
//! published under one fixed partition key and stored under a monotonically
//! increasing sequence number, so delivery order is total across all
//! workloads.
//!
//! # Delivery
//!
//! ```text
//! enqueue ──► MESSAGES[seq] ──pull──► Delivery ──ack────► removed
//!                                        │
//!                                        ├──nack───► stays at head, redelivered after backoff
//!                                        └──reject─► DEAD_LETTERS[seq]
//! ```
//!
//! A message is only removed by `ack` or `reject`, so anything in flight when
//! the process dies is delivered again on restart (at-least-once). The head
//! message blocks everything behind it while it backs off.

pub mod backoff;
pub mod error;
pub mod queue;
pub mod tables;
pub mod types;

pub use backoff::RedeliveryPolicy;
pub use error::{QueueError, QueueResult};
pub use queue::RequestQueue;
pub use types::*;
