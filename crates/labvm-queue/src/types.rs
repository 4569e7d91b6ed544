//! Records stored in, and handed out by, the request queue.

use serde::{Deserialize, Serialize};

use labvm_core::DEFAULT_PARTITION_KEY;

use crate::backoff::RedeliveryPolicy;

/// A published message as persisted in the `MESSAGES` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Partition key the message was published under.
    pub key: String,
    /// Wire-format payload (JSON `LifecycleOperation`).
    pub payload: String,
    /// Unix timestamp (seconds) of the publish.
    pub enqueued_at: u64,
}

/// A message handed to the consumer by `pull`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub seq: u64,
    pub key: String,
    pub payload: String,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
}

/// A message still waiting to be acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingMessage {
    pub seq: u64,
    pub key: String,
    pub payload: String,
    pub enqueued_at: u64,
    /// Failed deliveries so far (in this process).
    pub failed_attempts: u32,
}

/// A message moved off the delivery path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub seq: u64,
    pub key: String,
    pub payload: String,
    pub reason: String,
    pub attempts: u32,
    pub enqueued_at: u64,
    pub rejected_at: u64,
}

/// What `nack` decided for a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redelivery {
    /// The message will be delivered again after `delay`.
    Scheduled {
        attempt: u32,
        delay: std::time::Duration,
    },
    /// `max_deliveries` was reached; the message is now a dead letter.
    DeadLettered,
}

/// Construction options for a `RequestQueue`.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub partition_key: String,
    pub redelivery: RedeliveryPolicy,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            partition_key: DEFAULT_PARTITION_KEY.to_string(),
            redelivery: RedeliveryPolicy::default(),
        }
    }
}
