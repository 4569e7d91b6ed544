//! RequestQueue — redb-backed lifecycle operation queue.
//!
//! One producer side (`enqueue` / `publish`) and one logical consumer
//! (`pull` + `ack` / `nack` / `reject`). Messages are JSON-serialized into
//! redb's `&[u8]` value columns under a `u64` sequence key. The queue
//! supports both on-disk and in-memory backends (the latter for testing).

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use labvm_core::LifecycleOperation;

use crate::error::{QueueError, QueueResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `QueueError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| QueueError::$variant(e.to_string())
    };
}

/// Redelivery bookkeeping for a message that failed at least once.
#[derive(Debug, Clone, Copy)]
struct RetryState {
    failures: u32,
    not_before: Instant,
}

/// Durable FIFO queue shared by the ingress API (producer) and the
/// orchestrator consumer.
///
/// `Clone` + `Send` + `Sync`; clones share the same database and wake-up
/// signal.
#[derive(Clone)]
pub struct RequestQueue {
    db: Arc<Database>,
    options: Arc<QueueOptions>,
    retries: Arc<Mutex<HashMap<u64, RetryState>>>,
    ready: Arc<Notify>,
}

impl RequestQueue {
    /// Open (or create) a persistent queue at the given path.
    pub fn open(path: &Path, options: QueueOptions) -> QueueResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let queue = Self::from_database(db, options)?;
        info!(?path, pending = queue.pending_len()?, "request queue opened");
        Ok(queue)
    }

    /// Create an ephemeral in-memory queue (for testing).
    pub fn open_in_memory(options: QueueOptions) -> QueueResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let queue = Self::from_database(db, options)?;
        debug!("in-memory request queue opened");
        Ok(queue)
    }

    fn from_database(db: Database, options: QueueOptions) -> QueueResult<Self> {
        let queue = Self {
            db: Arc::new(db),
            options: Arc::new(options),
            retries: Arc::new(Mutex::new(HashMap::new())),
            ready: Arc::new(Notify::new()),
        };
        queue.ensure_tables()?;
        Ok(queue)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> QueueResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(MESSAGES).map_err(map_err!(Table))?;
        txn.open_table(DEAD_LETTERS).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// The partition key this queue publishes under.
    pub fn partition_key(&self) -> &str {
        &self.options.partition_key
    }

    // ── Producer ───────────────────────────────────────────────────

    /// Publish a lifecycle operation under the partition key.
    ///
    /// Durable once this returns `Ok`. An `Err` means nothing was stored and
    /// the caller must abort whatever it was about to commit.
    pub fn enqueue(&self, op: &LifecycleOperation) -> QueueResult<u64> {
        let payload = op.to_wire().map_err(map_err!(Serialize))?;
        let seq = self.publish(&self.options.partition_key, &payload)?;
        info!(
            seq,
            opcode = %op.opcode,
            vm_name = %op.workload_name,
            "lifecycle operation enqueued"
        );
        Ok(seq)
    }

    /// Publish a raw payload under an arbitrary key.
    pub fn publish(&self, key: &str, payload: &str) -> QueueResult<u64> {
        let message = QueueMessage {
            key: key.to_string(),
            payload: payload.to_string(),
            enqueued_at: epoch_secs(),
        };
        let value = serde_json::to_vec(&message).map_err(map_err!(Serialize))?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let seq;
        {
            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
            seq = meta
                .get(NEXT_SEQ)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(1);
            let next = seq
                .checked_add(1)
                .ok_or_else(|| QueueError::Write("sequence numbers exhausted".to_string()))?;
            meta.insert(NEXT_SEQ, next).map_err(map_err!(Write))?;

            let mut messages = txn.open_table(MESSAGES).map_err(map_err!(Table))?;
            messages
                .insert(seq, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;

        self.ready.notify_one();
        debug!(seq, %key, "message published");
        Ok(seq)
    }

    // ── Consumer ───────────────────────────────────────────────────

    /// Wait for the head message and hand it out.
    ///
    /// Suspends while the queue is empty or while the head is backing off
    /// after a `nack`. The returned delivery stays in the queue until it is
    /// `ack`ed or `reject`ed; pulling again without settling it yields the
    /// same message.
    pub async fn pull(&self) -> QueueResult<Delivery> {
        loop {
            let Some((seq, raw)) = self.head()? else {
                self.ready.notified().await;
                continue;
            };

            let message: QueueMessage = match serde_json::from_slice(&raw) {
                Ok(message) => message,
                Err(e) => {
                    warn!(seq, error = %e, "corrupt queue record, dead-lettering");
                    self.dead_letter_raw(seq, &raw, &format!("corrupt record: {e}"))?;
                    continue;
                }
            };

            let retry = self.retries().get(&seq).copied();
            if let Some(retry) = retry {
                if retry.not_before > Instant::now() {
                    // A publish can't overtake the head, but wake anyway so a
                    // settle from another handle is noticed.
                    tokio::select! {
                        _ = tokio::time::sleep_until(retry.not_before) => {}
                        _ = self.ready.notified() => {}
                    }
                    continue;
                }
            }

            let attempt = retry.map_or(1, |r| r.failures + 1);
            debug!(seq, attempt, "message delivered");
            return Ok(Delivery {
                seq,
                key: message.key,
                payload: message.payload,
                attempt,
            });
        }
    }

    /// Acknowledge a delivery: the operation is applied (or was a no-op).
    ///
    /// Returns false if the message was already settled.
    pub fn ack(&self, delivery: &Delivery) -> QueueResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut messages = txn.open_table(MESSAGES).map_err(map_err!(Table))?;
            existed = messages
                .remove(delivery.seq)
                .map_err(map_err!(Write))?
                .is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        self.retries().remove(&delivery.seq);
        self.ready.notify_one();
        debug!(seq = delivery.seq, existed, "message acknowledged");
        Ok(existed)
    }

    /// Negative-acknowledge a delivery after a transient failure.
    ///
    /// The message stays at the head and is redelivered after the policy's
    /// backoff, unless `max_deliveries` is exhausted, in which case it is
    /// dead-lettered.
    pub fn nack(&self, delivery: &Delivery, reason: &str) -> QueueResult<Redelivery> {
        let policy = self.options.redelivery;
        let failures = {
            let retries = self.retries();
            retries.get(&delivery.seq).map_or(0, |r| r.failures) + 1
        };

        if policy.exhausted(failures) {
            let reason = format!("gave up after {failures} deliveries: {reason}");
            self.move_to_dead_letters(delivery.seq, &reason, failures)?;
            return Ok(Redelivery::DeadLettered);
        }

        let delay = policy.delay_for(failures);
        self.retries().insert(
            delivery.seq,
            RetryState {
                failures,
                not_before: Instant::now() + delay,
            },
        );
        warn!(
            seq = delivery.seq,
            attempt = failures,
            delay_ms = delay.as_millis() as u64,
            %reason,
            "delivery failed, scheduling redelivery"
        );
        Ok(Redelivery::Scheduled {
            attempt: failures,
            delay,
        })
    }

    /// Permanently fail a delivery: move it to the dead-letter table.
    pub fn reject(&self, delivery: &Delivery, reason: &str) -> QueueResult<()> {
        let failures = self
            .retries()
            .get(&delivery.seq)
            .map_or(0, |r| r.failures)
            + 1;
        self.move_to_dead_letters(delivery.seq, reason, failures)
    }

    // ── Introspection ──────────────────────────────────────────────

    /// Messages not yet settled, in delivery order.
    pub fn pending(&self) -> QueueResult<Vec<PendingMessage>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(MESSAGES).map_err(map_err!(Table))?;
        let retries = self.retries();
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let seq = key.value();
            let message: QueueMessage =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(PendingMessage {
                seq,
                key: message.key,
                payload: message.payload,
                enqueued_at: message.enqueued_at,
                failed_attempts: retries.get(&seq).map_or(0, |r| r.failures),
            });
        }
        Ok(results)
    }

    /// Number of messages not yet settled.
    pub fn pending_len(&self) -> QueueResult<usize> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(MESSAGES).map_err(map_err!(Table))?;
        let mut count = 0;
        for entry in table.iter().map_err(map_err!(Read))? {
            entry.map_err(map_err!(Read))?;
            count += 1;
        }
        Ok(count)
    }

    /// All dead letters, oldest first.
    pub fn dead_letters(&self) -> QueueResult<Vec<DeadLetter>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEAD_LETTERS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let letter: DeadLetter =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(letter);
        }
        Ok(results)
    }

    // ── Internals ──────────────────────────────────────────────────

    fn retries(&self) -> MutexGuard<'_, HashMap<u64, RetryState>> {
        self.retries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lowest-sequence message, raw.
    fn head(&self) -> QueueResult<Option<(u64, Vec<u8>)>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(MESSAGES).map_err(map_err!(Table))?;
        let first = table.first().map_err(map_err!(Read))?;
        Ok(first.map(|(key, value)| (key.value(), value.value().to_vec())))
    }

    fn move_to_dead_letters(&self, seq: u64, reason: &str, attempts: u32) -> QueueResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut messages = txn.open_table(MESSAGES).map_err(map_err!(Table))?;
            let raw = messages
                .remove(seq)
                .map_err(map_err!(Write))?
                .map(|guard| guard.value().to_vec())
                .ok_or(QueueError::NotFound(seq))?;
            let message: QueueMessage =
                serde_json::from_slice(&raw).map_err(map_err!(Deserialize))?;

            let letter = DeadLetter {
                seq,
                key: message.key,
                payload: message.payload,
                reason: reason.to_string(),
                attempts,
                enqueued_at: message.enqueued_at,
                rejected_at: epoch_secs(),
            };
            let value = serde_json::to_vec(&letter).map_err(map_err!(Serialize))?;
            let mut dead = txn.open_table(DEAD_LETTERS).map_err(map_err!(Table))?;
            dead.insert(seq, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;

        self.retries().remove(&seq);
        self.ready.notify_one();
        warn!(seq, %reason, "message dead-lettered");
        Ok(())
    }

    /// Dead-letter a record whose envelope can't be decoded.
    fn dead_letter_raw(&self, seq: u64, raw: &[u8], reason: &str) -> QueueResult<()> {
        let letter = DeadLetter {
            seq,
            key: String::new(),
            payload: String::from_utf8_lossy(raw).into_owned(),
            reason: reason.to_string(),
            attempts: 0,
            enqueued_at: 0,
            rejected_at: epoch_secs(),
        };
        let value = serde_json::to_vec(&letter).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut messages = txn.open_table(MESSAGES).map_err(map_err!(Table))?;
            messages.remove(seq).map_err(map_err!(Write))?;
            let mut dead = txn.open_table(DEAD_LETTERS).map_err(map_err!(Table))?;
            dead.insert(seq, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
