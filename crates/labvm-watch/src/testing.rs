//! Test doubles for the status notifier.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use labvm_core::StatusEvent;

use crate::notifier::{NotifyError, StatusNotifier};

#[derive(Default)]
struct Recorded {
    events: Mutex<Vec<StatusEvent>>,
    attempts: AtomicUsize,
    changed: Notify,
}

/// Keeps every event it is handed. Clones share the same record.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    inner: Arc<Recorded>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts attempts but fails every delivery.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Successfully delivered events, in order.
    pub fn events(&self) -> Vec<StatusEvent> {
        self.inner
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn attempts(&self) -> usize {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` events were delivered, or `timeout`
    /// elapses. Returns whatever was recorded.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<StatusEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let changed = self.inner.changed.notified();
            let events = self.events();
            if events.len() >= count {
                return events;
            }
            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                return self.events();
            }
        }
    }
}

#[async_trait]
impl StatusNotifier for RecordingNotifier {
    async fn notify(&self, event: &StatusEvent) -> Result<(), NotifyError> {
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(NotifyError::Connect("recording notifier set to fail".to_string()));
        }
        self.inner
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        self.inner.changed.notify_waiters();
        Ok(())
    }
}
