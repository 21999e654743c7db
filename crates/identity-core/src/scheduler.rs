//! Single-slot renewal timer.
//!
//! At most one timer is ever pending. Arming aborts the previous timer
//! before installing the new one, under the same lock, so two callbacks can
//! never both fire.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use tokio::task::JoinHandle;
use tracing::debug;

struct Pending {
    id: u64,
    handle: JoinHandle<()>,
    fires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Slot {
    pending: Mutex<Option<Pending>>,
    next_id: AtomicU64,
}

impl Slot {
    fn lock(&self) -> MutexGuard<'_, Option<Pending>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Clone, Default)]
pub struct RefreshScheduler {
    slot: Arc<Slot>,
}

impl RefreshScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` once after `delay`, replacing any pending timer.
    ///
    /// A zero or negative delay still defers `task` to a later tick; it is
    /// never run from inside `arm`. `now` is only used to report when the
    /// timer is due; a due time past the representable range reports as
    /// `DateTime::<Utc>::MAX_UTC`. Must be called from within a tokio runtime.
    pub fn arm<F>(&self, delay: Duration, now: DateTime<Utc>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let delay = delay.max(Duration::zero());
        let sleep_for = delay.to_std().unwrap_or_default();
        let id = self.slot.next_id.fetch_add(1, Ordering::Relaxed);

        let mut pending = self.slot.lock();
        if let Some(previous) = pending.take() {
            previous.handle.abort();
            debug!(timer = previous.id, "Replaced pending refresh timer");
        }

        let slot = Arc::downgrade(&self.slot);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(sleep_for).await;

            // Release the slot before running, so a task that re-arms does
            // not abort itself.
            if let Some(slot) = slot.upgrade() {
                let mut pending = slot.lock();
                if pending.as_ref().map(|p| p.id) == Some(id) {
                    *pending = None;
                }
            }

            debug!(timer = id, "Refresh timer fired");
            task.await;
        });

        *pending = Some(Pending {
            id,
            handle,
            fires_at: now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC),
        });
        debug!(timer = id, delay_ms = delay.num_milliseconds(), "Armed refresh timer");
    }

    /// Drop the pending timer without running it. Returns whether one was
    /// pending.
    pub fn cancel(&self) -> bool {
        match self.slot.lock().take() {
            Some(previous) => {
                previous.handle.abort();
                debug!(timer = previous.id, "Cancelled refresh timer");
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// When the pending timer is due, by the clock passed to `arm`.
    pub fn fires_at(&self) -> Option<DateTime<Utc>> {
        self.slot.lock().as_ref().map(|p| p.fires_at)
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.get_mut().ok().and_then(Option::take) {
            pending.handle.abort();
        }
    }
}
