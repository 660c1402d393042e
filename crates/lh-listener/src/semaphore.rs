//! ResizableSemaphore - admission gate whose capacity can change at runtime
//!
//! - Capacity may start at zero, nothing is admitted until it is raised
//! - Raising capacity wakes waiters immediately
//! - Lowering capacity never revokes issued permits, it only holds back new ones
//!   until enough permits are released to get back under the new capacity
//! - Setting the current capacity again is a no-op

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug)]
struct GateState {
    capacity: u32,
    issued: u32,
}

#[derive(Debug)]
pub struct ResizableSemaphore {
    state: Mutex<GateState>,
    available: Notify,
    resize_events: AtomicU64,
}

impl ResizableSemaphore {
    pub fn new(capacity: u32) -> Self {
        Self {
            state: Mutex::new(GateState { capacity, issued: 0 }),
            available: Notify::new(),
            resize_events: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.state.lock().capacity
    }

    /// Permits currently held
    pub fn issued(&self) -> u32 {
        self.state.lock().issued
    }

    /// Permits that could be issued right now
    pub fn available_permits(&self) -> u32 {
        let state = self.state.lock();
        state.capacity.saturating_sub(state.issued)
    }

    /// Number of times the capacity actually changed
    pub fn resize_events(&self) -> u64 {
        self.resize_events.load(Ordering::SeqCst)
    }

    /// Take a permit if one is available without waiting
    pub fn try_acquire_now(&self) -> bool {
        let mut state = self.state.lock();
        if state.issued < state.capacity {
            state.issued += 1;
            true
        } else {
            false
        }
    }

    /// Wait up to `timeout` for a permit. Returns false if none became available.
    pub async fn try_acquire(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register interest before checking so a release in between is not missed
            notified.as_mut().enable();

            if self.try_acquire_now() {
                return true;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_acquire_now();
            }
        }
    }

    /// Like [`try_acquire`](Self::try_acquire) but returns a permit that is
    /// released when dropped
    pub async fn try_acquire_owned(self: &Arc<Self>, timeout: Duration) -> Option<GatePermit> {
        if self.try_acquire(timeout).await {
            Some(GatePermit { gate: self.clone() })
        } else {
            None
        }
    }

    pub fn release(&self) {
        let has_room = {
            let mut state = self.state.lock();
            if state.issued == 0 {
                warn!("Permit released without a matching acquire");
                return;
            }
            state.issued -= 1;
            state.issued < state.capacity
        };

        if has_room {
            self.available.notify_one();
        }
    }

    pub fn set_capacity(&self, capacity: u32) {
        let previous = {
            let mut state = self.state.lock();
            if state.capacity == capacity {
                return;
            }
            std::mem::replace(&mut state.capacity, capacity)
        };

        self.resize_events.fetch_add(1, Ordering::SeqCst);
        debug!(previous, capacity, "Admission capacity changed");

        if capacity > previous {
            self.available.notify_waiters();
        }
    }
}

/// Permit released back to its gate on drop
#[derive(Debug)]
pub struct GatePermit {
    gate: Arc<ResizableSemaphore>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.gate.release();
    }
}
