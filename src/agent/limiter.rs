//! Bounds how many requests run against the local server at once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Outcome of admitting one request, decided at arrival
#[derive(Debug)]
pub enum Admission {
    /// A slot was free; the request may execute now
    Ready(OwnedSemaphorePermit),
    /// All slots busy; the request waits in the bounded queue
    Queued(QueueTicket),
    /// Slots and queue are full
    Overloaded,
}

pub struct ConcurrencyLimiter {
    permits: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
    queue_depth: usize,
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrent: usize, queue_depth: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            queued: Arc::new(AtomicUsize::new(0)),
            queue_depth,
        }
    }

    /// Decide admission synchronously so arrival order determines who runs,
    /// who waits and who is turned away.
    pub fn try_admit(&self) -> Admission {
        // Don't let a new arrival overtake requests already waiting
        if self.queued.load(Ordering::Acquire) == 0 {
            if let Ok(permit) = self.permits.clone().try_acquire_owned() {
                return Admission::Ready(permit);
            }
        }

        let depth = self.queue_depth;
        let reserved = self
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |q| {
                (q < depth).then_some(q + 1)
            })
            .is_ok();

        if reserved {
            Admission::Queued(QueueTicket {
                permits: self.permits.clone(),
                queued: self.queued.clone(),
            })
        } else {
            Admission::Overloaded
        }
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Stop handing out slots; queued tickets resolve to `None`
    pub fn close(&self) {
        self.permits.close();
    }
}

/// A reserved queue position. Dropping it frees the position.
#[derive(Debug)]
pub struct QueueTicket {
    permits: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
}

impl QueueTicket {
    /// Wait for a slot; `None` if the limiter was closed
    pub async fn wait(self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().acquire_owned().await.ok()
    }
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        self.queued.fetch_sub(1, Ordering::AcqRel);
    }
}
