//! Admission control for the worker pool.
//!
//! At most `pool_size` requests build or run at once. Up to `max_queue_depth`
//! further requests may wait for a slot, each for at most `queue_wait`.
//! Anything beyond either bound is rejected with `ResourceExhaustion`.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::backend::CancelHandle;
use crate::error::{Error, Result};

/// Bounded pool of execution slots with a bounded wait queue.
#[derive(Debug)]
pub struct AdmissionPool {
    permits: Arc<Semaphore>,
    size: usize,
    waiting: AtomicUsize,
    max_queue_depth: usize,
    queue_wait: Duration,
}

/// A held pool slot. Released on drop.
#[derive(Debug)]
pub struct PoolSlot {
    _permit: OwnedSemaphorePermit,
}

/// Decrements the waiting counter however the wait ends.
struct Waiting<'a>(&'a AtomicUsize);

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AdmissionPool {
    pub fn new(size: usize, max_queue_depth: usize, queue_wait: Duration) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
            waiting: AtomicUsize::new(0),
            max_queue_depth,
            queue_wait,
        }
    }

    /// Acquire a slot, waiting in the queue if the pool is busy.
    pub async fn acquire(&self, cancel: &CancelHandle) -> Result<PoolSlot> {
        if let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() {
            return Ok(PoolSlot { _permit: permit });
        }

        let queued = self.waiting.fetch_add(1, Ordering::SeqCst);
        let _waiting = Waiting(&self.waiting);
        if queued >= self.max_queue_depth {
            return Err(Error::ResourceExhaustion(format!(
                "pool of {} busy and {} requests already queued",
                self.size, queued
            )));
        }

        tracing::debug!(queued = queued + 1, "waiting for a pool slot");

        tokio::select! {
            permit = tokio::time::timeout(self.queue_wait, Arc::clone(&self.permits).acquire_owned()) => {
                match permit {
                    Ok(Ok(permit)) => Ok(PoolSlot { _permit: permit }),
                    Ok(Err(_)) => Err(Error::ResourceExhaustion("pool is closed".to_string())),
                    Err(_) => Err(Error::ResourceExhaustion(format!(
                        "no pool slot freed within {}ms",
                        self.queue_wait.as_millis()
                    ))),
                }
            }
            _ = cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots currently held.
    pub fn in_use(&self) -> usize {
        self.size - self.permits.available_permits()
    }

    /// Requests currently waiting for a slot.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Refuse new waiters and wake current ones with `ResourceExhaustion`.
    pub fn close(&self) {
        self.permits.close();
    }
}
