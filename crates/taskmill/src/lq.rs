//! Per-worker local queue: SPSC ring with a yield watermark.

use crate::config::LQ_YIELD_RESERVE_PCT;
use crate::error::KernelError;
use crate::task::Task;
use parking_lot::Mutex;
use ringcore::SpscRing;

/// A worker's local queue.
///
/// The top 25% of capacity is reserved for yield re-queues: a normal push
/// fails at the watermark so a worker that yields tasks into its own queue
/// cannot be livelocked by external producers filling it first.
///
/// The backing ring is SPSC. Pops are performed only by the owning worker
/// (crate-internal discipline), which is the single-consumer contract.
/// Pushes can arrive from any thread through the scheduler, so the producer
/// side is serialized by a short mutex; the pop path stays lock-free.
pub struct LocalQueue {
    ring: SpscRing<Task>,
    push_lock: Mutex<()>,
    watermark: u32,
}

impl LocalQueue {
    pub fn new(capacity: u32) -> Self {
        Self {
            ring: SpscRing::with_capacity(capacity),
            push_lock: Mutex::new(()),
            watermark: capacity - capacity * LQ_YIELD_RESERVE_PCT / 100,
        }
    }

    /// Normal push; fails at or above the yield watermark.
    pub fn push(&self, task: Task) -> Result<(), KernelError> {
        let _guard = self.push_lock.lock();
        if self.ring.len() >= self.watermark {
            return Err(KernelError::Full);
        }
        // SAFETY: push_lock serializes producers.
        if unsafe { self.ring.push(task) } {
            Ok(())
        } else {
            Err(KernelError::Full)
        }
    }

    /// Yield push; may use the full capacity including the reserve.
    pub fn push_yield(&self, task: Task) -> Result<(), KernelError> {
        let _guard = self.push_lock.lock();
        // SAFETY: push_lock serializes producers.
        if unsafe { self.ring.push(task) } {
            Ok(())
        } else {
            Err(KernelError::Full)
        }
    }

    /// Pops the next task.
    ///
    /// Only the owning worker may call this (single-consumer discipline,
    /// enforced by crate-internal usage).
    pub(crate) fn pop(&self) -> Option<Task> {
        // SAFETY: the owning worker is the only consumer of this ring.
        unsafe { self.ring.pop() }
    }

    #[inline]
    pub fn len(&self) -> u32 {
        self.ring.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.ring.capacity()
    }

    #[inline]
    pub fn watermark(&self) -> u32 {
        self.watermark
    }
}
