//! Ready queue: four MPMC rings, one per priority, with weighted pops.

use crate::error::KernelError;
use crate::task::{Priority, Task};
use ringcore::MpmcRing;
use std::sync::atomic::{AtomicU32, Ordering};

/// Global ready queue.
///
/// Pops use weighted round-robin over the priority rings (8:4:2:1): each
/// priority is served up to its weight per cycle, so CRITICAL gets 8 of
/// every 15 slots while LOW still progresses. The per-priority counters are
/// shared across workers; they are advisory (relaxed), which skews a cycle
/// boundary occasionally but never starves a level.
pub struct ReadyQueue {
    queues: [MpmcRing<Task>; Priority::COUNT],
    counters: [AtomicU32; Priority::COUNT],
}

impl ReadyQueue {
    pub fn new(cap_per_queue: u32) -> Self {
        Self {
            queues: std::array::from_fn(|_| MpmcRing::with_capacity(cap_per_queue)),
            counters: std::array::from_fn(|_| AtomicU32::new(0)),
        }
    }

    /// Pushes a task onto its priority ring.
    pub fn push(&self, task: Task) -> Result<(), KernelError> {
        let prio = task.priority() as usize;
        if self.queues[prio].push(task) {
            Ok(())
        } else {
            Err(KernelError::Full)
        }
    }

    /// Pops the next task under the weighted schedule, or `None` when every
    /// priority ring is empty.
    pub fn pop(&self) -> Option<Task> {
        // First pass: serve each priority up to its weight.
        for prio in 0..Priority::COUNT {
            if self.counters[prio].load(Ordering::Relaxed) < Priority::WEIGHTS[prio] {
                if let Some(task) = self.queues[prio].pop() {
                    self.counters[prio].fetch_add(1, Ordering::Relaxed);
                    return Some(task);
                }
            }
        }

        // Cycle exhausted (or only over-budget levels have work): reset and
        // take anything in priority order.
        for counter in &self.counters {
            counter.store(0, Ordering::Relaxed);
        }
        for prio in 0..Priority::COUNT {
            if let Some(task) = self.queues[prio].pop() {
                self.counters[prio].fetch_add(1, Ordering::Relaxed);
                return Some(task);
            }
        }

        None
    }

    /// Total tasks across all priority rings.
    pub fn len(&self) -> u32 {
        self.queues.iter().map(MpmcRing::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
