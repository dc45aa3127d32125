//! Event queue: bounded min-heap of tick-scheduled tasks.

use crate::error::KernelError;
use crate::task::Task;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// One scheduled entry. Ordering is by key alone:
/// `(tick << 32) | (priority << 16) | sub_seq`, so earlier ticks first,
/// then higher priority, then FIFO within a (tick, priority) pair.
struct Entry {
    key: u64,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

struct Inner {
    heap: BinaryHeap<Reverse<Entry>>,
    /// FIFO tie-break within a (tick, priority) pair; occupies the key's low
    /// 16 bits.
    sub_seq: u16,
}

/// Bounded timed queue. Heap operations are not trivially lock-free and
/// traffic is low-rate, so a mutex guards the heap.
pub struct EventQueue {
    inner: Mutex<Inner>,
    capacity: u32,
}

impl EventQueue {
    pub fn new(capacity: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                sub_seq: 0,
            }),
            capacity,
        }
    }

    /// Schedules `task` to become due at `tick`.
    pub fn push(&self, task: Task, tick: u32) -> Result<(), KernelError> {
        let mut inner = self.inner.lock();
        if inner.heap.len() >= self.capacity as usize {
            return Err(KernelError::Full);
        }

        let sub = inner.sub_seq;
        inner.sub_seq = inner.sub_seq.wrapping_add(1);
        let key = (u64::from(tick) << 32) | (task.priority() as u64) << 16 | u64::from(sub);
        inner.heap.push(Reverse(Entry { key, task }));
        Ok(())
    }

    /// Pops the most urgent entry if its tick is ≤ `current_tick`.
    pub fn pop_due(&self, current_tick: u32) -> Option<Task> {
        let mut inner = self.inner.lock();
        let Reverse(top) = inner.heap.peek()?;
        if (top.key >> 32) as u32 > current_tick {
            return None;
        }
        inner.heap.pop().map(|Reverse(e)| e.task)
    }

    pub fn len(&self) -> u32 {
        self.inner.lock().heap.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
