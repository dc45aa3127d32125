//! The scheduler: ready queue, local queues, event queue, overflow bucket,
//! and the unified enqueue/yield primitives every entry path funnels
//! through.

use crate::config::{
    DEFAULT_MAX_YIELDS, EVQ_DEFAULT_CAP, LQ_DEFAULT_CAP, MAX_WORKERS, OVERFLOW_CAP, RQ_DEFAULT_CAP,
};
use crate::error::KernelError;
use crate::evq::EventQueue;
use crate::lq::LocalQueue;
use crate::rq::ReadyQueue;
use crate::task::Task;
use ringcore::MpmcRing;
use std::sync::atomic::{AtomicU32, Ordering};

/// The two-level ready system plus timed events.
///
/// Entry paths (submit, channel drain, retry, timer fire) all go through
/// [`enqueue`](Scheduler::enqueue), which is where the global sequence
/// number is assigned. Handlers re-queue themselves through
/// [`yield_task`](Scheduler::yield_task), which preserves the task's seq and
/// is bounded by the per-task yield budget.
pub struct Scheduler {
    rq: ReadyQueue,
    lqs: Vec<LocalQueue>,
    evq: EventQueue,
    overflow: MpmcRing<Task>,
    next_seq: AtomicU32,
}

impl Scheduler {
    pub fn new(workers: u32) -> Result<Self, KernelError> {
        if workers == 0 || workers > MAX_WORKERS {
            return Err(KernelError::Invalid);
        }
        Ok(Self {
            rq: ReadyQueue::new(RQ_DEFAULT_CAP),
            lqs: (0..workers).map(|_| LocalQueue::new(LQ_DEFAULT_CAP)).collect(),
            evq: EventQueue::new(EVQ_DEFAULT_CAP),
            overflow: MpmcRing::with_capacity(OVERFLOW_CAP),
            next_seq: AtomicU32::new(0),
        })
    }

    /// Enqueues a task: assigns the next global sequence number, then tries
    /// the hinted worker's local queue (if `worker_hint ≥ 0`), falling back
    /// to the ready queue.
    pub fn enqueue(&self, mut task: Task, worker_hint: i32) -> Result<(), KernelError> {
        task.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        if worker_hint >= 0 {
            if let Some(lq) = self.lqs.get(worker_hint as usize) {
                if lq.push(task).is_ok() {
                    return Ok(());
                }
            }
        }

        self.rq.push(task)
    }

    /// Cooperative re-queue of a running task.
    ///
    /// Increments `yield_count` and applies the circuit breaker: past
    /// `max_yields` (0 selects the default of 16) the task fails with
    /// `YieldLimit` and is not queued. Otherwise the task goes to the
    /// worker's yield reserve, then the overflow bucket, and only a system
    /// catastrophically out of queue space yields `YieldOverflow`.
    pub fn yield_task(
        &self,
        mut task: Task,
        worker_id: u32,
        max_yields: u16,
    ) -> Result<(), KernelError> {
        task.yield_count += 1;

        let limit = if max_yields == 0 { DEFAULT_MAX_YIELDS } else { max_yields };
        if task.yield_count > limit {
            return Err(KernelError::YieldLimit);
        }

        if let Some(lq) = self.lqs.get(worker_id as usize) {
            if lq.push_yield(task).is_ok() {
                return Ok(());
            }
        }

        if self.overflow.push(task) {
            Ok(())
        } else {
            Err(KernelError::YieldOverflow)
        }
    }

    /// Schedules a task to become due at `tick`. The target tick is an
    /// explicit argument; `meta0`/`meta1` stay untouched for the handler.
    pub fn schedule_at(&self, task: Task, tick: u32) -> Result<(), KernelError> {
        self.evq.push(task, tick)
    }

    /// Pops the hinted worker's local queue. Owning worker only.
    pub(crate) fn pop_local(&self, worker_id: u32) -> Option<Task> {
        self.lqs.get(worker_id as usize)?.pop()
    }

    /// Pops the shared yield-overflow bucket.
    pub fn pop_overflow(&self) -> Option<Task> {
        self.overflow.pop()
    }

    /// Pops the ready queue under the priority-weighted schedule.
    pub fn pop_ready(&self) -> Option<Task> {
        self.rq.pop()
    }

    /// Pops one due event-queue entry.
    pub fn pop_due(&self, current_tick: u32) -> Option<Task> {
        self.evq.pop_due(current_tick)
    }

    #[inline]
    pub fn workers(&self) -> u32 {
        self.lqs.len() as u32
    }

    pub fn ready_len(&self) -> u32 {
        self.rq.len()
    }

    pub fn local_len(&self, worker_id: u32) -> u32 {
        self.lqs.get(worker_id as usize).map_or(0, LocalQueue::len)
    }

    pub fn event_len(&self) -> u32 {
        self.evq.len()
    }

    pub fn overflow_len(&self) -> u32 {
        self.overflow.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LQ_DEFAULT_CAP;
    use crate::task::Priority;

    #[test]
    fn enqueue_without_hint_goes_to_rq() {
        let s = Scheduler::new(2).unwrap();
        s.enqueue(Task::new(1), -1).unwrap();

        assert_eq!(s.ready_len(), 1);
        let t = s.pop_ready().unwrap();
        assert_eq!(t.task_type, 1);
        assert_eq!(t.seq, 0, "first enqueue gets seq 0");
    }

    #[test]
    fn enqueue_with_hint_prefers_local_queue() {
        let s = Scheduler::new(4).unwrap();
        s.enqueue(Task::new(2), 1).unwrap();

        assert_eq!(s.local_len(1), 1);
        assert_eq!(s.local_len(0), 0);
        assert_eq!(s.pop_local(1).unwrap().task_type, 2);
        assert!(s.pop_local(0).is_none());
    }

    #[test]
    fn seq_is_monotonic_across_enqueues() {
        let s = Scheduler::new(2).unwrap();
        for _ in 0..10 {
            s.enqueue(Task::new(1), -1).unwrap();
        }
        let mut last = None;
        while let Some(t) = s.pop_ready() {
            if let Some(prev) = last {
                assert!(t.seq > prev);
            }
            last = Some(t.seq);
        }
        assert_eq!(last, Some(9));
    }

    #[test]
    fn full_local_queue_falls_back_to_rq() {
        let s = Scheduler::new(1).unwrap();
        // Fill LQ[0] to its watermark.
        while s.local_len(0) < s.lqs[0].watermark() {
            s.enqueue(Task::new(9), 0).unwrap();
        }

        let before_rq = s.ready_len();
        s.enqueue(Task::new(9), 0).unwrap();
        assert_eq!(s.ready_len(), before_rq + 1, "spill lands in the RQ");
    }

    #[test]
    fn yield_increments_count_and_uses_local_queue() {
        let s = Scheduler::new(2).unwrap();
        let t = Task::new(5);
        s.yield_task(t, 0, 0).unwrap();

        let queued = s.pop_local(0).unwrap();
        assert_eq!(queued.task_type, 5);
        assert_eq!(queued.yield_count, 1);
    }

    #[test]
    fn yield_circuit_breaker_trips() {
        let s = Scheduler::new(2).unwrap();
        let mut t = Task::new(7);
        t.yield_count = DEFAULT_MAX_YIELDS;

        assert_eq!(s.yield_task(t, 0, 0), Err(KernelError::YieldLimit));
        assert_eq!(s.local_len(0), 0, "rejected task is not queued");
    }

    #[test]
    fn yield_overflows_to_bucket_when_lq_full() {
        let s = Scheduler::new(1).unwrap();
        // Fill LQ[0] completely, reserve included.
        for _ in 0..LQ_DEFAULT_CAP {
            s.lqs[0].push_yield(Task::new(99)).unwrap();
        }

        s.yield_task(Task::new(8), 0, 0).unwrap();
        assert_eq!(s.overflow_len(), 1);
        assert_eq!(s.pop_overflow().unwrap().task_type, 8);
    }

    #[test]
    fn schedule_at_keeps_meta_for_the_handler() {
        let s = Scheduler::new(1).unwrap();
        let t = Task::new(3).with_meta(0xAB, 0xCD);
        s.schedule_at(t, 4).unwrap();

        assert!(s.pop_due(3).is_none());
        let due = s.pop_due(4).unwrap();
        assert_eq!(due.meta0, 0xAB);
        assert_eq!(due.meta1, 0xCD);
    }

    #[test]
    fn priority_pop_order_end_to_end() {
        let s = Scheduler::new(2).unwrap();
        s.enqueue(Task::new(10).with_priority(Priority::Low), -1).unwrap();
        s.enqueue(Task::new(20).with_priority(Priority::Normal), -1).unwrap();
        s.enqueue(Task::new(30).with_priority(Priority::High), -1).unwrap();
        s.enqueue(Task::new(40).with_priority(Priority::Critical), -1).unwrap();

        let order: Vec<u32> = (0..4).map(|_| s.pop_ready().unwrap().task_type).collect();
        assert_eq!(order, [40, 30, 20, 10]);
    }
}
