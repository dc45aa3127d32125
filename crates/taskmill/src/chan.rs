//! Channel registry: named typed channels with P2P and fan-out delivery,
//! priority-aware backpressure, and dead-lettering.

use crate::alloc::{payload_retain, KernelAlloc};
use crate::config::{CHAN_DEFAULT_SLOTS, CHAN_PRIORITY_RESERVE_PCT, MAX_CHANNELS, MAX_CHAN_SUBS};
use crate::error::KernelError;
use crate::metrics::{MetricId, Metrics};
use crate::sched::Scheduler;
use crate::task::{Priority, Task};
use crate::trace::{EventKind, Trace};
use parking_lot::{Mutex, RwLock};
use ringcore::MpmcRing;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Channel id 0: the "direct submit" marker stamped on tasks that never
/// crossed a channel. Not an emittable channel.
pub const CHAN_DIRECT: u32 = 0;
/// Channel id 1: the `sys.dropped` dead-letter channel.
pub const CHAN_DEAD_LETTER: u32 = 1;

/// Delivery topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    /// At most one active subscriber.
    P2p,
    /// 0..N subscribers, each receiving a copy.
    Fanout,
}

/// Delivery guarantee under subscriber-side backpressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guarantee {
    /// Undeliverable copies are counted and dropped.
    Lossy,
    /// Undeliverable copies are routed to the dead-letter channel.
    Lossless,
}

/// One channel subscription.
#[derive(Debug, Clone, Copy)]
pub struct Subscriber {
    pub module_id: u32,
    /// Preferred worker (−1 = any).
    pub worker_id: i32,
    pub active: bool,
}

struct Channel {
    name: String,
    id: u32,
    mode: ChannelMode,
    guarantee: Guarantee,
    /// Expected task type; 0 disables the check.
    msg_type: u32,
    ring: MpmcRing<Task>,
    subs: Mutex<Vec<Subscriber>>,
    open: AtomicBool,
    emit_count: AtomicU64,
    drop_count: AtomicU64,
}

impl Channel {
    fn new(
        name: &str,
        id: u32,
        mode: ChannelMode,
        guarantee: Guarantee,
        msg_type: u32,
        slots: u32,
        open: bool,
    ) -> Self {
        Self {
            name: name.to_owned(),
            id,
            mode,
            guarantee,
            msg_type,
            ring: MpmcRing::with_capacity(slots),
            subs: Mutex::new(Vec::new()),
            open: AtomicBool::new(open),
            emit_count: AtomicU64::new(0),
            drop_count: AtomicU64::new(0),
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Slots below which non-CRITICAL emits are admitted. At least one slot
    /// is always reserved so a CRITICAL producer has headroom.
    fn reserve_threshold(&self) -> u32 {
        let cap = self.ring.capacity();
        cap - (cap * CHAN_PRIORITY_RESERVE_PCT / 100).max(1)
    }
}

/// The channel registry.
pub struct ChannelRegistry {
    channels: RwLock<Vec<Arc<Channel>>>,
    sched: Arc<Scheduler>,
    alloc: Arc<KernelAlloc>,
    trace: Arc<Trace>,
    metrics: Arc<Metrics>,
}

impl ChannelRegistry {
    pub fn new(
        sched: Arc<Scheduler>,
        alloc: Arc<KernelAlloc>,
        trace: Arc<Trace>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let channels = vec![
            // Id 0 is a closed marker entry; its ring is never used.
            Arc::new(Channel::new(
                "sys.direct",
                CHAN_DIRECT,
                ChannelMode::P2p,
                Guarantee::Lossy,
                0,
                1,
                false,
            )),
            Arc::new(Channel::new(
                "sys.dropped",
                CHAN_DEAD_LETTER,
                ChannelMode::Fanout,
                Guarantee::Lossy,
                0,
                CHAN_DEFAULT_SLOTS,
                true,
            )),
        ];

        Self {
            channels: RwLock::new(channels),
            sched,
            alloc,
            trace,
            metrics,
        }
    }

    fn get(&self, id: u32) -> Option<Arc<Channel>> {
        self.channels.read().get(id as usize).cloned()
    }

    /// Opens a channel and returns its id. `slots` of 0 selects the default
    /// (1024); other values are rounded up to a power of two.
    pub fn open(
        &self,
        name: &str,
        mode: ChannelMode,
        guarantee: Guarantee,
        msg_type: u32,
        slots: u32,
    ) -> Result<u32, KernelError> {
        let mut channels = self.channels.write();
        if channels.len() >= MAX_CHANNELS {
            return Err(KernelError::Full);
        }
        if channels.iter().any(|c| c.is_open() && c.name == name) {
            return Err(KernelError::Exists);
        }

        let slots = if slots == 0 {
            CHAN_DEFAULT_SLOTS
        } else {
            slots.next_power_of_two()
        };

        let id = channels.len() as u32;
        channels.push(Arc::new(Channel::new(
            name, id, mode, guarantee, msg_type, slots, true,
        )));
        drop(channels);

        self.trace
            .write(0, EventKind::ChanOpen, 0, id, mode as u32);
        Ok(id)
    }

    /// Finds an open channel by name.
    pub fn find(&self, name: &str) -> Option<u32> {
        self.channels
            .read()
            .iter()
            .find(|c| c.is_open() && c.name == name)
            .map(|c| c.id)
    }

    /// Subscribes a module to a channel.
    pub fn subscribe(&self, id: u32, module_id: u32, worker_id: i32) -> Result<(), KernelError> {
        let ch = self.get(id).ok_or(KernelError::Invalid)?;
        if !ch.is_open() {
            return Err(KernelError::Closed);
        }

        let mut subs = ch.subs.lock();
        if ch.mode == ChannelMode::P2p && !subs.is_empty() {
            return Err(KernelError::AlreadyBound);
        }
        if subs.len() >= MAX_CHAN_SUBS {
            return Err(KernelError::Full);
        }
        subs.push(Subscriber {
            module_id,
            worker_id,
            active: true,
        });
        Ok(())
    }

    /// Emits a task on a channel.
    pub fn emit(&self, id: u32, mut task: Task) -> Result<(), KernelError> {
        let ch = self.get(id).ok_or(KernelError::Invalid)?;
        if !ch.is_open() {
            return Err(KernelError::Closed);
        }
        if ch.msg_type != 0 && task.task_type != ch.msg_type {
            return Err(KernelError::TypeMismatch);
        }

        task.channel = id;
        task.set_flag(Task::FLAG_CHANNEL_MSG);

        // Priority reserve: the last slots are CRITICAL-only.
        if ch.ring.len() >= ch.reserve_threshold() && task.priority() != Priority::Critical {
            return self.emit_full(&ch, &task);
        }

        // P2P fast path: a single active subscriber gets the task routed
        // straight into the scheduler, skipping the channel ring.
        if ch.mode == ChannelMode::P2p {
            let single = {
                let subs = ch.subs.lock();
                match subs.as_slice() {
                    [sub] if sub.active => Some(sub.worker_id),
                    _ => None,
                }
            };
            if let Some(worker) = single {
                if self.sched.enqueue(task, worker).is_ok() {
                    ch.emit_count.fetch_add(1, Ordering::Relaxed);
                    self.metrics.inc(task.tenant, MetricId::ChanEmits, 1);
                    return Ok(());
                }
            }
        }

        if !ch.ring.push(task) {
            return self.emit_full(&ch, &task);
        }
        ch.emit_count.fetch_add(1, Ordering::Relaxed);
        self.metrics.inc(task.tenant, MetricId::ChanEmits, 1);

        // A subscribed P2P channel drains eagerly so the scheduler-side
        // failure that forced the buffering gets retried promptly.
        if ch.mode == ChannelMode::P2p && !ch.subs.lock().is_empty() {
            self.drain(id, 1);
        }

        Ok(())
    }

    fn emit_full(&self, ch: &Channel, task: &Task) -> Result<(), KernelError> {
        self.trace.write(
            task.tenant,
            EventKind::ChanFull,
            task.task_type as u16,
            ch.id,
            0,
        );
        self.metrics.inc(task.tenant, MetricId::ChanFull, 1);
        Err(KernelError::Full)
    }

    /// Drains up to `limit` buffered tasks (0 = no limit) to the channel's
    /// subscribers. Returns the number of ring entries consumed.
    pub fn drain(&self, id: u32, limit: u32) -> u32 {
        let Some(ch) = self.get(id) else {
            return 0;
        };
        // Snapshot the subscriber list; delivery itself is lock-free.
        let subs: Vec<Subscriber> = ch.subs.lock().clone();
        if subs.is_empty() {
            return 0;
        }
        let limit = if limit == 0 { u32::MAX } else { limit };

        let mut drained = 0;
        while drained < limit {
            let Some(task) = ch.ring.pop() else {
                break;
            };

            match ch.mode {
                ChannelMode::P2p => self.deliver_p2p(&ch, &subs, task),
                ChannelMode::Fanout => self.deliver_fanout(&ch, &subs, task),
            }
            drained += 1;
        }

        if drained > 0 {
            self.trace.write(0, EventKind::ChanDrain, 0, id, drained);
        }
        drained
    }

    fn deliver_p2p(&self, ch: &Channel, subs: &[Subscriber], task: Task) {
        let sub = subs[0];
        if !sub.active {
            return;
        }
        if self.sched.enqueue(task, sub.worker_id).is_err() {
            ch.drop_count.fetch_add(1, Ordering::Relaxed);
            self.route_dead_letter(task);
        }
    }

    fn deliver_fanout(&self, ch: &Channel, subs: &[Subscriber], task: Task) {
        let active = subs.iter().filter(|s| s.active).count() as u32;

        if active == 0 {
            // Nobody left to own the reference.
            self.release_payload(&task);
            return;
        }

        // The task's existing reference covers the first copy; each
        // additional subscriber copy takes one more.
        if task.has_refcounted_payload() && active > 1 {
            if let Some(payload) = NonNull::new(task.payload_ptr as *mut u8) {
                for _ in 1..active {
                    // SAFETY: the payload is live: its ring copy held a
                    // reference until this drain took ownership of it.
                    unsafe { payload_retain(payload) };
                }
            }
        }

        for (i, sub) in subs.iter().filter(|s| s.active).enumerate() {
            let copy = task;
            if self.sched.enqueue(copy, sub.worker_id).is_ok() {
                continue;
            }
            match ch.guarantee {
                Guarantee::Lossy => {
                    ch.drop_count.fetch_add(1, Ordering::Relaxed);
                    self.trace.write(
                        task.tenant,
                        EventKind::ChanDrop,
                        task.task_type as u16,
                        ch.id,
                        i as u32,
                    );
                    self.metrics.inc(task.tenant, MetricId::ChanDrops, 1);
                    self.release_payload(&copy);
                }
                Guarantee::Lossless => {
                    ch.drop_count.fetch_add(1, Ordering::Relaxed);
                    self.route_dead_letter(copy);
                }
            }
        }
    }

    /// Routes an undeliverable task to `sys.dropped`. Never blocks: the
    /// payload reference dies here (the dead-letter record is a tombstone),
    /// and a full dead-letter ring just counts another drop.
    fn route_dead_letter(&self, mut task: Task) {
        self.release_payload(&task);
        task.clear_flag(Task::FLAG_PAYLOAD_RC);

        let Some(dl) = self.get(CHAN_DEAD_LETTER) else {
            return;
        };
        if !dl.is_open() || !dl.ring.push(task) {
            dl.drop_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn release_payload(&self, task: &Task) {
        if task.has_refcounted_payload() {
            if let Some(payload) = NonNull::new(task.payload_ptr as *mut u8) {
                // SAFETY: the task copy owned this reference.
                unsafe { self.alloc.payload_release(payload) };
            }
        }
    }

    /// Closes a channel. System channels (0, 1) refuse. Pending ring entries
    /// remain drainable.
    pub fn close(&self, id: u32) -> Result<(), KernelError> {
        if id <= CHAN_DEAD_LETTER {
            return Err(KernelError::Invalid);
        }
        let ch = self.get(id).ok_or(KernelError::Invalid)?;
        ch.open.store(false, Ordering::Release);
        self.trace.write(0, EventKind::ChanClose, 0, id, 0);
        Ok(())
    }

    /// Successful emits on a channel.
    pub fn emit_count(&self, id: u32) -> u64 {
        self.get(id).map_or(0, |c| c.emit_count.load(Ordering::Relaxed))
    }

    /// Drops recorded against a channel.
    pub fn drop_count(&self, id: u32) -> u64 {
        self.get(id).map_or(0, |c| c.drop_count.load(Ordering::Relaxed))
    }

    /// Buffered (not yet drained) tasks on a channel.
    pub fn buffered(&self, id: u32) -> u32 {
        self.get(id).map_or(0, |c| c.ring.len())
    }

    /// Number of channel slots in use, reserved ids included.
    pub fn channel_count(&self) -> u32 {
        self.channels.read().len() as u32
    }
}
