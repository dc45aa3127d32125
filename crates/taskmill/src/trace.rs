//! Per-tenant trace rings with level and sampling gates.

use crate::config::{MAX_TENANTS, TRACE_RING_CAP};
use crate::error::KernelError;
use crate::platform::Platform;
use crate::task::TraceEvent;
use parking_lot::Mutex;
use ringcore::SpscRing;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Global trace verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum TraceLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    All = 4,
}

impl TraceLevel {
    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Off,
            1 => Self::Error,
            2 => Self::Warn,
            3 => Self::Info,
            _ => Self::All,
        }
    }
}

/// Trace event kinds. The numeric values are stable and appear in the
/// `kind` field of [`TraceEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EventKind {
    TaskStart = 0x0001,
    TaskEnd = 0x0002,
    TaskFail = 0x0003,
    TaskRetry = 0x0004,
    TaskYield = 0x0005,
    AllocFail = 0x0006,
    ChanEmit = 0x0010,
    ChanFull = 0x0011,
    ChanDrop = 0x0012,
    ChanDrain = 0x0013,
    ChanOpen = 0x0014,
    ChanClose = 0x0015,
    Watchdog = 0x0020,
    WorkerPark = 0x0021,
    WorkerWake = 0x0022,
    YieldOverflow = 0x0030,
    YieldLimit = 0x0031,
    Poison = 0x0032,
    Boot = 0x0040,
    Halt = 0x0041,
}

impl EventKind {
    /// The minimum trace level at which this kind is recorded.
    fn required_level(self) -> TraceLevel {
        match self {
            Self::TaskFail
            | Self::AllocFail
            | Self::YieldOverflow
            | Self::YieldLimit
            | Self::Poison => TraceLevel::Error,
            Self::ChanFull | Self::ChanDrop | Self::Watchdog => TraceLevel::Warn,
            _ => TraceLevel::Info,
        }
    }
}

/// The trace subsystem: one bounded event ring per tenant.
///
/// Any worker may emit for any tenant and the host reads concurrently, so
/// each ring's producer and consumer sides are serialized by short
/// per-tenant mutexes, so each side of the SPSC pair has one effective
/// endpoint at a time, which is the ring's contract.
pub struct Trace {
    rings: Vec<SpscRing<TraceEvent>>,
    write_locks: Vec<Mutex<()>>,
    read_locks: Vec<Mutex<()>>,
    level: AtomicU32,
    /// Fixed-point sample threshold: a sample passes when the PRNG draw is
    /// ≤ this value. `u32::MAX` means sample everything.
    sample_threshold: AtomicU32,
    prng_state: AtomicU32,
    total_events: AtomicU64,
    dropped_events: AtomicU64,
    platform: Arc<dyn Platform>,
}

impl Trace {
    pub fn new(platform: Arc<dyn Platform>, tenants: u16) -> Result<Self, KernelError> {
        if tenants == 0 || tenants > MAX_TENANTS {
            return Err(KernelError::Invalid);
        }

        let n = tenants as usize;
        Ok(Self {
            rings: (0..n).map(|_| SpscRing::with_capacity(TRACE_RING_CAP)).collect(),
            write_locks: (0..n).map(|_| Mutex::new(())).collect(),
            read_locks: (0..n).map(|_| Mutex::new(())).collect(),
            level: AtomicU32::new(TraceLevel::Warn as u32),
            sample_threshold: AtomicU32::new(u32::MAX),
            prng_state: AtomicU32::new(0xDEAD_BEEF),
            total_events: AtomicU64::new(0),
            dropped_events: AtomicU64::new(0),
            platform,
        })
    }

    /// Emits an event, subject to the level gate and (at level ALL) the
    /// sampling gate.
    pub fn write(&self, tenant: u16, kind: EventKind, task_type: u16, arg0: u32, arg1: u32) {
        let level = TraceLevel::from_raw(self.level.load(Ordering::Relaxed));
        if kind.required_level() > level {
            return;
        }

        let threshold = self.sample_threshold.load(Ordering::Relaxed);
        if level == TraceLevel::All && threshold < u32::MAX && self.prng_next() > threshold {
            return;
        }

        self.emit(tenant, kind, task_type, arg0, arg1);
    }

    /// Emits an event unconditionally (boot/halt markers).
    pub fn write_force(&self, tenant: u16, kind: EventKind, task_type: u16, arg0: u32, arg1: u32) {
        self.emit(tenant, kind, task_type, arg0, arg1);
    }

    fn emit(&self, tenant: u16, kind: EventKind, task_type: u16, arg0: u32, arg1: u32) {
        let Some(ring) = self.rings.get(tenant as usize) else {
            return;
        };

        let ev = TraceEvent::new(
            self.platform.monotonic_counter(),
            kind as u32,
            tenant,
            task_type,
            arg0,
            arg1,
        );

        let _guard = self.write_locks[tenant as usize].lock();
        // SAFETY: the write lock serializes producers for this ring.
        if unsafe { ring.push(ev) } {
            self.total_events.fetch_add(1, Ordering::Relaxed);
        } else {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Pops one event from a tenant's ring.
    pub fn read_event(&self, tenant: u16) -> Option<TraceEvent> {
        let ring = self.rings.get(tenant as usize)?;
        let _guard = self.read_locks[tenant as usize].lock();
        // SAFETY: the read lock serializes consumers for this ring.
        unsafe { ring.pop() }
    }

    pub fn set_level(&self, level: TraceLevel) {
        self.level.store(level as u32, Ordering::Relaxed);
    }

    pub fn level(&self) -> TraceLevel {
        TraceLevel::from_raw(self.level.load(Ordering::Relaxed))
    }

    /// Sets the sampling rate for level-ALL tracing. Clamped to `[0, 1]` and
    /// mapped to a 32-bit fixed-point threshold; the gate itself is pure
    /// integer.
    pub fn set_sample_rate(&self, rate: f32) {
        let threshold = if rate <= 0.0 {
            0
        } else if rate >= 1.0 {
            u32::MAX
        } else {
            (f64::from(rate) * f64::from(u32::MAX)) as u32
        };
        self.sample_threshold.store(threshold, Ordering::Relaxed);
    }

    /// Events written since boot.
    pub fn total(&self) -> u64 {
        self.total_events.load(Ordering::Relaxed)
    }

    /// Events dropped on full rings since boot.
    pub fn dropped(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// xorshift32. State updates race under contention, which only perturbs
    /// the sample sequence, never its distribution.
    fn prng_next(&self) -> u32 {
        let mut x = self.prng_state.load(Ordering::Relaxed);
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.prng_state.store(x, Ordering::Relaxed);
        x
    }
}
