//! Atomic counter arrays, global and per-tenant.
//!
//! Unconditional: never gated by trace level or sampling. Updates are
//! relaxed: exact interleaving may be lost, monotonic accumulation never is.

use crate::config::MAX_TENANTS;
use crate::error::KernelError;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter slots per array (spare room above the defined ids).
const METRIC_SLOTS: usize = 16;

/// The operator-visible counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum MetricId {
    TasksEnqueued = 0,
    TasksDequeued = 1,
    TasksDispatched = 2,
    TasksFailed = 3,
    TasksRetried = 4,
    TasksYielded = 5,
    AllocBytes = 6,
    AllocFails = 7,
    ChanEmits = 8,
    ChanDrops = 9,
    ChanFull = 10,
    WorkerParks = 11,
    WorkerWakes = 12,
}

impl MetricId {
    /// Every defined metric, in id order.
    pub const ALL: [MetricId; 13] = [
        Self::TasksEnqueued,
        Self::TasksDequeued,
        Self::TasksDispatched,
        Self::TasksFailed,
        Self::TasksRetried,
        Self::TasksYielded,
        Self::AllocBytes,
        Self::AllocFails,
        Self::ChanEmits,
        Self::ChanDrops,
        Self::ChanFull,
        Self::WorkerParks,
        Self::WorkerWakes,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::TasksEnqueued => "tasks_enqueued",
            Self::TasksDequeued => "tasks_dequeued",
            Self::TasksDispatched => "tasks_dispatched",
            Self::TasksFailed => "tasks_failed",
            Self::TasksRetried => "tasks_retried",
            Self::TasksYielded => "tasks_yielded",
            Self::AllocBytes => "alloc_bytes",
            Self::AllocFails => "alloc_fails",
            Self::ChanEmits => "chan_emits",
            Self::ChanDrops => "chan_drops",
            Self::ChanFull => "chan_full",
            Self::WorkerParks => "worker_parks",
            Self::WorkerWakes => "worker_wakes",
        }
    }
}

/// Global plus per-tenant counter arrays.
pub struct Metrics {
    global: [AtomicU64; METRIC_SLOTS],
    per_tenant: Vec<[AtomicU64; METRIC_SLOTS]>,
}

impl Metrics {
    pub fn new(tenants: u16) -> Result<Self, KernelError> {
        if tenants == 0 || tenants > MAX_TENANTS {
            return Err(KernelError::Invalid);
        }
        Ok(Self {
            global: std::array::from_fn(|_| AtomicU64::new(0)),
            per_tenant: (0..tenants)
                .map(|_| std::array::from_fn(|_| AtomicU64::new(0)))
                .collect(),
        })
    }

    /// Adds `delta` to the global counter and, if `tenant` is in range, to
    /// that tenant's counter.
    pub fn inc(&self, tenant: u16, id: MetricId, delta: u64) {
        self.global[id as usize].fetch_add(delta, Ordering::Relaxed);
        if let Some(row) = self.per_tenant.get(tenant as usize) {
            row[id as usize].fetch_add(delta, Ordering::Relaxed);
        }
    }

    /// Reads a global counter.
    pub fn get(&self, id: MetricId) -> u64 {
        self.global[id as usize].load(Ordering::Relaxed)
    }

    /// Reads a per-tenant counter; 0 for out-of-range tenants.
    pub fn get_tenant(&self, tenant: u16, id: MetricId) -> u64 {
        self.per_tenant
            .get(tenant as usize)
            .map_or(0, |row| row[id as usize].load(Ordering::Relaxed))
    }

    /// Zeroes every counter.
    pub fn reset(&self) {
        for counter in &self.global {
            counter.store(0, Ordering::Relaxed);
        }
        for row in &self.per_tenant {
            for counter in row {
                counter.store(0, Ordering::Relaxed);
            }
        }
    }
}
