//! Kernel boot/halt and the host-facing operation surface.

use crate::alloc::{AllocStats, KernelAlloc};
use crate::chan::{ChannelMode, ChannelRegistry, Guarantee};
use crate::config::{BootConfig, DEFAULT_MAX_YIELDS};
use crate::error::KernelError;
use crate::metrics::{MetricId, Metrics};
use crate::module::{Ctx, Module, ModuleRegistry};
use crate::platform::Platform;
use crate::sched::Scheduler;
use crate::task::{Task, TraceEvent};
use crate::trace::{EventKind, Trace, TraceLevel};
use crate::worker::{WorkerDeps, WorkerPool};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// The kernel: one explicit aggregate owning every subsystem.
///
/// Construction order at boot: allocator → trace → metrics → scheduler →
/// channel registry → module registry → module registration → module `init`
/// → worker pool → `running`. Halt reverses it: `running` cleared → workers
/// stopped and joined → module `fini` in reverse registration order →
/// subsystems dropped (registries, scheduler, metrics/trace, allocator,
/// arena; field order below is the drop order).
pub struct Kernel {
    cfg: BootConfig,
    running: AtomicBool,
    tick: AtomicU32,
    pool: WorkerPool,
    modules: Arc<ModuleRegistry>,
    channels: Arc<ChannelRegistry>,
    sched: Arc<Scheduler>,
    metrics: Arc<Metrics>,
    trace: Arc<Trace>,
    alloc: Arc<KernelAlloc>,
    platform: Arc<dyn Platform>,
}

impl Kernel {
    /// Boots a kernel with the given configuration and modules.
    pub fn boot(
        cfg: BootConfig,
        modules: Vec<Module>,
        platform: Arc<dyn Platform>,
    ) -> Result<Self, KernelError> {
        cfg.validate()?;

        let alloc = Arc::new(KernelAlloc::new(Arc::clone(&platform), cfg.arena_size)?);
        let trace = Arc::new(Trace::new(Arc::clone(&platform), cfg.tenants)?);
        let metrics = Arc::new(Metrics::new(cfg.tenants)?);
        let sched = Arc::new(Scheduler::new(cfg.workers)?);
        let channels = Arc::new(ChannelRegistry::new(
            Arc::clone(&sched),
            Arc::clone(&alloc),
            Arc::clone(&trace),
            Arc::clone(&metrics),
        ));
        let registry = Arc::new(ModuleRegistry::new(
            Arc::clone(&channels),
            Arc::clone(&trace),
        ));

        for module in modules {
            registry.register(module)?;
        }

        // Module init under a boot context (no live task, no worker).
        let mut boot_task = Task::new(0);
        let mut boot_ctx = Ctx {
            task: &mut boot_task,
            alloc: &alloc,
            channels: &channels,
            trace: &trace,
            metrics: &metrics,
            sched: &sched,
            worker_id: u32::MAX,
            tick: 0,
            max_yields: DEFAULT_MAX_YIELDS,
        };
        registry.init_all(&mut boot_ctx)?;

        let mut pool = WorkerPool::new(cfg.workers);
        pool.start(&WorkerDeps {
            sched: Arc::clone(&sched),
            modules: Arc::clone(&registry),
            alloc: Arc::clone(&alloc),
            channels: Arc::clone(&channels),
            trace: Arc::clone(&trace),
            metrics: Arc::clone(&metrics),
            platform: Arc::clone(&platform),
        })?;

        let kernel = Self {
            cfg,
            running: AtomicBool::new(true),
            tick: AtomicU32::new(0),
            pool,
            modules: registry,
            channels,
            sched,
            metrics,
            trace,
            alloc,
            platform,
        };

        kernel.trace.write_force(
            0,
            EventKind::Boot,
            0,
            kernel.cfg.workers,
            (kernel.cfg.arena_size >> 20) as u32,
        );
        Ok(kernel)
    }

    /// Halts the kernel: refuses new submits, stops the workers, and runs
    /// module `fini` hooks in reverse registration order. Idempotent.
    pub fn halt(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.trace.write_force(0, EventKind::Halt, 0, 0, 0);

        self.pool.stop();

        let mut halt_task = Task::new(0);
        let mut halt_ctx = Ctx {
            task: &mut halt_task,
            alloc: &self.alloc,
            channels: &self.channels,
            trace: &self.trace,
            metrics: &self.metrics,
            sched: &self.sched,
            worker_id: u32::MAX,
            tick: self.tick.load(Ordering::Relaxed),
            max_yields: DEFAULT_MAX_YIELDS,
        };
        self.modules.fini_all(&mut halt_ctx);
    }

    /// Submits a task. Fails with `Closed` after halt and `Full` when the
    /// ready system cannot take it. A successful submit wakes one parked
    /// worker.
    pub fn submit(&self, task: Task) -> Result<(), KernelError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(KernelError::Closed);
        }

        self.sched.enqueue(task, -1)?;
        self.metrics.inc(task.tenant, MetricId::TasksEnqueued, 1);

        if let Some(worker_id) = self.pool.first_parked() {
            self.platform.wake_worker(worker_id);
        }
        Ok(())
    }

    /// Advances the kernel tick and propagates it to every worker.
    pub fn tick_advance(&self) {
        let tick = self.tick.fetch_add(1, Ordering::AcqRel) + 1;
        self.pool.set_tick(tick);
    }

    #[inline]
    pub fn tick(&self) -> u32 {
        self.tick.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &BootConfig {
        &self.cfg
    }

    pub fn worker_count(&self) -> u32 {
        self.pool.worker_count()
    }

    // ── Channels ─────────────────────────────────────────────────────────

    pub fn channel_open(
        &self,
        name: &str,
        mode: ChannelMode,
        guarantee: Guarantee,
        msg_type: u32,
        slots: u32,
    ) -> Result<u32, KernelError> {
        self.channels.open(name, mode, guarantee, msg_type, slots)
    }

    pub fn channel_emit(&self, id: u32, task: Task) -> Result<(), KernelError> {
        self.channels.emit(id, task)
    }

    pub fn channel_subscribe(
        &self,
        id: u32,
        module_id: u32,
        worker_hint: i32,
    ) -> Result<(), KernelError> {
        self.channels.subscribe(id, module_id, worker_hint)
    }

    pub fn channel_close(&self, id: u32) -> Result<(), KernelError> {
        self.channels.close(id)
    }

    pub fn channel_drain(&self, id: u32, limit: u32) -> u32 {
        self.channels.drain(id, limit)
    }

    pub fn channel_find(&self, name: &str) -> Option<u32> {
        self.channels.find(name)
    }

    // ── Observability ────────────────────────────────────────────────────

    /// Reads a global metric. The allocator counters are sourced from the
    /// allocator itself so they cannot drift from its internal accounting.
    pub fn metric(&self, id: MetricId) -> u64 {
        match id {
            MetricId::AllocBytes => self.alloc.alloc_bytes(),
            MetricId::AllocFails => self.alloc.alloc_fails(),
            _ => self.metrics.get(id),
        }
    }

    pub fn metric_for_tenant(&self, tenant: u16, id: MetricId) -> u64 {
        self.metrics.get_tenant(tenant, id)
    }

    /// Pops one trace event from a tenant's ring.
    pub fn trace_read(&self, tenant: u16) -> Option<TraceEvent> {
        self.trace.read_event(tenant)
    }

    pub fn set_trace_level(&self, level: TraceLevel) {
        self.trace.set_level(level);
    }

    pub fn set_trace_sample_rate(&self, rate: f32) {
        self.trace.set_sample_rate(rate);
    }

    pub fn is_poisoned(&self, task_type: u32) -> bool {
        self.modules.is_poisoned(task_type)
    }

    pub fn reset_poison(&self, task_type: u32) {
        self.modules.reset_poison(task_type);
    }

    pub fn fail_count(&self, task_type: u32) -> u32 {
        self.modules.fail_count(task_type)
    }

    /// The kernel allocator, for payload allocation by submitters.
    pub fn alloc(&self) -> &KernelAlloc {
        &self.alloc
    }

    pub fn alloc_stats(&self) -> AllocStats {
        self.alloc.stats()
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.halt();
    }
}
