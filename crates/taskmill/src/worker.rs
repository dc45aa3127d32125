//! Worker pool: gather–dispatch–park loops on OS threads.

use crate::alloc::KernelAlloc;
use crate::chan::ChannelRegistry;
use crate::config::{DEFAULT_MAX_YIELDS, EVQ_DRAIN_LIMIT};
use crate::error::{KernelError, Outcome};
use crate::metrics::{MetricId, Metrics};
use crate::module::{Ctx, ModuleRegistry};
use crate::platform::Platform;
use crate::sched::Scheduler;
use crate::task::Task;
use crate::trace::{EventKind, Trace};
use parking_lot::{Condvar, Mutex};
use ringcore::IdleWait;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Park timeout: workers re-check their queues at least this often even if a
/// wake signal is missed.
const PARK_TIMEOUT: Duration = Duration::from_millis(1);

/// Shared per-worker state, visible to the wake path.
pub(crate) struct WorkerShared {
    pub(crate) id: u32,
    running: AtomicBool,
    parked: AtomicBool,
    pub(crate) tick: AtomicU32,
    tasks_done: AtomicU64,
    /// `true` when a wake arrived while the worker wasn't waiting; consumed
    /// by the next park so the signal is never lost.
    wake_pending: Mutex<bool>,
    wake_cond: Condvar,
}

impl WorkerShared {
    fn new(id: u32) -> Self {
        Self {
            id,
            running: AtomicBool::new(false),
            parked: AtomicBool::new(false),
            tick: AtomicU32::new(0),
            tasks_done: AtomicU64::new(0),
            wake_pending: Mutex::new(false),
            wake_cond: Condvar::new(),
        }
    }

    pub(crate) fn wake(&self) {
        let mut pending = self.wake_pending.lock();
        *pending = true;
        self.wake_cond.notify_one();
    }

    fn park(&self) {
        let mut pending = self.wake_pending.lock();
        if !*pending && self.running.load(Ordering::Acquire) {
            self.wake_cond.wait_for(&mut pending, PARK_TIMEOUT);
        }
        *pending = false;
    }

    pub(crate) fn is_parked(&self) -> bool {
        self.parked.load(Ordering::Acquire)
    }
}

/// Everything a worker thread needs, cloned per thread.
#[derive(Clone)]
pub(crate) struct WorkerDeps {
    pub(crate) sched: Arc<Scheduler>,
    pub(crate) modules: Arc<ModuleRegistry>,
    pub(crate) alloc: Arc<KernelAlloc>,
    pub(crate) channels: Arc<ChannelRegistry>,
    pub(crate) trace: Arc<Trace>,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) platform: Arc<dyn Platform>,
}

/// The worker pool.
pub(crate) struct WorkerPool {
    workers: Vec<Arc<WorkerShared>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn new(count: u32) -> Self {
        Self {
            workers: (0..count).map(|id| Arc::new(WorkerShared::new(id))).collect(),
            handles: Vec::new(),
        }
    }

    /// Starts one thread per worker and registers their wake routes with
    /// the platform.
    pub(crate) fn start(&mut self, deps: &WorkerDeps) -> Result<(), KernelError> {
        for shared in &self.workers {
            let waker = Arc::clone(shared);
            deps.platform
                .register_waker(shared.id, Arc::new(move || waker.wake()));

            shared.running.store(true, Ordering::Release);
            let shared = Arc::clone(shared);
            let deps = deps.clone();
            let handle = thread::Builder::new()
                .name(format!("taskmill-worker-{}", shared.id))
                .spawn(move || worker_loop(&shared, &deps))
                .map_err(|_| KernelError::NoMem)?;
            self.handles.push(handle);
        }
        Ok(())
    }

    /// Signals every worker to stop, wakes them, and joins the threads.
    pub(crate) fn stop(&mut self) {
        for shared in &self.workers {
            shared.running.store(false, Ordering::Release);
        }
        for shared in &self.workers {
            shared.wake();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }

    /// Propagates a new kernel tick to every worker.
    pub(crate) fn set_tick(&self, tick: u32) {
        for shared in &self.workers {
            shared.tick.store(tick, Ordering::Release);
        }
    }

    /// Id of the first currently-parked worker, if any.
    pub(crate) fn first_parked(&self) -> Option<u32> {
        self.workers.iter().find(|w| w.is_parked()).map(|w| w.id)
    }

    pub(crate) fn worker_count(&self) -> u32 {
        self.workers.len() as u32
    }

    /// Tasks completed successfully, summed over workers.
    pub(crate) fn tasks_done(&self) -> u64 {
        self.workers
            .iter()
            .map(|w| w.tasks_done.load(Ordering::Relaxed))
            .sum()
    }
}

fn worker_loop(w: &WorkerShared, deps: &WorkerDeps) {
    let mut idle = IdleWait::new();

    while w.running.load(Ordering::Acquire) {
        let mut got_work = false;

        // Gather order: own LQ, then the shared overflow bucket, then the
        // ready queue, then due timed events.
        if let Some(task) = deps.sched.pop_local(w.id) {
            deps.metrics.inc(task.tenant, MetricId::TasksDequeued, 1);
            dispatch_task(w, deps, task);
            got_work = true;
        } else if let Some(task) = deps.sched.pop_overflow() {
            deps.metrics.inc(task.tenant, MetricId::TasksDequeued, 1);
            dispatch_task(w, deps, task);
            got_work = true;
        } else if let Some(task) = deps.sched.pop_ready() {
            deps.metrics.inc(task.tenant, MetricId::TasksDequeued, 1);
            dispatch_task(w, deps, task);
            got_work = true;
        } else {
            // Move due events into our own LQ; they dispatch on the next
            // pass in normal queue order.
            let tick = w.tick.load(Ordering::Relaxed);
            let mut drained = 0;
            while drained < EVQ_DRAIN_LIMIT {
                match deps.sched.pop_due(tick) {
                    Some(task) => {
                        let _ = deps.sched.enqueue(task, w.id as i32);
                        drained += 1;
                    }
                    None => break,
                }
            }
            got_work = drained > 0;
        }

        if got_work {
            idle.reset();
        } else if !idle.wait() {
            // Wind-down budget exhausted; really park.
            w.parked.store(true, Ordering::Release);
            deps.metrics.inc(0, MetricId::WorkerParks, 1);
            deps.trace.write(0, EventKind::WorkerPark, 0, w.id, 0);

            w.park();

            w.parked.store(false, Ordering::Release);
            deps.metrics.inc(0, MetricId::WorkerWakes, 1);
            deps.trace.write(0, EventKind::WorkerWake, 0, w.id, 0);
            idle.reset();
        }
    }
}

fn dispatch_task(w: &WorkerShared, deps: &WorkerDeps, mut task: Task) {
    deps.metrics.inc(task.tenant, MetricId::TasksDispatched, 1);

    let tick = w.tick.load(Ordering::Relaxed);
    let mut ctx = Ctx {
        task: &mut task,
        alloc: &deps.alloc,
        channels: &deps.channels,
        trace: &deps.trace,
        metrics: &deps.metrics,
        sched: &deps.sched,
        worker_id: w.id,
        tick,
        max_yields: DEFAULT_MAX_YIELDS,
    };

    let result = deps.modules.dispatch(&mut ctx);

    match result {
        Ok(Outcome::Done) => {
            w.tasks_done.fetch_add(1, Ordering::Relaxed);
            release_payload(&deps.alloc, &task);
        }
        Ok(Outcome::Retry) => {
            // The re-enqueued task keeps the payload reference.
            let _ = deps.sched.enqueue(task, -1);
            deps.metrics.inc(task.tenant, MetricId::TasksRetried, 1);
        }
        Ok(Outcome::Yielded) => {
            // The yield already queued a copy; that copy owns the reference.
            deps.metrics.inc(task.tenant, MetricId::TasksYielded, 1);
            deps.trace.write(
                task.tenant,
                EventKind::TaskYield,
                task.task_type as u16,
                task.seq,
                u32::from(task.yield_count),
            );
        }
        Err(e) => {
            // NotFound and Poisoned short-circuit before any handler runs;
            // the poison counter tracks failures of dispatched handlers only.
            if !matches!(e, KernelError::NotFound | KernelError::Poisoned) {
                deps.modules.record_failure(task.task_type);
            }
            deps.trace.write(
                task.tenant,
                EventKind::TaskFail,
                task.task_type as u16,
                task.seq,
                e.code(),
            );
            release_payload(&deps.alloc, &task);
            deps.metrics.inc(task.tenant, MetricId::TasksFailed, 1);
        }
    }
}

fn release_payload(alloc: &KernelAlloc, task: &Task) {
    if task.has_refcounted_payload() {
        if let Some(payload) = NonNull::new(task.payload_ptr as *mut u8) {
            // SAFETY: this task copy owned one reference to the payload.
            unsafe { alloc.payload_release(payload) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerResult;
    use crate::module::{HandlerDef, Module};
    use crate::platform::HostPlatform;
    use std::time::Instant;

    fn deps(workers: u32) -> (WorkerDeps, Arc<Scheduler>) {
        let platform: Arc<dyn Platform> = Arc::new(HostPlatform::new());
        let sched = Arc::new(Scheduler::new(workers).unwrap());
        let alloc = Arc::new(KernelAlloc::new(Arc::clone(&platform), 1024 * 1024).unwrap());
        let trace = Arc::new(Trace::new(Arc::clone(&platform), 1).unwrap());
        let metrics = Arc::new(Metrics::new(1).unwrap());
        let channels = Arc::new(ChannelRegistry::new(
            Arc::clone(&sched),
            Arc::clone(&alloc),
            Arc::clone(&trace),
            Arc::clone(&metrics),
        ));
        let modules = Arc::new(ModuleRegistry::new(
            Arc::clone(&channels),
            Arc::clone(&trace),
        ));
        (
            WorkerDeps {
                sched: Arc::clone(&sched),
                modules,
                alloc,
                channels,
                trace,
                metrics,
                platform,
            },
            sched,
        )
    }

    fn wait_until(deadline_ms: u64, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(deadline_ms) {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    static WORK_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn counting_handler(_ctx: &mut Ctx<'_>) -> HandlerResult {
        WORK_COUNTER.fetch_add(1, Ordering::Relaxed);
        Ok(Outcome::Done)
    }

    #[test]
    fn pool_dispatches_queued_tasks() {
        WORK_COUNTER.store(0, Ordering::Relaxed);
        let (deps, sched) = deps(2);
        deps.modules
            .register(Module::new("test", 1).with_handler(HandlerDef::new(1, counting_handler, "inc")))
            .unwrap();

        let mut pool = WorkerPool::new(2);
        pool.start(&deps).unwrap();

        for _ in 0..100 {
            sched.enqueue(Task::new(1), -1).unwrap();
        }

        assert!(
            wait_until(2000, || WORK_COUNTER.load(Ordering::Relaxed) >= 100),
            "all 100 tasks dispatched"
        );
        pool.stop();

        assert_eq!(WORK_COUNTER.load(Ordering::Relaxed), 100);
        assert_eq!(pool.tasks_done(), 100);
        assert_eq!(deps.metrics.get(MetricId::TasksDispatched), 100);
    }

    static PHASE_DONE: AtomicU64 = AtomicU64::new(0);

    fn yielding_handler(ctx: &mut Ctx<'_>) -> HandlerResult {
        if ctx.task.meta0 == 0 {
            ctx.task.meta1 = 42;
            ctx.yield_at(1)?;
            Ok(Outcome::Yielded)
        } else {
            assert_eq!(ctx.task.meta1, 42, "continuation state survives the yield");
            assert_eq!(ctx.task.yield_count, 1);
            PHASE_DONE.fetch_add(1, Ordering::Relaxed);
            Ok(Outcome::Done)
        }
    }

    #[test]
    fn two_phase_yield_completes() {
        PHASE_DONE.store(0, Ordering::Relaxed);
        let (deps, sched) = deps(2);
        deps.modules
            .register(Module::new("y", 1).with_handler(HandlerDef::new(2, yielding_handler, "two_phase")))
            .unwrap();

        let mut pool = WorkerPool::new(2);
        pool.start(&deps).unwrap();

        for _ in 0..10 {
            sched.enqueue(Task::new(2), -1).unwrap();
        }

        assert!(
            wait_until(2000, || PHASE_DONE.load(Ordering::Relaxed) >= 10),
            "all 10 tasks completed after their yield"
        );
        pool.stop();

        assert_eq!(deps.metrics.get(MetricId::TasksYielded), 10);
        assert_eq!(deps.metrics.get(MetricId::TasksDispatched), 20, "two passes per task");
    }

    fn failing_handler(_ctx: &mut Ctx<'_>) -> HandlerResult {
        Err(KernelError::Invalid)
    }

    #[test]
    fn failures_release_payloads_and_count() {
        let (deps, sched) = deps(1);
        deps.modules
            .register(Module::new("f", 1).with_handler(HandlerDef::new(3, failing_handler, "fail")))
            .unwrap();

        let mut pool = WorkerPool::new(1);
        pool.start(&deps).unwrap();

        let payload = deps.alloc.payload_alloc(64).unwrap();
        let task = Task::new(3).with_refcounted_payload(payload.as_ptr() as u64, 64);
        sched.enqueue(task, -1).unwrap();

        assert!(
            wait_until(2000, || deps.metrics.get(MetricId::TasksFailed) >= 1),
            "failure recorded"
        );
        pool.stop();

        assert_eq!(deps.alloc.stats().live(), 0, "payload released on failure");
        assert_eq!(deps.modules.fail_count(3), 1);
    }

    #[test]
    fn unregistered_type_never_accumulates_poison_state() {
        let (deps, sched) = deps(1);
        // No modules registered at all.
        let mut pool = WorkerPool::new(1);
        pool.start(&deps).unwrap();

        for _ in 0..20 {
            sched.enqueue(Task::new(77), -1).unwrap();
        }

        assert!(
            wait_until(2000, || deps.metrics.get(MetricId::TasksFailed) >= 20),
            "dispatches failed with NotFound"
        );
        pool.stop();

        assert_eq!(deps.modules.fail_count(77), 0);
        assert!(!deps.modules.is_poisoned(77));
    }

    #[test]
    fn workers_pick_up_due_events() {
        WORK_COUNTER.store(0, Ordering::Relaxed);
        let (deps, sched) = deps(1);
        deps.modules
            .register(Module::new("t", 1).with_handler(HandlerDef::new(1, counting_handler, "inc")))
            .unwrap();

        let mut pool = WorkerPool::new(1);
        pool.start(&deps).unwrap();

        sched.schedule_at(Task::new(1), 3).unwrap();

        // Not due yet at tick 0.
        assert!(!wait_until(50, || WORK_COUNTER.load(Ordering::Relaxed) > 0));

        pool.set_tick(3);
        assert!(
            wait_until(2000, || WORK_COUNTER.load(Ordering::Relaxed) == 1),
            "event dispatched once its tick arrived"
        );
        pool.stop();
    }

    #[test]
    fn stop_terminates_parked_workers() {
        let (deps, _sched) = deps(4);
        let mut pool = WorkerPool::new(4);
        pool.start(&deps).unwrap();

        // Let them all go idle, then stop; join must not hang.
        thread::sleep(Duration::from_millis(50));
        pool.stop();
        assert!(deps.metrics.get(MetricId::WorkerParks) > 0, "idle workers parked");
    }
}
