//! Module registry: the flat dispatch table, handler lifecycle, and poison
//! detection.

use crate::alloc::KernelAlloc;
use crate::chan::{ChannelMode, ChannelRegistry, Guarantee};
use crate::config::{DEFAULT_MAX_YIELDS, MAX_HANDLERS, MAX_MODULES, POISON_THRESHOLD};
use crate::error::{result_code, HandlerResult, KernelError};
use crate::metrics::Metrics;
use crate::sched::Scheduler;
use crate::task::Task;
use crate::trace::{EventKind, Trace};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Packs a module version as `(major << 16) | (minor << 8) | patch`.
pub const fn version(major: u32, minor: u32, patch: u32) -> u32 {
    (major << 16) | (minor << 8) | patch
}

/// Handler flag: output depends only on the task record.
pub const HANDLER_DETERMINISTIC: u32 = 0x0004;
/// Handler flag: safe to dispatch more than once.
pub const HANDLER_IDEMPOTENT: u32 = 0x0008;

/// Channel declaration direction: the module emits onto the channel.
pub const DECL_PRODUCE: u32 = 0x0100;
/// Channel declaration direction: the module subscribes to the channel.
pub const DECL_CONSUME: u32 = 0x0200;

/// A task handler. Plain function pointer: dispatch stays O(1) with no
/// allocation on the hot path.
pub type HandlerFn = fn(&mut Ctx<'_>) -> HandlerResult;

/// Module init/fini hook, run under a boot/halt context.
pub type LifecycleFn = fn(&mut Ctx<'_>) -> Result<(), KernelError>;

/// One handler registration.
#[derive(Clone, Copy)]
pub struct HandlerDef {
    /// Task type this handler serves (must be unique across all modules).
    pub task_type: u32,
    pub func: HandlerFn,
    pub name: &'static str,
    pub flags: u32,
    /// Per-task yield budget; 0 selects the default of 16.
    pub max_yields: u16,
}

impl HandlerDef {
    pub fn new(task_type: u32, func: HandlerFn, name: &'static str) -> Self {
        Self {
            task_type,
            func,
            name,
            flags: 0,
            max_yields: 0,
        }
    }
}

/// A channel a module declares at registration. Declared channels are opened
/// if absent; CONSUME declarations subscribe the module.
#[derive(Clone, Copy)]
pub struct ChannelDecl {
    pub name: &'static str,
    pub direction: u32,
    pub msg_type: u32,
    pub mode: ChannelMode,
    pub guarantee: Guarantee,
}

/// A module: a named bundle of handlers and channel declarations with
/// lifecycle hooks.
pub struct Module {
    pub name: &'static str,
    pub version: u32,
    pub handlers: Vec<HandlerDef>,
    pub channels: Vec<ChannelDecl>,
    pub init: Option<LifecycleFn>,
    pub fini: Option<LifecycleFn>,
}

impl Module {
    pub fn new(name: &'static str, version: u32) -> Self {
        Self {
            name,
            version,
            handlers: Vec::new(),
            channels: Vec::new(),
            init: None,
            fini: None,
        }
    }

    pub fn with_handler(mut self, handler: HandlerDef) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn with_channel(mut self, decl: ChannelDecl) -> Self {
        self.channels.push(decl);
        self
    }

    pub fn with_init(mut self, f: LifecycleFn) -> Self {
        self.init = Some(f);
        self
    }

    pub fn with_fini(mut self, f: LifecycleFn) -> Self {
        self.fini = Some(f);
        self
    }
}

/// Everything a handler can reach while it runs.
pub struct Ctx<'a> {
    pub task: &'a mut Task,
    pub alloc: &'a KernelAlloc,
    pub channels: &'a ChannelRegistry,
    pub trace: &'a Trace,
    pub metrics: &'a Metrics,
    pub sched: &'a Scheduler,
    /// Executing worker, or `u32::MAX` for boot/halt contexts.
    pub worker_id: u32,
    /// Kernel tick at dispatch time.
    pub tick: u32,
    pub(crate) max_yields: u16,
}

impl Ctx<'_> {
    /// Re-queues the current task for another pass, subject to the handler's
    /// yield budget. On success the handler must return
    /// [`Outcome::Yielded`](crate::error::Outcome::Yielded).
    pub fn yield_now(&mut self) -> Result<(), KernelError> {
        self.sched
            .yield_task(*self.task, self.worker_id, self.max_yields)
    }

    /// Stores `phase` in `meta0` and yields. The continuation reads the
    /// phase back on its next dispatch.
    pub fn yield_at(&mut self, phase: u64) -> Result<(), KernelError> {
        self.task.meta0 = phase;
        self.yield_now()
    }

    /// Schedules a task to run once the kernel tick reaches `tick`.
    pub fn schedule_at(&self, task: Task, tick: u32) -> Result<(), KernelError> {
        self.sched.schedule_at(task, tick)
    }

    /// Emits a task onto a channel.
    pub fn emit(&self, channel: u32, task: Task) -> Result<(), KernelError> {
        self.channels.emit(channel, task)
    }
}

#[derive(Clone, Copy)]
struct DispatchEntry {
    func: HandlerFn,
    name: &'static str,
    max_yields: u16,
}

/// The module registry and dispatch table.
pub struct ModuleRegistry {
    /// Flat table indexed by task type. Entries are written during
    /// registration (before workers start) and only read afterwards.
    table: RwLock<Box<[Option<DispatchEntry>; MAX_HANDLERS]>>,
    fail_counts: Box<[AtomicU32]>,
    poisoned: Box<[AtomicBool]>,
    modules: Mutex<Vec<Module>>,
    channels: Arc<ChannelRegistry>,
    trace: Arc<Trace>,
}

impl ModuleRegistry {
    pub fn new(channels: Arc<ChannelRegistry>, trace: Arc<Trace>) -> Self {
        Self {
            table: RwLock::new(Box::new([None; MAX_HANDLERS])),
            fail_counts: (0..MAX_HANDLERS).map(|_| AtomicU32::new(0)).collect(),
            poisoned: (0..MAX_HANDLERS).map(|_| AtomicBool::new(false)).collect(),
            modules: Mutex::new(Vec::new()),
            channels,
            trace,
        }
    }

    /// Registers a module: validates and installs its handlers, then honors
    /// its channel declarations. Returns the module id.
    pub fn register(&self, module: Module) -> Result<u32, KernelError> {
        let mut modules = self.modules.lock();
        if modules.len() >= MAX_MODULES {
            return Err(KernelError::Full);
        }
        let module_id = modules.len() as u32;

        {
            let mut table = self.table.write();
            for h in &module.handlers {
                if h.task_type >= MAX_HANDLERS as u32 {
                    return Err(KernelError::Invalid);
                }
                if table[h.task_type as usize].is_some() {
                    return Err(KernelError::Exists);
                }
            }
            for h in &module.handlers {
                table[h.task_type as usize] = Some(DispatchEntry {
                    func: h.func,
                    name: h.name,
                    max_yields: if h.max_yields == 0 {
                        DEFAULT_MAX_YIELDS
                    } else {
                        h.max_yields
                    },
                });
            }
        }

        for decl in &module.channels {
            let id = match self.channels.find(decl.name) {
                Some(id) => id,
                None => self
                    .channels
                    .open(decl.name, decl.mode, decl.guarantee, decl.msg_type, 0)?,
            };
            if decl.direction & DECL_CONSUME != 0 {
                self.channels.subscribe(id, module_id, -1)?;
            }
        }

        modules.push(module);
        Ok(module_id)
    }

    /// Runs every module's `init` hook in registration order, stopping at
    /// the first failure.
    pub(crate) fn init_all(&self, ctx: &mut Ctx<'_>) -> Result<(), KernelError> {
        let modules = self.modules.lock();
        for module in modules.iter() {
            if let Some(init) = module.init {
                init(ctx)?;
            }
        }
        Ok(())
    }

    /// Runs every module's `fini` hook in reverse registration order.
    /// Failures are ignored; halt proceeds regardless.
    pub(crate) fn fini_all(&self, ctx: &mut Ctx<'_>) {
        let modules = self.modules.lock();
        for module in modules.iter().rev() {
            if let Some(fini) = module.fini {
                let _ = fini(ctx);
            }
        }
    }

    /// Dispatches the context's task to its handler.
    pub fn dispatch(&self, ctx: &mut Ctx<'_>) -> HandlerResult {
        let ty = ctx.task.task_type as usize;
        if ty >= MAX_HANDLERS {
            return Err(KernelError::NotFound);
        }
        let Some(entry) = self.table.read()[ty] else {
            return Err(KernelError::NotFound);
        };

        if self.poisoned[ty].load(Ordering::Acquire) {
            self.trace.write(
                ctx.task.tenant,
                EventKind::Poison,
                ty as u16,
                ty as u32,
                self.fail_counts[ty].load(Ordering::Relaxed),
            );
            return Err(KernelError::Poisoned);
        }

        ctx.max_yields = entry.max_yields;

        self.trace.write(
            ctx.task.tenant,
            EventKind::TaskStart,
            ty as u16,
            ctx.task.seq,
            0,
        );
        let result = (entry.func)(ctx);
        self.trace.write(
            ctx.task.tenant,
            EventKind::TaskEnd,
            ty as u16,
            ctx.task.seq,
            result_code(&result),
        );

        result
    }

    /// Records a handler failure; latches the poison flag at the threshold.
    pub fn record_failure(&self, task_type: u32) {
        let ty = task_type as usize;
        if ty >= MAX_HANDLERS {
            return;
        }
        let count = self.fail_counts[ty].fetch_add(1, Ordering::Relaxed) + 1;
        if count >= POISON_THRESHOLD && !self.poisoned[ty].load(Ordering::Relaxed) {
            self.poisoned[ty].store(true, Ordering::Release);
            self.trace
                .write(0, EventKind::Poison, ty as u16, task_type, count);
        }
    }

    pub fn is_poisoned(&self, task_type: u32) -> bool {
        self.poisoned
            .get(task_type as usize)
            .is_some_and(|p| p.load(Ordering::Acquire))
    }

    /// Clears the poison latch and failure count for a type.
    pub fn reset_poison(&self, task_type: u32) {
        let ty = task_type as usize;
        if ty >= MAX_HANDLERS {
            return;
        }
        self.poisoned[ty].store(false, Ordering::Release);
        self.fail_counts[ty].store(0, Ordering::Relaxed);
    }

    pub fn fail_count(&self, task_type: u32) -> u32 {
        self.fail_counts
            .get(task_type as usize)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Name of the handler registered for a type, if any.
    pub fn handler_name(&self, task_type: u32) -> Option<&'static str> {
        let ty = task_type as usize;
        if ty >= MAX_HANDLERS {
            return None;
        }
        self.table.read()[ty].map(|e| e.name)
    }

    pub fn module_count(&self) -> u32 {
        self.modules.lock().len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Outcome;
    use crate::metrics::Metrics;
    use crate::platform::HostPlatform;

    struct Fixture {
        alloc: Arc<KernelAlloc>,
        channels: Arc<ChannelRegistry>,
        trace: Arc<Trace>,
        metrics: Arc<Metrics>,
        sched: Arc<Scheduler>,
        reg: ModuleRegistry,
    }

    fn fixture() -> Fixture {
        let platform: Arc<dyn crate::platform::Platform> = Arc::new(HostPlatform::new());
        let sched = Arc::new(Scheduler::new(2).unwrap());
        let alloc = Arc::new(KernelAlloc::new(Arc::clone(&platform), 1024 * 1024).unwrap());
        let trace = Arc::new(Trace::new(Arc::clone(&platform), 1).unwrap());
        let metrics = Arc::new(Metrics::new(1).unwrap());
        let channels = Arc::new(ChannelRegistry::new(
            Arc::clone(&sched),
            Arc::clone(&alloc),
            Arc::clone(&trace),
            Arc::clone(&metrics),
        ));
        let reg = ModuleRegistry::new(Arc::clone(&channels), Arc::clone(&trace));
        Fixture {
            alloc,
            channels,
            trace,
            metrics,
            sched,
            reg,
        }
    }

    fn dispatch_one(f: &Fixture, task: &mut Task) -> HandlerResult {
        let mut ctx = Ctx {
            task,
            alloc: &f.alloc,
            channels: &f.channels,
            trace: &f.trace,
            metrics: &f.metrics,
            sched: &f.sched,
            worker_id: 0,
            tick: 0,
            max_yields: DEFAULT_MAX_YIELDS,
        };
        f.reg.dispatch(&mut ctx)
    }

    fn ok_handler(_ctx: &mut Ctx<'_>) -> HandlerResult {
        Ok(Outcome::Done)
    }

    fn failing_handler(_ctx: &mut Ctx<'_>) -> HandlerResult {
        Err(KernelError::Invalid)
    }

    fn meta_handler(ctx: &mut Ctx<'_>) -> HandlerResult {
        ctx.task.meta1 = ctx.task.meta0 + 1;
        Ok(Outcome::Done)
    }

    #[test]
    fn register_and_dispatch() {
        let f = fixture();
        f.reg
            .register(
                Module::new("echo", version(1, 0, 0))
                    .with_handler(HandlerDef::new(1, ok_handler, "ok"))
                    .with_handler(HandlerDef::new(2, meta_handler, "meta")),
            )
            .unwrap();

        assert_eq!(f.reg.handler_name(1), Some("ok"));
        assert_eq!(f.reg.handler_name(3), None);

        let mut t = Task::new(2).with_meta(41, 0);
        assert_eq!(dispatch_one(&f, &mut t), Ok(Outcome::Done));
        assert_eq!(t.meta1, 42, "handler mutations are visible to the worker");
    }

    #[test]
    fn duplicate_type_rejected_across_modules() {
        let f = fixture();
        f.reg
            .register(Module::new("a", 1).with_handler(HandlerDef::new(5, ok_handler, "a5")))
            .unwrap();

        let err = f
            .reg
            .register(Module::new("b", 1).with_handler(HandlerDef::new(5, ok_handler, "b5")))
            .unwrap_err();
        assert_eq!(err, KernelError::Exists);
    }

    #[test]
    fn unknown_type_is_not_found() {
        let f = fixture();
        let mut t = Task::new(200);
        assert_eq!(dispatch_one(&f, &mut t), Err(KernelError::NotFound));

        let mut t = Task::new(MAX_HANDLERS as u32 + 7);
        assert_eq!(dispatch_one(&f, &mut t), Err(KernelError::NotFound));
    }

    #[test]
    fn poison_latches_at_threshold() {
        let f = fixture();
        f.reg
            .register(Module::new("bad", 1).with_handler(HandlerDef::new(9, failing_handler, "bad")))
            .unwrap();

        for i in 0..POISON_THRESHOLD {
            assert!(!f.reg.is_poisoned(9), "not poisoned before failure {i}");
            let mut t = Task::new(9);
            assert_eq!(dispatch_one(&f, &mut t), Err(KernelError::Invalid));
            f.reg.record_failure(9);
        }

        assert!(f.reg.is_poisoned(9));
        let mut t = Task::new(9);
        assert_eq!(dispatch_one(&f, &mut t), Err(KernelError::Poisoned));

        f.reg.reset_poison(9);
        assert!(!f.reg.is_poisoned(9));
        assert_eq!(f.reg.fail_count(9), 0);
        let mut t = Task::new(9);
        assert_eq!(dispatch_one(&f, &mut t), Err(KernelError::Invalid));
    }

    #[test]
    fn channel_declarations_open_and_subscribe() {
        let f = fixture();
        f.reg
            .register(
                Module::new("net", 1)
                    .with_handler(HandlerDef::new(30, ok_handler, "rx"))
                    .with_channel(ChannelDecl {
                        name: "net.rx",
                        direction: DECL_CONSUME,
                        msg_type: 30,
                        mode: ChannelMode::P2p,
                        guarantee: Guarantee::Lossless,
                    }),
            )
            .unwrap();

        let id = f.channels.find("net.rx").expect("declared channel opened");
        // The module subscribed, so a P2P channel is now bound.
        assert_eq!(f.channels.subscribe(id, 9, -1), Err(KernelError::AlreadyBound));
    }

    #[test]
    fn init_runs_in_order_fini_in_reverse() {
        use std::sync::atomic::{AtomicU64, Ordering};
        static LOG: AtomicU64 = AtomicU64::new(0);

        fn push_digit(d: u64) {
            // Order-sensitive log: each hook appends a digit.
            let _ = LOG.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v * 10 + d));
        }
        fn init_a(_: &mut Ctx<'_>) -> Result<(), KernelError> {
            push_digit(1);
            Ok(())
        }
        fn init_b(_: &mut Ctx<'_>) -> Result<(), KernelError> {
            push_digit(2);
            Ok(())
        }
        fn fini_a(_: &mut Ctx<'_>) -> Result<(), KernelError> {
            push_digit(3);
            Ok(())
        }
        fn fini_b(_: &mut Ctx<'_>) -> Result<(), KernelError> {
            push_digit(4);
            Ok(())
        }

        LOG.store(0, Ordering::SeqCst);
        let f = fixture();
        f.reg
            .register(Module::new("a", 1).with_init(init_a).with_fini(fini_a))
            .unwrap();
        f.reg
            .register(Module::new("b", 1).with_init(init_b).with_fini(fini_b))
            .unwrap();

        let mut scratch = Task::new(0);
        let mut ctx = Ctx {
            task: &mut scratch,
            alloc: &f.alloc,
            channels: &f.channels,
            trace: &f.trace,
            metrics: &f.metrics,
            sched: &f.sched,
            worker_id: u32::MAX,
            tick: 0,
            max_yields: DEFAULT_MAX_YIELDS,
        };
        f.reg.init_all(&mut ctx).unwrap();
        f.reg.fini_all(&mut ctx);

        // init: a then b (1, 2); fini: b then a (4, 3).
        assert_eq!(LOG.load(Ordering::SeqCst), 1243);
    }
}
