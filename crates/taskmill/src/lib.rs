//! taskmill: a CPU-resident task-dispatch microkernel.
//!
//! A multi-worker, priority-aware, channel-connected task scheduler designed
//! to run hosted on OS threads or bare-metal on SMP hardware. The kernel
//! accepts small fixed-size task records, routes them through a two-level
//! ready system (global priority rings + per-worker local queues), dispatches
//! them to registered handlers through a flat O(1) table, and moves messages
//! between handlers via typed channels with backpressure and dead-lettering.
//! All memory comes from one arena carved into slab, power-of-two block, and
//! bump sub-allocators; payloads shared across fan-out copies carry an
//! explicit atomic refcount header.
//!
//! The machine is reached only through the [`Platform`] trait (memory, a
//! monotonic counter, worker wake signals), injected at boot, so multiple
//! kernels can coexist and the same core runs under threads or IPIs.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use taskmill::{
//!     BootConfig, Ctx, HandlerDef, HandlerResult, HostPlatform, Kernel, MetricId, Module,
//!     Outcome, Task,
//! };
//!
//! fn echo(_ctx: &mut Ctx<'_>) -> HandlerResult {
//!     Ok(Outcome::Done)
//! }
//!
//! let module = Module::new("echo", taskmill::module::version(1, 0, 0))
//!     .with_handler(HandlerDef::new(1, echo, "echo"));
//!
//! let cfg = BootConfig::new().with_arena_size(1024 * 1024).with_workers(2);
//! let mut kernel = Kernel::boot(cfg, vec![module], Arc::new(HostPlatform::new())).unwrap();
//!
//! kernel.submit(Task::new(1)).unwrap();
//! # std::thread::sleep(std::time::Duration::from_millis(50));
//! assert!(kernel.metric(MetricId::TasksEnqueued) >= 1);
//! kernel.halt();
//! ```

pub mod alloc;
mod arena;
mod block;
mod bump;
pub mod chan;
pub mod config;
mod error;
mod evq;
mod kernel;
mod lq;
pub mod metrics;
pub mod module;
mod platform;
mod rq;
mod sched;
mod slab;
mod task;
pub mod trace;
mod worker;

pub use alloc::{AllocStats, KernelAlloc};
pub use arena::Arena;
pub use chan::{ChannelMode, ChannelRegistry, Guarantee, Subscriber, CHAN_DEAD_LETTER, CHAN_DIRECT};
pub use config::BootConfig;
pub use error::{HandlerResult, KernelError, Outcome};
pub use evq::EventQueue;
pub use kernel::Kernel;
pub use lq::LocalQueue;
pub use metrics::{MetricId, Metrics};
pub use module::{ChannelDecl, Ctx, HandlerDef, HandlerFn, Module, ModuleRegistry};
pub use platform::{HostPlatform, Platform, WakeFn};
pub use rq::ReadyQueue;
pub use sched::Scheduler;
pub use task::{Priority, Task, TraceEvent};
pub use trace::{EventKind, Trace, TraceLevel};
