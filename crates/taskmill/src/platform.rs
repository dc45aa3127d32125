//! Platform interface: memory, monotonic clock, worker wake signals.
//!
//! The kernel reaches the machine only through this trait, injected at boot,
//! so a hosted deployment (OS threads, `std::alloc`) and a bare-metal
//! deployment (affinitized CPUs, physical frames, IPIs) plug in without
//! touching the core. It is deliberately not a process-wide singleton;
//! multiple kernels can coexist on different platform instances.

use parking_lot::RwLock;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Instant;

/// Callback that wakes one parked worker.
pub type WakeFn = Arc<dyn Fn() + Send + Sync>;

/// Host-provided services the kernel depends on.
pub trait Platform: Send + Sync {
    /// Allocates `size` zeroed bytes at the given alignment. Returns `None`
    /// when the platform is out of memory.
    fn alloc_aligned(&self, size: usize, align: usize) -> Option<NonNull<u8>>;

    /// Returns memory obtained from [`alloc_aligned`](Platform::alloc_aligned).
    ///
    /// # Safety
    ///
    /// `ptr` must have come from `alloc_aligned` on this platform with the
    /// same `size` and `align`, and must not be used afterwards.
    unsafe fn free(&self, ptr: NonNull<u8>, size: usize, align: usize);

    /// Monotonic counter; never decreases. Units are platform-defined
    /// (nanoseconds hosted, TSC ticks bare-metal).
    fn monotonic_counter(&self) -> u64;

    /// Idempotent wake signal for a parked worker. Waking a running worker
    /// is a no-op.
    fn wake_worker(&self, worker_id: u32);

    /// Called by the worker pool at start so the platform can route
    /// [`wake_worker`](Platform::wake_worker) to the right parked thread.
    /// Platforms with a hardware wake path (IPIs) may ignore this.
    fn register_waker(&self, worker_id: u32, waker: WakeFn) {
        let _ = (worker_id, waker);
    }
}

/// Hosted platform: heap memory, `Instant`-based clock, condvar wakes routed
/// through registered wakers.
pub struct HostPlatform {
    epoch: Instant,
    wakers: RwLock<Vec<Option<WakeFn>>>,
}

impl HostPlatform {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            wakers: RwLock::new(Vec::new()),
        }
    }
}

impl Default for HostPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for HostPlatform {
    fn alloc_aligned(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size.max(1), align).ok()?;
        // SAFETY: layout has nonzero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        NonNull::new(ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        if let Ok(layout) = Layout::from_size_align(size.max(1), align) {
            // SAFETY: caller contract; ptr came from alloc_aligned with
            // this size and alignment.
            unsafe { dealloc(ptr.as_ptr(), layout) };
        }
    }

    fn monotonic_counter(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn wake_worker(&self, worker_id: u32) {
        let wakers = self.wakers.read();
        if let Some(Some(wake)) = wakers.get(worker_id as usize) {
            wake();
        }
    }

    fn register_waker(&self, worker_id: u32, waker: WakeFn) {
        let mut wakers = self.wakers.write();
        let idx = worker_id as usize;
        if wakers.len() <= idx {
            wakers.resize_with(idx + 1, || None);
        }
        wakers[idx] = Some(waker);
    }
}
