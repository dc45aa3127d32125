//! Unified kernel allocator: arena split into slab / slab / block / bump,
//! plus the refcounted payload discipline.
//!
//! Region layout (fixed percentages of the arena, each start cache-line
//! aligned):
//!
//! ```text
//! | task slab 10% | trace slab 2% | block bins 68% | bump 20% |
//! ```
//!
//! `free` dispatches to the owning sub-allocator by address-range
//! containment; bump memory is never individually freed.

use crate::arena::Arena;
use crate::block::{BlockAlloc, BLOCK_MAX_SIZE};
use crate::bump::BumpAlloc;
use crate::config::CACHE_LINE;
use crate::error::KernelError;
use crate::platform::Platform;
use crate::slab::Slab;
use crate::task::{Task, TraceEvent};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Header written immediately before every refcounted payload.
#[repr(C)]
struct PayloadHeader {
    refcount: AtomicU32,
    /// Payload data size, excluding this header.
    size: u32,
}

const PAYLOAD_HEADER_SIZE: u32 = std::mem::size_of::<PayloadHeader>() as u32;
const _: () = assert!(PAYLOAD_HEADER_SIZE == 8);

/// Point-in-time usage snapshot, used for leak checks at halt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocStats {
    pub task_slab_used: u32,
    pub trace_slab_used: u32,
    pub block_objects: u32,
    pub bump_used: u32,
    pub alloc_bytes: u64,
    pub alloc_fails: u64,
}

impl AllocStats {
    /// Live allocations across every sub-allocator. Zero at a clean halt.
    pub fn live(&self) -> u64 {
        u64::from(self.task_slab_used)
            + u64::from(self.trace_slab_used)
            + u64::from(self.block_objects)
            + u64::from(self.bump_used)
    }
}

/// The kernel allocator.
pub struct KernelAlloc {
    arena: Arena,
    task_slab: Slab,
    trace_slab: Slab,
    block: BlockAlloc,
    bump: BumpAlloc,
    alloc_bytes: AtomicU64,
    alloc_fails: AtomicU64,
}

impl KernelAlloc {
    pub fn new(platform: Arc<dyn Platform>, arena_size: usize) -> Result<Self, KernelError> {
        let arena = Arena::new(platform, arena_size)?;
        let base = arena.base();

        // Keep every region start cache-line aligned so slab strides (48,
        // 32, and the power-of-two bins) preserve their objects' alignment.
        let usable = arena_size & !(CACHE_LINE - 1);
        let task_len = (usable / 10) & !(CACHE_LINE - 1);
        let trace_len = (usable * 2 / 100) & !(CACHE_LINE - 1);
        let bump_len = (usable / 5) & !(CACHE_LINE - 1);
        let block_len = usable - task_len - trace_len - bump_len;

        // SAFETY: the four offsets partition [0, usable) ⊆ the arena.
        let (task_base, trace_base, block_base, bump_base) = unsafe {
            (
                base,
                base.add(task_len),
                base.add(task_len + trace_len),
                base.add(task_len + trace_len + block_len),
            )
        };

        Ok(Self {
            arena,
            task_slab: Slab::new(task_base, task_len, std::mem::size_of::<Task>() as u32),
            trace_slab: Slab::new(trace_base, trace_len, std::mem::size_of::<TraceEvent>() as u32),
            block: BlockAlloc::new(block_base, block_len),
            bump: BumpAlloc::new(bump_base, bump_len),
            alloc_bytes: AtomicU64::new(0),
            alloc_fails: AtomicU64::new(0),
        })
    }

    /// Allocates `size` bytes, routing task-record and trace-record sizes to
    /// their dedicated slabs and everything else up to 64 KiB to the block
    /// bins.
    pub fn alloc(&self, size: u32) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }

        let ptr = if size as usize == std::mem::size_of::<Task>() {
            self.task_slab.alloc().or_else(|| self.block.alloc(size))
        } else if size as usize == std::mem::size_of::<TraceEvent>() {
            self.trace_slab.alloc().or_else(|| self.block.alloc(size))
        } else if size <= BLOCK_MAX_SIZE {
            self.block.alloc(size)
        } else {
            None
        };

        match ptr {
            Some(p) => {
                self.alloc_bytes.fetch_add(u64::from(size), Ordering::Relaxed);
                Some(p)
            }
            None => {
                self.alloc_fails.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Returns an allocation to whichever sub-allocator owns its address.
    /// Bump memory and foreign pointers are ignored.
    pub fn free(&self, ptr: NonNull<u8>, size: u32) {
        let raw = ptr.as_ptr();
        if self.task_slab.contains(raw) {
            self.task_slab.free(ptr);
        } else if self.trace_slab.contains(raw) {
            self.trace_slab.free(ptr);
        } else if self.block.contains(raw) {
            self.block.free(ptr, size);
        }
        // Bump region: recycled only via reset.
    }

    /// Transient allocation from the bump region.
    pub fn bump_alloc(&self, size: u32) -> Option<NonNull<u8>> {
        self.bump.alloc(size)
    }

    /// Recycles the bump region (intended per tick).
    pub fn bump_reset(&self) {
        self.bump.reset();
    }

    /// Allocates a refcounted payload of `size` bytes with its count at 1.
    /// Returns the data pointer (just past the header).
    pub fn payload_alloc(&self, size: u32) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let mem = self.alloc(PAYLOAD_HEADER_SIZE + size)?;

        // SAFETY: mem has room for the header and is at least 8-aligned
        // (every sub-allocator hands out 8-aligned objects).
        unsafe {
            mem.as_ptr().cast::<PayloadHeader>().write(PayloadHeader {
                refcount: AtomicU32::new(1),
                size,
            });
            NonNull::new(mem.as_ptr().add(PAYLOAD_HEADER_SIZE as usize))
        }
    }

    /// Decrements a payload's reference count, freeing the backing block
    /// when it reaches zero. Returns `true` if this call freed it.
    ///
    /// # Safety
    ///
    /// `payload` must have come from [`payload_alloc`](Self::payload_alloc)
    /// on this allocator and hold a reference the caller owns.
    pub unsafe fn payload_release(&self, payload: NonNull<u8>) -> bool {
        // SAFETY: caller contract; a live header sits just before the data.
        let hdr = unsafe { &*payload.as_ptr().sub(PAYLOAD_HEADER_SIZE as usize).cast::<PayloadHeader>() };
        let old = hdr.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(old != 0, "payload refcount underflow");

        if old == 1 {
            let size = hdr.size;
            // SAFETY: last reference; nobody else can observe the block.
            let block = unsafe {
                NonNull::new_unchecked(payload.as_ptr().sub(PAYLOAD_HEADER_SIZE as usize))
            };
            self.free(block, PAYLOAD_HEADER_SIZE + size);
            true
        } else {
            false
        }
    }

    /// Current refcount of a payload, for tests and diagnostics.
    ///
    /// # Safety
    ///
    /// `payload` must be a live pointer from [`payload_alloc`](Self::payload_alloc).
    pub unsafe fn payload_refcount(payload: NonNull<u8>) -> u32 {
        // SAFETY: caller contract.
        let hdr = unsafe { &*payload.as_ptr().sub(PAYLOAD_HEADER_SIZE as usize).cast::<PayloadHeader>() };
        hdr.refcount.load(Ordering::Acquire)
    }

    /// Total bytes successfully allocated (monotonic).
    #[inline]
    pub fn alloc_bytes(&self) -> u64 {
        self.alloc_bytes.load(Ordering::Relaxed)
    }

    /// Total failed allocations (monotonic).
    #[inline]
    pub fn alloc_fails(&self) -> u64 {
        self.alloc_fails.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> AllocStats {
        AllocStats {
            task_slab_used: self.task_slab.used(),
            trace_slab_used: self.trace_slab.used(),
            block_objects: self.block.live_objects(),
            bump_used: self.bump.used(),
            alloc_bytes: self.alloc_bytes(),
            alloc_fails: self.alloc_fails(),
        }
    }

    /// The backing arena, for range diagnostics.
    pub fn arena(&self) -> &Arena {
        &self.arena
    }
}

/// Adds a reference to a payload on behalf of an additional task copy.
///
/// # Safety
///
/// `payload` must be a live pointer from
/// [`KernelAlloc::payload_alloc`].
pub unsafe fn payload_retain(payload: NonNull<u8>) {
    // SAFETY: caller contract; a live header sits just before the data.
    let hdr = unsafe { &*payload.as_ptr().sub(PAYLOAD_HEADER_SIZE as usize).cast::<PayloadHeader>() };
    hdr.refcount.fetch_add(1, Ordering::Relaxed);
}
