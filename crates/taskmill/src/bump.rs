//! Bump allocator: atomic offset, whole-region reset.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

/// Lock-free transient allocator. `alloc` fetch-adds the offset and rolls
/// back on overflow; `reset` returns the offset to zero. Individual frees do
/// not exist; the region is recycled wholesale, per tick.
pub struct BumpAlloc {
    base: *mut u8,
    region_len: usize,
    offset: AtomicU32,
    high_water: AtomicU32,
}

// SAFETY: disjoint ranges are handed out by the atomic offset; the base
// pointer itself is never mutated.
unsafe impl Send for BumpAlloc {}
unsafe impl Sync for BumpAlloc {}

impl BumpAlloc {
    pub fn new(base: *mut u8, region_len: usize) -> Self {
        Self {
            base,
            region_len,
            offset: AtomicU32::new(0),
            high_water: AtomicU32::new(0),
        }
    }

    /// Allocates `size` bytes (rounded up to 8). Returns `None` when the
    /// region is exhausted.
    pub fn alloc(&self, size: u32) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let size = (size + 7) & !7;

        let start = self.offset.fetch_add(size, Ordering::Relaxed);
        let end = start as usize + size as usize;
        if end > self.region_len {
            // Roll back the reservation; concurrent allocs may interleave
            // here, but every failed reservation subtracts exactly what it
            // added, so the offset converges.
            self.offset.fetch_sub(size, Ordering::Relaxed);
            return None;
        }

        self.high_water.fetch_max(end as u32, Ordering::Relaxed);
        // SAFETY: [start, end) is within the region and reserved for this
        // caller alone.
        NonNull::new(unsafe { self.base.add(start as usize) })
    }

    /// Recycles the whole region. Callers must ensure no outstanding bump
    /// allocations are still referenced.
    pub fn reset(&self) {
        self.offset.store(0, Ordering::Release);
    }

    /// Bytes currently consumed.
    #[inline]
    pub fn used(&self) -> u32 {
        self.offset.load(Ordering::Relaxed)
    }

    /// Peak bytes consumed since construction.
    #[inline]
    pub fn high_water(&self) -> u32 {
        self.high_water.load(Ordering::Relaxed)
    }

    /// True if `ptr` falls inside the bump region.
    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        let base = self.base as usize;
        addr >= base && addr < base + self.region_len
    }
}
