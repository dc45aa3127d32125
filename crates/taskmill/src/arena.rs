//! The arena: one contiguous platform-backed region.

use crate::config::CACHE_LINE;
use crate::error::KernelError;
use crate::platform::Platform;
use std::ptr::NonNull;
use std::sync::Arc;

/// One contiguous, cache-line-aligned, zeroed region acquired from the
/// platform at boot. The sub-allocators carve it up by fixed percentages;
/// the arena itself only owns the mapping and returns it on drop.
pub struct Arena {
    base: NonNull<u8>,
    size: usize,
    platform: Arc<dyn Platform>,
}

// SAFETY: the base pointer is owned by the arena; concurrent access to the
// region is governed by the sub-allocators built on top of it.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    pub fn new(platform: Arc<dyn Platform>, size: usize) -> Result<Self, KernelError> {
        if size == 0 {
            return Err(KernelError::Invalid);
        }
        let base = platform
            .alloc_aligned(size, CACHE_LINE)
            .ok_or(KernelError::NoMem)?;
        Ok(Self { base, size, platform })
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// True if `ptr` points inside the region.
    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        let base = self.base.as_ptr() as usize;
        addr >= base && addr < base + self.size
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // SAFETY: base/size/align are exactly what alloc_aligned returned.
        unsafe { self.platform.free(self.base, self.size, CACHE_LINE) };
    }
}
