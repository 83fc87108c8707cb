//! Façade over the page-granularity backing allocator.

use std::ptr::NonNull;

/// Source of raw memory behind the allocator.
///
/// Implementations hand out byte ranges at an explicit alignment and may
/// fail. The page size must be constant for the lifetime of the process;
/// it is read once at the heap's first use.
///
/// Alignments are passed as base-2 logarithms throughout, matching the
/// rest of the crate.
pub trait BackingAllocator {
    /// System page size in bytes. Always a power of two.
    fn page_size(&self) -> usize;

    /// Allocates `len` bytes aligned to `1 << log2_align`.
    ///
    /// Returns `None` on exhaustion. `ret_addr` roots any trace the
    /// implementation wants to capture; 0 means unknown.
    fn raw_alloc(&self, len: usize, log2_align: u8, ret_addr: usize) -> Option<NonNull<u8>>;

    /// Tries to resize a range in place, keeping the base address.
    ///
    /// Returns `false` without touching the range when the resize cannot
    /// be honored.
    ///
    /// # Safety
    ///
    /// `ptr`, `old_len` and `log2_align` must describe a range previously
    /// returned by [`raw_alloc`](Self::raw_alloc) and not yet freed.
    unsafe fn raw_resize(
        &self,
        ptr: NonNull<u8>,
        old_len: usize,
        log2_align: u8,
        new_len: usize,
        ret_addr: usize,
    ) -> bool;

    /// Releases a range.
    ///
    /// # Safety
    ///
    /// `ptr`, `len` and `log2_align` must describe a range previously
    /// returned by [`raw_alloc`](Self::raw_alloc) (as possibly adjusted by
    /// successful [`raw_resize`](Self::raw_resize) calls) and not yet
    /// freed.
    unsafe fn raw_free(&self, ptr: NonNull<u8>, len: usize, log2_align: u8, ret_addr: usize);
}

/// The default backing allocator: anonymous pages from the operating
/// system via [`sys_pages`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SysPages;

impl BackingAllocator for SysPages {
    fn page_size(&self) -> usize {
        sys_pages::page_size()
    }

    fn raw_alloc(&self, len: usize, log2_align: u8, _ret_addr: usize) -> Option<NonNull<u8>> {
        let align = 1usize.checked_shl(u32::from(log2_align))?;
        sys_pages::map(len, align).ok()
    }

    unsafe fn raw_resize(
        &self,
        ptr: NonNull<u8>,
        old_len: usize,
        _log2_align: u8,
        new_len: usize,
        _ret_addr: usize,
    ) -> bool {
        // SAFETY: contract forwarded from the caller.
        unsafe { sys_pages::remap(ptr, old_len, new_len) }
    }

    unsafe fn raw_free(&self, ptr: NonNull<u8>, len: usize, _log2_align: u8, _ret_addr: usize) {
        // SAFETY: contract forwarded from the caller.
        unsafe { sys_pages::unmap(ptr, len) }
    }
}
