//! Large-allocation records.
//!
//! Requests whose effective size exceeds the largest small size class are
//! served directly by the backing allocator and tracked in a hash map
//! keyed by base address. With metadata retention, freed records stay in
//! the map (marked `freed`) so later double frees are still caught.

use std::ptr::NonNull;

/// Metadata for one allocation served directly by the backing allocator.
pub(crate) struct LargeAlloc {
    /// Base address handed to the user.
    pub ptr: NonNull<u8>,
    /// Current length of the range.
    pub len: usize,
    /// Length the user actually asked for; drives the byte cap.
    pub requested_size: usize,
    /// Alignment the range was obtained with, as a base-2 logarithm.
    /// Needed to release the range when the unmap is deferred.
    pub log2_align: u8,
    /// Logically freed but retained for double-free detection.
    pub freed: bool,
    /// Call-site trace of the (most recent) allocation.
    pub alloc_trace: Box<[usize]>,
    /// Call-site trace of the free; captured when metadata is retained.
    pub free_trace: Box<[usize]>,
}

impl LargeAlloc {
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }
}
