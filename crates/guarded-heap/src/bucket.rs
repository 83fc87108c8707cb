//! Size-class bucket engine.
//!
//! A bucket is one page bound to a single power-of-two size class,
//! divided into `page_size / size_class` slots. Slots are claimed by a
//! cursor that only advances; freed slots are never handed out again, so
//! a stale pointer into a bucket never aliases a younger allocation. A
//! bucket whose cursor is exhausted keeps serving frees until its last
//! slot dies, then it is retired.
//!
//! Bucket metadata lives in a separate variable-length block from the
//! backing allocator, not on the page: the fixed [`BucketHeader`]
//! followed by the used-bit bytes, the per-slot requested sizes and
//! alignments (when safety is on), and the per-slot trace words (when
//! trace recording is on). [`BucketLayout`] computes the offsets.

use std::collections::BTreeMap;
use std::mem;
use std::ptr::{self, NonNull};
use std::slice;

use crate::backing::BackingAllocator;
use crate::heap::Config;
use crate::trace::{self, TraceKind};

/// Slot index within a bucket. Wide enough for a one-byte size class on
/// 64 KiB pages.
pub(crate) type SlotIndex = u32;

// ============================================================================
// BucketHeader - fixed head of the metadata block
// ============================================================================

/// Fixed head of a bucket's metadata block.
#[repr(C)]
pub(crate) struct BucketHeader {
    /// The managed page, aligned to the page size.
    pub page: NonNull<u8>,
    /// Next never-issued slot index; monotone non-decreasing.
    ///
    /// Retired buckets kept for double-free detection repurpose this
    /// field as the slot count, from which the size class is recovered.
    pub alloc_cursor: SlotIndex,
    /// Number of live slots.
    pub used_count: SlotIndex,
}

// ============================================================================
// BucketLayout - offsets into the metadata block
// ============================================================================

const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Computed offsets into the metadata block for one size class under one
/// configuration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BucketLayout {
    /// Slot size in bytes; a power of two below the page size.
    pub size_class: usize,
    /// Slots per page for this size class.
    pub slot_count: SlotIndex,
    /// Captured trace depth; 0 disables the trace region.
    pub frames: usize,
    /// Whether the sizes/alignments regions exist.
    pub safety: bool,
    /// Total block length in bytes.
    pub total: usize,
    used_bits: usize,
    sizes: usize,
    aligns: usize,
    traces: usize,
}

impl BucketLayout {
    pub fn new(size_class: usize, page_size: usize, config: &Config) -> Self {
        debug_assert!(size_class.is_power_of_two() && size_class < page_size);
        let slot_count = page_size / size_class;
        let mut end = mem::size_of::<BucketHeader>();

        let used_bits = end;
        end += slot_count.div_ceil(8);

        let (sizes, aligns) = if config.safety {
            end = align_up(end, mem::align_of::<u32>());
            let sizes = end;
            end += slot_count * mem::size_of::<u32>();
            let aligns = end;
            end += slot_count;
            (sizes, aligns)
        } else {
            (0, 0)
        };

        let frames = config.stack_trace_frames;
        let traces = if frames > 0 {
            end = align_up(end, mem::align_of::<usize>());
            let traces = end;
            end += slot_count * 2 * frames * mem::size_of::<usize>();
            traces
        } else {
            0
        };

        #[allow(clippy::cast_possible_truncation)]
        let slot_count = slot_count as SlotIndex;
        Self {
            size_class,
            slot_count,
            frames,
            safety: config.safety,
            total: end,
            used_bits,
            sizes,
            aligns,
            traces,
        }
    }

    /// Recovers the layout of a retired bucket from its repurposed cursor.
    pub fn from_slot_count(slot_count: SlotIndex, page_size: usize, config: &Config) -> Self {
        Self::new(page_size / slot_count as usize, page_size, config)
    }
}

// ============================================================================
// Bucket - handle to one metadata block
// ============================================================================

/// Handle to one bucket's metadata block.
///
/// A plain copyable pointer. The heap owns the lifecycle: a handle is
/// valid from [`Bucket::create`] until [`Bucket::destroy`], and all
/// access happens under the heap mutex.
#[derive(Clone, Copy)]
pub(crate) struct Bucket {
    header: NonNull<BucketHeader>,
}

impl Bucket {
    /// Obtains a fresh page and metadata block from the backing
    /// allocator. Returns `None` when either allocation fails; nothing is
    /// left behind in that case.
    pub fn create<B: BackingAllocator>(
        backing: &B,
        layout: &BucketLayout,
        page_size: usize,
        ret_addr: usize,
    ) -> Option<Self> {
        #[allow(clippy::cast_possible_truncation)]
        let log2_page = page_size.trailing_zeros() as u8;
        let page = backing.raw_alloc(page_size, log2_page, ret_addr)?;
        let Some(block) = backing.raw_alloc(layout.total, log2_block_align(), ret_addr) else {
            // SAFETY: the page was just obtained from this backing allocator.
            unsafe { backing.raw_free(page, page_size, log2_page, ret_addr) };
            return None;
        };

        let header = block.cast::<BucketHeader>();
        // SAFETY: the block is live, writable, and aligned for BucketHeader.
        unsafe {
            header.as_ptr().write(BucketHeader {
                page,
                alloc_cursor: 0,
                used_count: 0,
            });
            let bytes = block.as_ptr();
            ptr::write_bytes(
                bytes.add(layout.used_bits),
                0,
                (layout.slot_count as usize).div_ceil(8),
            );
            if layout.safety {
                ptr::write_bytes(
                    bytes.add(layout.sizes),
                    0,
                    layout.slot_count as usize * mem::size_of::<u32>(),
                );
            }
        }
        Some(Self { header })
    }

    /// Releases the metadata block.
    ///
    /// # Safety
    ///
    /// `layout` must match the layout the bucket was created with, and no
    /// copy of this handle may be used afterwards. The page must already
    /// have been released or deliberately leaked.
    pub unsafe fn destroy<B: BackingAllocator>(
        self,
        backing: &B,
        layout: &BucketLayout,
        ret_addr: usize,
    ) {
        // SAFETY: the block came from this backing allocator with this length.
        unsafe {
            backing.raw_free(self.header.cast(), layout.total, log2_block_align(), ret_addr);
        }
    }

    fn region(&self, offset: usize) -> *mut u8 {
        // Derived from the block base; stays within the block for every
        // offset a BucketLayout produces.
        unsafe { self.header.as_ptr().cast::<u8>().add(offset) }
    }

    // ---- header fields ----------------------------------------------------

    /// # Safety
    ///
    /// The metadata block must still be live.
    pub unsafe fn page(&self) -> NonNull<u8> {
        unsafe { (*self.header.as_ptr()).page }
    }

    /// # Safety
    ///
    /// The metadata block must still be live.
    pub unsafe fn page_addr(&self) -> usize {
        unsafe { self.page().as_ptr() as usize }
    }

    /// # Safety
    ///
    /// The metadata block must still be live.
    pub unsafe fn cursor(&self) -> SlotIndex {
        unsafe { (*self.header.as_ptr()).alloc_cursor }
    }

    /// Claims the next never-issued slot and returns its index.
    ///
    /// # Safety
    ///
    /// The metadata block must still be live and the cursor must not be
    /// exhausted.
    pub unsafe fn claim_slot(&self) -> SlotIndex {
        unsafe {
            let header = self.header.as_ptr();
            let slot = (*header).alloc_cursor;
            (*header).alloc_cursor += 1;
            (*header).used_count += 1;
            slot
        }
    }

    /// Drops one live slot; returns the remaining live count.
    ///
    /// # Safety
    ///
    /// The metadata block must still be live and `used_count` nonzero.
    pub unsafe fn release_slot(&self) -> SlotIndex {
        unsafe {
            let header = self.header.as_ptr();
            (*header).used_count -= 1;
            (*header).used_count
        }
    }

    /// Overwrites the cursor with the slot count so the size class stays
    /// recoverable after retirement.
    ///
    /// # Safety
    ///
    /// The metadata block must still be live.
    pub unsafe fn mark_retired(&self, slot_count: SlotIndex) {
        unsafe {
            (*self.header.as_ptr()).alloc_cursor = slot_count;
        }
    }

    // ---- per-slot regions -------------------------------------------------

    /// # Safety
    ///
    /// Block live; `slot < layout.slot_count`.
    pub unsafe fn is_used(&self, layout: &BucketLayout, slot: SlotIndex) -> bool {
        unsafe {
            let byte = *self.region(layout.used_bits).add(slot as usize / 8);
            byte & (1u8 << (slot % 8)) != 0
        }
    }

    /// # Safety
    ///
    /// Block live; `slot < layout.slot_count`.
    pub unsafe fn set_used(&self, layout: &BucketLayout, slot: SlotIndex) {
        unsafe {
            *self.region(layout.used_bits).add(slot as usize / 8) |= 1u8 << (slot % 8);
        }
    }

    /// # Safety
    ///
    /// Block live; `slot < layout.slot_count`.
    pub unsafe fn clear_used(&self, layout: &BucketLayout, slot: SlotIndex) {
        unsafe {
            *self.region(layout.used_bits).add(slot as usize / 8) &= !(1u8 << (slot % 8));
        }
    }

    /// # Safety
    ///
    /// Block live; `slot < layout.slot_count`; layout has `safety`.
    pub unsafe fn requested_size(&self, layout: &BucketLayout, slot: SlotIndex) -> u32 {
        debug_assert!(layout.safety);
        unsafe { *self.region(layout.sizes).cast::<u32>().add(slot as usize) }
    }

    /// # Safety
    ///
    /// Block live; `slot < layout.slot_count`; layout has `safety`.
    pub unsafe fn set_requested_size(&self, layout: &BucketLayout, slot: SlotIndex, len: u32) {
        debug_assert!(layout.safety);
        unsafe {
            *self.region(layout.sizes).cast::<u32>().add(slot as usize) = len;
        }
    }

    /// # Safety
    ///
    /// Block live; `slot < layout.slot_count`; layout has `safety`.
    pub unsafe fn slot_align(&self, layout: &BucketLayout, slot: SlotIndex) -> u8 {
        debug_assert!(layout.safety);
        unsafe { *self.region(layout.aligns).add(slot as usize) }
    }

    /// # Safety
    ///
    /// Block live; `slot < layout.slot_count`; layout has `safety`.
    pub unsafe fn set_slot_align(&self, layout: &BucketLayout, slot: SlotIndex, log2_align: u8) {
        debug_assert!(layout.safety);
        unsafe {
            *self.region(layout.aligns).add(slot as usize) = log2_align;
        }
    }

    unsafe fn trace_ptr(&self, layout: &BucketLayout, slot: SlotIndex, kind: TraceKind) -> *mut usize {
        let index = slot as usize * 2 * layout.frames + kind as usize * layout.frames;
        unsafe { self.region(layout.traces).cast::<usize>().add(index) }
    }

    /// The stored trace for one slot and kind; empty when recording is
    /// disabled.
    ///
    /// # Safety
    ///
    /// Block live; `slot < layout.slot_count`.
    pub unsafe fn trace(&self, layout: &BucketLayout, slot: SlotIndex, kind: TraceKind) -> &[usize] {
        if layout.frames == 0 {
            return &[];
        }
        unsafe { slice::from_raw_parts(self.trace_ptr(layout, slot, kind), layout.frames) }
    }

    /// Records the current call-site trace for one slot and kind.
    ///
    /// # Safety
    ///
    /// Block live; `slot < layout.slot_count`.
    pub unsafe fn capture_trace(
        &self,
        layout: &BucketLayout,
        slot: SlotIndex,
        kind: TraceKind,
        ret_addr: usize,
    ) {
        if layout.frames == 0 {
            return;
        }
        unsafe {
            let buf = slice::from_raw_parts_mut(self.trace_ptr(layout, slot, kind), layout.frames);
            trace::capture(ret_addr, buf);
        }
    }

    /// Address of one slot on the managed page.
    ///
    /// # Safety
    ///
    /// Block live; `slot < layout.slot_count`.
    pub unsafe fn slot_ptr(&self, layout: &BucketLayout, slot: SlotIndex) -> NonNull<u8> {
        unsafe {
            NonNull::new_unchecked(self.page().as_ptr().add(slot as usize * layout.size_class))
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn log2_block_align() -> u8 {
    mem::align_of::<BucketHeader>().trailing_zeros() as u8
}

// ============================================================================
// SizeClass - per-class bucket map and current bucket
// ============================================================================

/// Per-size-class state: the active buckets ordered by page address and
/// the bucket new slots flow into.
pub(crate) struct SizeClass {
    pub layout: BucketLayout,
    /// Active buckets keyed by page base address.
    pub buckets: BTreeMap<usize, Bucket>,
    /// The only bucket new allocations flow into. Always present in
    /// `buckets`; `None` until the first allocation and after the current
    /// bucket is retired.
    pub current: Option<Bucket>,
}

impl SizeClass {
    pub fn new(size_class: usize, page_size: usize, config: &Config) -> Self {
        Self {
            layout: BucketLayout::new(size_class, page_size, config),
            buckets: BTreeMap::new(),
            current: None,
        }
    }

    /// Which active bucket holds `addr`, if any. Fast path through the
    /// current bucket, map lookup by masked page address otherwise.
    pub fn find(&self, addr: usize, page_size: usize) -> Option<Bucket> {
        let page = addr & !(page_size - 1);
        if let Some(current) = self.current {
            // SAFETY: buckets in the map (current included) are live.
            if unsafe { current.page_addr() } == page {
                return Some(current);
            }
        }
        self.buckets.get(&page).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(safety: bool, frames: usize) -> Config {
        Config {
            safety,
            stack_trace_frames: frames,
            ..Config::default()
        }
    }

    #[test]
    fn layout_slot_counts() {
        let cfg = config(true, 6);
        assert_eq!(BucketLayout::new(1, 4096, &cfg).slot_count, 4096);
        assert_eq!(BucketLayout::new(64, 4096, &cfg).slot_count, 64);
        assert_eq!(BucketLayout::new(2048, 4096, &cfg).slot_count, 2);
    }

    #[test]
    fn layout_regions_are_ordered_and_aligned() {
        let cfg = config(true, 6);
        let l = BucketLayout::new(8, 4096, &cfg);
        assert_eq!(l.used_bits, mem::size_of::<BucketHeader>());
        assert!(l.sizes >= l.used_bits + (l.slot_count as usize).div_ceil(8));
        assert_eq!(l.sizes % mem::align_of::<u32>(), 0);
        assert_eq!(l.aligns, l.sizes + l.slot_count as usize * 4);
        assert_eq!(l.traces % mem::align_of::<usize>(), 0);
        assert_eq!(
            l.total,
            l.traces + l.slot_count as usize * 2 * 6 * mem::size_of::<usize>()
        );
    }

    #[test]
    fn layout_shrinks_without_safety_or_traces() {
        let with = BucketLayout::new(64, 4096, &config(true, 6));
        let without = BucketLayout::new(64, 4096, &config(false, 0));
        assert!(without.total < with.total);
        assert_eq!(
            without.total,
            mem::size_of::<BucketHeader>() + (without.slot_count as usize).div_ceil(8)
        );
    }

    #[test]
    fn layout_recovered_from_slot_count() {
        let cfg = config(true, 6);
        for size_class in [1usize, 8, 256, 2048] {
            let l = BucketLayout::new(size_class, 4096, &cfg);
            let recovered = BucketLayout::from_slot_count(l.slot_count, 4096, &cfg);
            assert_eq!(recovered.size_class, size_class);
            assert_eq!(recovered.total, l.total);
        }
    }
}
