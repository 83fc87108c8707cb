//! Top-level allocator: configuration, dispatch, safety checks, and leak
//! detection.
//!
//! Every external operation takes the heap mutex, classifies the request
//! by effective size (`max(len, align)`), and routes it to the bucket
//! engine or the large-allocation table. Failures never leave partial
//! state behind; in particular the byte-cap counter only moves once the
//! rest of the operation has committed.

use std::alloc::{GlobalAlloc, Layout};
use std::collections::{BTreeMap, HashMap};
use std::mem;
use std::ptr::{self, NonNull};

use parking_lot::lock_api::{Mutex, RawMutex};

use crate::backing::{BackingAllocator, SysPages};
use crate::bucket::{Bucket, BucketLayout, SizeClass, SlotIndex};
use crate::large::LargeAlloc;
use crate::sync::DefaultMutex;
use crate::trace::{self, Trace, TraceKind, MAX_STACK_FRAMES};

/// Byte written over freed memory and abandoned resize tails.
const POISON: u8 = 0xaa;

/// Behavior switches, fixed at construction.
///
/// The default is the safety-oriented configuration: per-slot size and
/// alignment verification on, six trace frames, everything else off.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Depth of captured call-site traces; 0 disables trace recording.
    /// Clamped to [`MAX_STACK_FRAMES`].
    pub stack_trace_frames: usize,
    /// Store each allocation's requested length and alignment and verify
    /// them on free and resize.
    pub safety: bool,
    /// Track the total of requested bytes and enforce the ceiling set by
    /// [`GuardedHeap::set_requested_memory_limit`].
    pub enable_memory_limit: bool,
    /// Never return pages to the backing allocator, so use-after-free
    /// faults instead of silently reading recycled memory. Implies leaks
    /// unless combined with `retain_metadata`.
    pub never_unmap: bool,
    /// Keep freed allocations' metadata so later double frees are still
    /// detected; adds [`GuardedHeap::flush_retained_metadata`].
    pub retain_metadata: bool,
    /// Emit an info record for every allocate, resize and free.
    pub verbose_log: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stack_trace_frames: 6,
            safety: true,
            enable_memory_limit: false,
            never_unmap: false,
            retain_metadata: false,
            verbose_log: false,
        }
    }
}

/// Outcome of [`GuardedHeap::deinit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    /// Every allocation was freed.
    Ok,
    /// At least one allocation was still live; each was logged with its
    /// allocation trace.
    Leak,
}

fn effective_size(len: usize, log2_align: u8) -> usize {
    len.max(1usize << log2_align)
}

/// Index of the smallest size class covering `effective`.
#[allow(clippy::cast_possible_truncation)]
fn class_index(effective: usize) -> usize {
    effective.next_power_of_two().trailing_zeros() as usize
}

// ============================================================================
// GuardedHeap - the external surface
// ============================================================================

/// A safety-instrumented general-purpose allocator.
///
/// Explicitly instantiated and injected; see the crate docs for the
/// design and [`Config`] for the switches. All methods serialize on one
/// internal mutex of type `R`.
pub struct GuardedHeap<B: BackingAllocator = SysPages, R: RawMutex = DefaultMutex> {
    inner: Mutex<R, Inner<B>>,
}

impl GuardedHeap {
    /// Creates a heap over the operating system's pages.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_backing(config, SysPages)
    }
}

impl<B: BackingAllocator, R: RawMutex> GuardedHeap<B, R> {
    /// Creates a heap over a caller-supplied backing allocator.
    #[must_use]
    pub fn with_backing(mut config: Config, backing: B) -> Self {
        config.stack_trace_frames = config.stack_trace_frames.min(MAX_STACK_FRAMES);
        Self {
            inner: Mutex::new(Inner {
                config,
                backing,
                page_size: 0,
                classes: Vec::new(),
                empty_buckets: BTreeMap::new(),
                large: HashMap::new(),
                total_requested_bytes: 0,
                requested_memory_limit: usize::MAX,
            }),
        }
    }

    /// Allocates `len` bytes aligned to `1 << log2_align`.
    ///
    /// Returns `None` when the backing allocator is exhausted or the
    /// byte cap would be exceeded; state is unchanged in that case.
    /// `ret_addr` roots the recorded allocation trace; pass 0 to capture
    /// from the current frame.
    ///
    /// # Panics
    ///
    /// Panics when `len` is zero.
    #[must_use]
    pub fn allocate(&self, len: usize, log2_align: u8, ret_addr: usize) -> Option<NonNull<u8>> {
        self.inner.lock().allocate(len, log2_align, ret_addr)
    }

    /// Tries to change an allocation's length in place, keeping the base
    /// address. Returns `false` (with the allocation untouched) when the
    /// new length does not fit the slot's size class, the backing
    /// allocator refuses, or the byte cap would be exceeded.
    ///
    /// # Safety
    ///
    /// `ptr`, `old_len` and `log2_align` must describe a live allocation
    /// from this heap; `new_len` must be nonzero. On success the
    /// allocation's length is `new_len` from here on.
    pub unsafe fn resize(
        &self,
        ptr: NonNull<u8>,
        old_len: usize,
        log2_align: u8,
        new_len: usize,
        ret_addr: usize,
    ) -> bool {
        self.inner.lock().resize(ptr, old_len, log2_align, new_len, ret_addr)
    }

    /// Frees an allocation.
    ///
    /// A detected double free is reported and ignored; any other
    /// detected misuse (unknown pointer, wrong length, wrong alignment)
    /// is reported and halts.
    ///
    /// # Safety
    ///
    /// `ptr`, `len` and `log2_align` must describe an allocation from
    /// this heap, and no access through `ptr` may happen afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>, len: usize, log2_align: u8, ret_addr: usize) {
        self.inner.lock().free(ptr, len, log2_align, ret_addr);
    }

    /// Walks every bucket slot and large record, logging each live
    /// allocation with its trace. Returns whether anything is live.
    pub fn detect_leaks(&self) -> bool {
        self.inner.lock().detect_leaks()
    }

    /// Sets the ceiling for [`Config::enable_memory_limit`]. Without that
    /// switch the ceiling is never consulted.
    pub fn set_requested_memory_limit(&self, limit: usize) {
        self.inner.lock().requested_memory_limit = limit;
    }

    /// Sum of the requested lengths of all live allocations; 0 unless
    /// [`Config::enable_memory_limit`] is set.
    pub fn total_requested_bytes(&self) -> usize {
        self.inner.lock().total_requested_bytes
    }

    /// Drops all freed-but-retained metadata, releasing any pages whose
    /// unmap was deferred by [`Config::never_unmap`].
    pub fn flush_retained_metadata(&self) {
        self.inner.lock().flush_retained_metadata(0);
    }

    /// Runs leak detection, releases retained metadata and tears the
    /// heap down.
    pub fn deinit(self) -> Check {
        self.inner.into_inner().deinit_impl()
    }
}

// SAFETY: the heap hands out raw ranges but never shares its bookkeeping
// pointers; all access to them is serialized by the mutex.
unsafe impl<B: BackingAllocator + Send> Send for Inner<B> {}

// SAFETY: alloc/dealloc/realloc forward to the locked operations; the
// returned ranges satisfy the requested layout (slots and backing ranges
// are aligned to at least the effective size). Not intended as
// `#[global_allocator]`: bookkeeping draws from the std global heap.
unsafe impl<B: BackingAllocator, R: RawMutex> GlobalAlloc for GuardedHeap<B, R> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        #[allow(clippy::cast_possible_truncation)]
        let log2_align = layout.align().trailing_zeros() as u8;
        self.allocate(layout.size(), log2_align, 0)
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let Some(ptr) = NonNull::new(ptr) else { return };
        #[allow(clippy::cast_possible_truncation)]
        let log2_align = layout.align().trailing_zeros() as u8;
        // SAFETY: contract forwarded from GlobalAlloc.
        unsafe { self.free(ptr, layout.size(), log2_align, 0) };
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        #[allow(clippy::cast_possible_truncation)]
        let log2_align = layout.align().trailing_zeros() as u8;
        let Some(old_ptr) = NonNull::new(ptr) else {
            return ptr::null_mut();
        };
        // SAFETY: contract forwarded from GlobalAlloc.
        if unsafe { self.resize(old_ptr, layout.size(), log2_align, new_size, 0) } {
            return ptr;
        }
        // In-place refused: move the bytes to a fresh allocation.
        let Some(new_ptr) = self.allocate(new_size, log2_align, 0) else {
            return ptr::null_mut();
        };
        // SAFETY: both ranges are live and do not overlap; the old one is
        // released only after the copy.
        unsafe {
            ptr::copy_nonoverlapping(ptr, new_ptr.as_ptr(), layout.size().min(new_size));
            self.free(old_ptr, layout.size(), log2_align, 0);
        }
        new_ptr.as_ptr()
    }
}

// ============================================================================
// Inner - state behind the mutex
// ============================================================================

struct Inner<B: BackingAllocator> {
    config: Config,
    backing: B,
    /// Backing page size; 0 until first use.
    page_size: usize,
    /// One entry per size class, smallest first. Built at first use from
    /// the backing page size.
    classes: Vec<SizeClass>,
    /// Retired buckets kept for double-free detection
    /// (`retain_metadata`), across all size classes.
    empty_buckets: BTreeMap<usize, Bucket>,
    /// Live (and, with retention, freed) large allocations keyed by base
    /// address.
    large: HashMap<usize, LargeAlloc>,
    total_requested_bytes: usize,
    requested_memory_limit: usize,
}

impl<B: BackingAllocator> Inner<B> {
    fn ensure_init(&mut self) {
        if !self.classes.is_empty() {
            return;
        }
        let page_size = self.backing.page_size();
        assert!(
            page_size.is_power_of_two(),
            "backing page size must be a power of two"
        );
        self.page_size = page_size;
        let class_count = page_size.trailing_zeros() as usize;
        self.classes = (0..class_count)
            .map(|i| SizeClass::new(1 << i, page_size, &self.config))
            .collect();
    }

    fn largest_size_class(&self) -> usize {
        self.page_size / 2
    }

    #[allow(clippy::cast_possible_truncation)]
    fn log2_page(&self) -> u8 {
        self.page_size.trailing_zeros() as u8
    }

    // ---- allocate ---------------------------------------------------------

    fn allocate(&mut self, len: usize, log2_align: u8, ret_addr: usize) -> Option<NonNull<u8>> {
        assert!(len > 0, "zero-length allocation");
        assert!(u32::from(log2_align) < usize::BITS, "alignment out of range");
        let new_total = if self.config.enable_memory_limit {
            let total = self.total_requested_bytes.checked_add(len)?;
            if total > self.requested_memory_limit {
                return None;
            }
            Some(total)
        } else {
            None
        };
        self.ensure_init();

        let effective = effective_size(len, log2_align);
        let ptr = if effective > self.largest_size_class() {
            self.large_alloc(len, log2_align, ret_addr)?
        } else {
            self.small_alloc(len, log2_align, effective, ret_addr)?
        };
        if let Some(total) = new_total {
            self.total_requested_bytes = total;
        }
        Some(ptr)
    }

    fn small_alloc(
        &mut self,
        len: usize,
        log2_align: u8,
        effective: usize,
        ret_addr: usize,
    ) -> Option<NonNull<u8>> {
        let index = class_index(effective);
        let layout = self.classes[index].layout;
        let bucket = match self.classes[index].current {
            // SAFETY: buckets in the map are live.
            Some(bucket) if unsafe { bucket.cursor() } < layout.slot_count => bucket,
            _ => {
                let bucket = Bucket::create(&self.backing, &layout, self.page_size, ret_addr)?;
                // SAFETY: just created, so live.
                let page_addr = unsafe { bucket.page_addr() };
                if self.config.retain_metadata {
                    self.evict_stale_retired(page_addr, ret_addr);
                }
                let class = &mut self.classes[index];
                class.buckets.insert(page_addr, bucket);
                class.current = Some(bucket);
                bucket
            }
        };
        // SAFETY: the bucket is live and its cursor has room.
        unsafe {
            let slot = bucket.claim_slot();
            bucket.set_used(&layout, slot);
            if self.config.safety {
                #[allow(clippy::cast_possible_truncation)]
                bucket.set_requested_size(&layout, slot, len as u32);
                bucket.set_slot_align(&layout, slot, log2_align);
            }
            bucket.capture_trace(&layout, slot, TraceKind::Alloc, ret_addr);
            let ptr = bucket.slot_ptr(&layout, slot);
            if self.config.verbose_log {
                tracing::info!(len, ptr = ?ptr.as_ptr(), size_class = layout.size_class, "small alloc");
            }
            Some(ptr)
        }
    }

    /// The backing allocator re-issued a page whose retired bucket
    /// metadata is still held; that metadata is stale now.
    fn evict_stale_retired(&mut self, page_addr: usize, ret_addr: usize) {
        if let Some(stale) = self.empty_buckets.remove(&page_addr) {
            // SAFETY: retired buckets store their slot count in the cursor
            // and hold no live slots.
            unsafe {
                let layout =
                    BucketLayout::from_slot_count(stale.cursor(), self.page_size, &self.config);
                stale.destroy(&self.backing, &layout, ret_addr);
            }
        }
    }

    fn large_alloc(&mut self, len: usize, log2_align: u8, ret_addr: usize) -> Option<NonNull<u8>> {
        // Reserve the table slot first so the matching free cannot fail
        // on map growth.
        self.large.reserve(1);
        let ptr = self.backing.raw_alloc(len, log2_align, ret_addr)?;
        let record = LargeAlloc {
            ptr,
            len,
            requested_size: len,
            log2_align,
            freed: false,
            alloc_trace: trace::capture_boxed(self.config.stack_trace_frames, ret_addr),
            free_trace: Box::default(),
        };
        if let Some(old) = self.large.insert(ptr.as_ptr() as usize, record) {
            // The backing allocator reused an address whose record was
            // retained after its free.
            debug_assert!(self.config.retain_metadata && old.freed);
        }
        if self.config.verbose_log {
            tracing::info!(len, ptr = ?ptr.as_ptr(), "large alloc");
        }
        Some(ptr)
    }

    // ---- resize -----------------------------------------------------------

    fn resize(
        &mut self,
        ptr: NonNull<u8>,
        old_len: usize,
        log2_align: u8,
        new_len: usize,
        ret_addr: usize,
    ) -> bool {
        assert!(old_len > 0 && new_len > 0, "zero-length resize");
        assert!(u32::from(log2_align) < usize::BITS, "alignment out of range");
        self.ensure_init();

        let effective = effective_size(old_len, log2_align);
        if effective > self.largest_size_class() {
            return self.large_resize(ptr, old_len, log2_align, new_len, ret_addr);
        }
        let addr = ptr.as_ptr() as usize;
        let Some((index, bucket)) = self.find_small(addr, effective) else {
            // Alignment may have pushed the original request into a class
            // this search cannot reach, or over the large threshold.
            if self.config.retain_metadata
                && !self.large.contains_key(&addr)
                && self.find_retired(addr).is_some()
            {
                self.report_invalid(ret_addr, "resize of a freed allocation");
            }
            return self.large_resize(ptr, old_len, log2_align, new_len, ret_addr);
        };

        let layout = self.classes[index].layout;
        // SAFETY: the bucket is in the active map; the slot is derived
        // from its own page.
        #[allow(clippy::cast_possible_truncation)]
        let slot = unsafe { ((addr - bucket.page_addr()) / layout.size_class) as SlotIndex };
        unsafe {
            if !bucket.is_used(&layout, slot) {
                self.report_double_free(
                    ret_addr,
                    bucket.trace(&layout, slot, TraceKind::Alloc),
                    bucket.trace(&layout, slot, TraceKind::Free),
                );
                panic!("resize of a freed allocation");
            }
        }
        if self.config.safety {
            self.check_slot_metadata(bucket, &layout, slot, old_len, log2_align, ret_addr);
        }

        if effective_size(new_len, log2_align) > layout.size_class {
            return false;
        }
        if self.config.enable_memory_limit && !self.charge_resize(old_len, new_len) {
            return false;
        }
        if new_len < old_len {
            // Surface use-after-shrink reads.
            // SAFETY: the slot covers old_len bytes.
            unsafe { ptr::write_bytes(ptr.as_ptr().add(new_len), POISON, old_len - new_len) };
        }
        // SAFETY: slot is live in a live bucket.
        unsafe {
            if self.config.safety {
                #[allow(clippy::cast_possible_truncation)]
                bucket.set_requested_size(&layout, slot, new_len as u32);
            }
            bucket.capture_trace(&layout, slot, TraceKind::Alloc, ret_addr);
        }
        if self.config.verbose_log {
            tracing::info!(old_len, new_len, ptr = ?ptr.as_ptr(), "small resize");
        }
        true
    }

    /// Moves the byte-cap counter for a resize; refuses growth past the
    /// ceiling. Shrinking is always allowed, even over the ceiling.
    fn charge_resize(&mut self, old_len: usize, new_len: usize) -> bool {
        let Some(total) = self
            .total_requested_bytes
            .checked_sub(old_len)
            .and_then(|t| t.checked_add(new_len))
        else {
            return false;
        };
        if total > self.requested_memory_limit && total > self.total_requested_bytes {
            return false;
        }
        self.total_requested_bytes = total;
        true
    }

    fn large_resize(
        &mut self,
        ptr: NonNull<u8>,
        old_len: usize,
        log2_align: u8,
        new_len: usize,
        ret_addr: usize,
    ) -> bool {
        let addr = ptr.as_ptr() as usize;
        let entry_len = {
            let Some(entry) = self.large.get(&addr) else {
                self.report_invalid(ret_addr, "resize of an unknown allocation");
            };
            if self.config.retain_metadata && entry.freed {
                self.report_double_free(ret_addr, &entry.alloc_trace, &entry.free_trace);
                panic!("resize of a freed allocation");
            }
            if self.config.safety {
                if old_len != entry.len {
                    self.report_size_mismatch(entry.len, old_len, &entry.alloc_trace, ret_addr);
                }
                if log2_align != entry.log2_align {
                    self.report_align_mismatch(
                        entry.log2_align,
                        log2_align,
                        &entry.alloc_trace,
                        ret_addr,
                    );
                }
            }
            entry.len
        };

        // The cap has to be checked before the backing call; a committed
        // backing resize cannot be reverted.
        let charge = self.config.enable_memory_limit;
        let prev_total = self.total_requested_bytes;
        if charge && !self.charge_resize(old_len, new_len) {
            return false;
        }
        // SAFETY: the record describes a live backing range.
        if !unsafe { self.backing.raw_resize(ptr, entry_len, log2_align, new_len, ret_addr) } {
            // Roll the counter back; nothing else moved.
            self.total_requested_bytes = prev_total;
            return false;
        }
        let frames = self.config.stack_trace_frames;
        if let Some(entry) = self.large.get_mut(&addr) {
            entry.len = new_len;
            entry.requested_size = new_len;
            entry.alloc_trace = trace::capture_boxed(frames, ret_addr);
        }
        if self.config.verbose_log {
            tracing::info!(old_len, new_len, ptr = ?ptr.as_ptr(), "large resize");
        }
        true
    }

    // ---- free -------------------------------------------------------------

    fn free(&mut self, ptr: NonNull<u8>, len: usize, log2_align: u8, ret_addr: usize) {
        assert!(len > 0, "zero-length free");
        assert!(u32::from(log2_align) < usize::BITS, "alignment out of range");
        self.ensure_init();

        let effective = effective_size(len, log2_align);
        if effective > self.largest_size_class() {
            return self.large_free(ptr, len, log2_align, ret_addr);
        }
        let addr = ptr.as_ptr() as usize;
        let Some((index, bucket)) = self.find_small(addr, effective) else {
            if self.config.retain_metadata && !self.large.contains_key(&addr) {
                if let Some(retired) = self.find_retired(addr) {
                    // Only a retained header still knows this page; every
                    // slot in it was freed already.
                    // SAFETY: retired buckets store their slot count in
                    // the cursor.
                    unsafe {
                        let layout = BucketLayout::from_slot_count(
                            retired.cursor(),
                            self.page_size,
                            &self.config,
                        );
                        #[allow(clippy::cast_possible_truncation)]
                        let slot = ((addr - retired.page_addr()) / layout.size_class) as SlotIndex;
                        self.report_double_free(
                            ret_addr,
                            retired.trace(&layout, slot, TraceKind::Alloc),
                            retired.trace(&layout, slot, TraceKind::Free),
                        );
                    }
                    return;
                }
                self.report_invalid(ret_addr, "free of an unknown allocation");
            }
            return self.large_free(ptr, len, log2_align, ret_addr);
        };

        let layout = self.classes[index].layout;
        // SAFETY: the bucket is in the active map; the slot is derived
        // from its own page.
        #[allow(clippy::cast_possible_truncation)]
        let slot = unsafe { ((addr - bucket.page_addr()) / layout.size_class) as SlotIndex };
        // SAFETY: slot < slot_count by construction of the maps.
        if !unsafe { bucket.is_used(&layout, slot) } {
            // SAFETY: as above.
            unsafe {
                self.report_double_free(
                    ret_addr,
                    bucket.trace(&layout, slot, TraceKind::Alloc),
                    bucket.trace(&layout, slot, TraceKind::Free),
                );
            }
            // Recoverable: leave the slot as it is.
            return;
        }
        if self.config.safety {
            self.check_slot_metadata(bucket, &layout, slot, len, log2_align, ret_addr);
        }
        // SAFETY: the slot is live and covers len bytes.
        let remaining = unsafe {
            bucket.capture_trace(&layout, slot, TraceKind::Free, ret_addr);
            bucket.clear_used(&layout, slot);
            if self.config.safety {
                bucket.set_requested_size(&layout, slot, 0);
            }
            ptr::write_bytes(ptr.as_ptr(), POISON, len);
            bucket.release_slot()
        };
        if self.config.enable_memory_limit {
            self.total_requested_bytes -= len;
        }
        if remaining == 0 {
            self.retire_bucket(index, bucket, ret_addr);
        }
        if self.config.verbose_log {
            tracing::info!(len, ptr = ?ptr.as_ptr(), "small free");
        }
    }

    /// The bucket's last slot died: drop it from the active map and
    /// release or retain its storage per configuration.
    fn retire_bucket(&mut self, index: usize, bucket: Bucket, ret_addr: usize) {
        let layout = self.classes[index].layout;
        // SAFETY: the bucket is still live here.
        let page_addr = unsafe { bucket.page_addr() };
        let class = &mut self.classes[index];
        class.buckets.remove(&page_addr);
        if let Some(current) = class.current {
            // SAFETY: current is in the map, hence live.
            if unsafe { current.page_addr() } == page_addr {
                class.current = None;
            }
        }
        if !self.config.never_unmap {
            // SAFETY: the page came from this backing allocator and no
            // slot is live.
            unsafe {
                self.backing
                    .raw_free(bucket.page(), self.page_size, self.log2_page(), ret_addr);
            }
        }
        if self.config.retain_metadata {
            // SAFETY: live; the cursor becomes the size-class witness.
            unsafe { bucket.mark_retired(layout.slot_count) };
            self.empty_buckets.insert(page_addr, bucket);
        } else {
            // SAFETY: the handle is dropped from all maps above.
            unsafe { bucket.destroy(&self.backing, &layout, ret_addr) };
        }
    }

    fn large_free(&mut self, ptr: NonNull<u8>, len: usize, log2_align: u8, ret_addr: usize) {
        let addr = ptr.as_ptr() as usize;
        let (entry_len, entry_requested) = {
            let Some(entry) = self.large.get(&addr) else {
                self.report_invalid(ret_addr, "free of an unknown allocation");
            };
            if self.config.retain_metadata && entry.freed {
                self.report_double_free(ret_addr, &entry.alloc_trace, &entry.free_trace);
                // Recoverable: the record already reflects the free.
                return;
            }
            if self.config.safety {
                if len != entry.len {
                    self.report_size_mismatch(entry.len, len, &entry.alloc_trace, ret_addr);
                }
                if log2_align != entry.log2_align {
                    self.report_align_mismatch(
                        entry.log2_align,
                        log2_align,
                        &entry.alloc_trace,
                        ret_addr,
                    );
                }
            }
            (entry.len, entry.requested_size)
        };

        if !self.config.never_unmap {
            // SAFETY: the record describes a live backing range.
            unsafe { self.backing.raw_free(ptr, entry_len, log2_align, ret_addr) };
        }
        if self.config.enable_memory_limit {
            self.total_requested_bytes -= entry_requested;
        }
        if self.config.retain_metadata {
            let frames = self.config.stack_trace_frames;
            if let Some(entry) = self.large.get_mut(&addr) {
                entry.freed = true;
                entry.free_trace = trace::capture_boxed(frames, ret_addr);
            }
        } else {
            self.large.remove(&addr);
        }
        if self.config.verbose_log {
            tracing::info!(len, ptr = ?ptr.as_ptr(), "large free");
        }
    }

    // ---- lookup -----------------------------------------------------------

    /// Searches the guessed size class, then progressively larger ones;
    /// the original allocation may sit in a larger class because of its
    /// alignment or a later in-place shrink.
    fn find_small(&self, addr: usize, effective: usize) -> Option<(usize, Bucket)> {
        let start = class_index(effective);
        (start..self.classes.len())
            .find_map(|index| Some((index, self.classes[index].find(addr, self.page_size)?)))
    }

    fn find_retired(&self, addr: usize) -> Option<Bucket> {
        let page = addr & !(self.page_size - 1);
        self.empty_buckets.get(&page).copied()
    }

    /// Verifies the stored request length and alignment for a live slot;
    /// reports and halts on any mismatch.
    fn check_slot_metadata(
        &self,
        bucket: Bucket,
        layout: &BucketLayout,
        slot: SlotIndex,
        len: usize,
        log2_align: u8,
        ret_addr: usize,
    ) {
        // SAFETY: caller established that the slot is live.
        let (stored_len, stored_align) = unsafe {
            (
                bucket.requested_size(layout, slot),
                bucket.slot_align(layout, slot),
            )
        };
        if stored_len == 0 {
            self.report_invalid(ret_addr, "free of an unknown allocation");
        }
        // SAFETY: as above.
        let alloc_trace = unsafe { bucket.trace(layout, slot, TraceKind::Alloc) };
        if stored_len as usize != len {
            self.report_size_mismatch(stored_len as usize, len, alloc_trace, ret_addr);
        }
        if stored_align != log2_align {
            self.report_align_mismatch(stored_align, log2_align, alloc_trace, ret_addr);
        }
    }

    // ---- reports ----------------------------------------------------------

    fn report_double_free(&self, ret_addr: usize, alloc_trace: &[usize], free_trace: &[usize]) {
        let current = trace::capture_boxed(self.config.stack_trace_frames, ret_addr);
        tracing::error!(
            first_alloc = %Trace(alloc_trace),
            first_free = %Trace(free_trace),
            second_free = %Trace(&current),
            "double free detected"
        );
    }

    fn report_invalid(&self, ret_addr: usize, what: &'static str) -> ! {
        let current = trace::capture_boxed(self.config.stack_trace_frames, ret_addr);
        tracing::error!(at = %Trace(&current), "{what}");
        panic!("{what}");
    }

    fn report_size_mismatch(
        &self,
        stored: usize,
        given: usize,
        alloc_trace: &[usize],
        ret_addr: usize,
    ) -> ! {
        let current = trace::capture_boxed(self.config.stack_trace_frames, ret_addr);
        tracing::error!(
            allocated = stored,
            freed = given,
            alloc = %Trace(alloc_trace),
            free = %Trace(&current),
            "allocation size does not match free size"
        );
        panic!("allocation size {stored} bytes does not match free size {given}");
    }

    fn report_align_mismatch(
        &self,
        stored: u8,
        given: u8,
        alloc_trace: &[usize],
        ret_addr: usize,
    ) -> ! {
        let current = trace::capture_boxed(self.config.stack_trace_frames, ret_addr);
        tracing::error!(
            allocated = 1usize << stored,
            freed = 1usize << given,
            alloc = %Trace(alloc_trace),
            free = %Trace(&current),
            "allocation alignment does not match free alignment"
        );
        panic!(
            "allocation alignment {} does not match free alignment {}",
            1usize << stored,
            1usize << given
        );
    }

    // ---- leak detection and teardown --------------------------------------

    fn detect_leaks(&self) -> bool {
        let mut leaks = false;
        for class in &self.classes {
            let layout = &class.layout;
            for bucket in class.buckets.values() {
                for slot in 0..layout.slot_count {
                    // SAFETY: buckets in the map are live; slot is in range.
                    unsafe {
                        if bucket.is_used(layout, slot) {
                            let addr = bucket.slot_ptr(layout, slot).as_ptr() as usize;
                            tracing::error!(
                                address = %format_args!("{addr:#x}"),
                                size_class = layout.size_class,
                                trace = %Trace(bucket.trace(layout, slot, TraceKind::Alloc)),
                                "memory leaked"
                            );
                            leaks = true;
                        }
                    }
                }
            }
        }
        for entry in self.large.values() {
            if self.config.retain_metadata && entry.freed {
                continue;
            }
            tracing::error!(
                address = %format_args!("{:#x}", entry.addr()),
                len = entry.len,
                trace = %Trace(&entry.alloc_trace),
                "memory leaked"
            );
            leaks = true;
        }
        leaks
    }

    fn flush_retained_metadata(&mut self, ret_addr: usize) {
        let empties = mem::take(&mut self.empty_buckets);
        for bucket in empties.into_values() {
            // SAFETY: retired buckets hold no live slots; the cursor is
            // their slot count.
            unsafe {
                let layout =
                    BucketLayout::from_slot_count(bucket.cursor(), self.page_size, &self.config);
                if self.config.never_unmap {
                    self.backing
                        .raw_free(bucket.page(), self.page_size, self.log2_page(), ret_addr);
                }
                bucket.destroy(&self.backing, &layout, ret_addr);
            }
        }
        if self.config.never_unmap {
            for entry in self.large.values().filter(|entry| entry.freed) {
                // SAFETY: the range's unmap was deferred at free time.
                unsafe {
                    self.backing
                        .raw_free(entry.ptr, entry.len, entry.log2_align, ret_addr);
                }
            }
        }
        self.large.retain(|_, entry| !entry.freed);
    }

    /// Leak check plus teardown. Leaked buckets' pages and metadata are
    /// abandoned; their addresses were already reported.
    fn deinit_impl(&mut self) -> Check {
        let leaks = self.detect_leaks();
        self.flush_retained_metadata(0);
        self.large = HashMap::new();
        self.classes.clear();
        if leaks {
            Check::Leak
        } else {
            Check::Ok
        }
    }
}

impl<B: BackingAllocator> Drop for Inner<B> {
    fn drop(&mut self) {
        let _ = self.deinit_impl();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_size_covers_alignment() {
        assert_eq!(effective_size(1, 0), 1);
        assert_eq!(effective_size(17, 0), 17);
        assert_eq!(effective_size(4, 6), 64);
        assert_eq!(effective_size(100, 3), 100);
    }

    #[test]
    fn class_index_rounds_up_to_power_of_two() {
        assert_eq!(class_index(1), 0);
        assert_eq!(class_index(2), 1);
        assert_eq!(class_index(3), 2);
        assert_eq!(class_index(8), 3);
        assert_eq!(class_index(9), 4);
        assert_eq!(class_index(2048), 11);
    }

    #[test]
    fn frames_are_clamped() {
        let heap = GuardedHeap::new(Config {
            stack_trace_frames: 1000,
            ..Config::default()
        });
        assert_eq!(heap.inner.lock().config.stack_trace_frames, MAX_STACK_FRAMES);
        assert_eq!(heap.deinit(), Check::Ok);
    }
}
