//! Page-granularity memory primitives.
//!
//! Everything here deals in whole pages: lengths are rounded up to the
//! system page size, returned ranges are naturally page-aligned, and
//! alignments stricter than a page are honored by over-mapping and
//! trimming. No bookkeeping is kept; callers own the ranges they map.

use std::io;
use std::ptr::NonNull;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Rounds `len` up to a whole number of pages.
///
/// Returns `None` when the rounded length would overflow `usize`.
#[must_use]
pub fn page_align(len: usize) -> Option<usize> {
    let mask = page_size() - 1;
    Some(len.checked_add(mask)? & !mask)
}

/// Maps an anonymous read-write range of at least `len` bytes aligned to
/// `align`.
///
/// `align` must be a power of two. Alignments up to the page size come for
/// free; larger ones cost a transiently bigger mapping that is trimmed back
/// before returning.
///
/// # Errors
///
/// Propagates the OS error when the mapping cannot be established, and
/// `InvalidInput` when `len` is zero or rounds past `usize::MAX`.
pub fn map(len: usize, align: usize) -> io::Result<NonNull<u8>> {
    assert!(align.is_power_of_two(), "alignment must be a power of two");
    if len == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "length must be greater than 0",
        ));
    }
    let size = page_align(len).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "length overflows when page-aligned")
    })?;
    if align <= page_size() {
        os::map(size)
    } else {
        os::map_aligned(size, align)
    }
}

/// Unmaps a range previously returned by [`map`].
///
/// `len` is the length the range was mapped with; it is page-aligned here
/// the same way `map` aligned it.
///
/// # Safety
///
/// `ptr` must come from [`map`] with this `len`, must not have been
/// unmapped already, and no live references into the range may remain.
pub unsafe fn unmap(ptr: NonNull<u8>, len: usize) {
    let Some(size) = page_align(len) else { return };
    // SAFETY: caller guarantees the range is a live mapping of this size.
    unsafe { os::unmap(ptr, size) };
}

/// Attempts to resize a mapped range in place.
///
/// Succeeds when the new length fits the pages already mapped, or when the
/// platform can give pages back off the tail. Growth beyond the mapped
/// pages is refused; the range is untouched on refusal.
///
/// # Safety
///
/// `ptr`/`old_len` must describe a live mapping from [`map`], and
/// `new_len` must be greater than zero.
pub unsafe fn remap(ptr: NonNull<u8>, old_len: usize, new_len: usize) -> bool {
    debug_assert!(new_len > 0);
    let (Some(old_size), Some(new_size)) = (page_align(old_len), page_align(new_len)) else {
        return false;
    };
    if new_size == old_size {
        return true;
    }
    if new_size < old_size {
        // SAFETY: the tail pages belong to the caller's live mapping.
        unsafe { os::release_tail(ptr, new_size, old_size) };
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn page_size_is_power_of_two() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0, "page size should be power of 2");
    }

    #[test]
    fn page_align_rounds_up() {
        let ps = page_size();
        assert_eq!(page_align(1), Some(ps));
        assert_eq!(page_align(ps), Some(ps));
        assert_eq!(page_align(ps + 1), Some(2 * ps));
        assert_eq!(page_align(usize::MAX), None);
    }

    #[test]
    fn map_write_unmap() {
        let len = page_size();
        let ptr = map(len, 1).expect("failed to map");
        assert_eq!(ptr.as_ptr() as usize % page_size(), 0);

        unsafe {
            ptr::write_volatile(ptr.as_ptr(), 42);
            assert_eq!(ptr::read_volatile(ptr.as_ptr()), 42);
            unmap(ptr, len);
        }
    }

    #[test]
    fn map_honors_large_alignment() {
        let align = page_size() * 8;
        let ptr = map(page_size(), align).expect("failed to map");
        assert_eq!(ptr.as_ptr() as usize % align, 0);
        unsafe {
            ptr::write_volatile(ptr.as_ptr(), 7);
            unmap(ptr, page_size());
        }
    }

    #[test]
    fn remap_within_mapped_pages() {
        let ps = page_size();
        let ptr = map(ps * 2 + 50, 1).expect("failed to map");
        // Same page count either way.
        assert!(unsafe { remap(ptr, ps * 2 + 50, ps * 2 + 80) });
        // Shrink releases the tail.
        assert!(unsafe { remap(ptr, ps * 2 + 80, 19) });
        // Growth past the remaining page is refused.
        assert!(!unsafe { remap(ptr, 19, ps * 2) });
        unsafe {
            ptr::write_volatile(ptr.as_ptr(), 1);
            unmap(ptr, 19);
        }
    }
}
