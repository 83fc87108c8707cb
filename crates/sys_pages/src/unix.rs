use std::io::{self, Error};
use std::ptr;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

pub fn map(size: usize) -> io::Result<NonNull<u8>> {
    let flags = libc::MAP_PRIVATE | libc::MAP_ANON;
    let prot = libc::PROT_READ | libc::PROT_WRITE;

    let ptr = unsafe { libc::mmap(ptr::null_mut(), size, prot, flags, -1, 0) };
    if ptr == libc::MAP_FAILED {
        return Err(Error::last_os_error());
    }

    // SAFETY: a successful anonymous mmap never lands at address zero.
    Ok(unsafe { NonNull::new_unchecked(ptr.cast::<u8>()) })
}

/// Over-maps by `align`, then trims the misaligned prefix and the unused
/// suffix back to the OS so exactly `size` bytes remain.
pub fn map_aligned(size: usize, align: usize) -> io::Result<NonNull<u8>> {
    let over = size.checked_add(align).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "length plus alignment overflows")
    })?;
    let base = map(over)?;

    let addr = base.as_ptr() as usize;
    let aligned = (addr + align - 1) & !(align - 1);
    let prefix = aligned - addr;
    let suffix = over - prefix - size;
    unsafe {
        if prefix != 0 {
            libc::munmap(base.as_ptr().cast::<libc::c_void>(), prefix);
        }
        if suffix != 0 {
            libc::munmap((aligned + size) as *mut libc::c_void, suffix);
        }
    }

    // SAFETY: `aligned` sits within the nonzero mapping.
    Ok(unsafe { NonNull::new_unchecked(aligned as *mut u8) })
}

pub unsafe fn unmap(ptr: NonNull<u8>, size: usize) {
    unsafe {
        libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size);
    }
}

pub unsafe fn release_tail(ptr: NonNull<u8>, new_size: usize, old_size: usize) {
    unsafe {
        libc::munmap(
            ptr.as_ptr().add(new_size).cast::<libc::c_void>(),
            old_size - new_size,
        );
    }
}
