use std::io::{self, Error};
use std::mem;
use std::ptr;
use std::ptr::NonNull;

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

pub fn page_size() -> usize {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let size = info.dwPageSize as usize;
        if size == 0 {
            4096
        } else {
            size
        }
    }
}

pub fn map(size: usize) -> io::Result<NonNull<u8>> {
    let ptr = unsafe {
        VirtualAlloc(
            ptr::null(),
            size,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_READWRITE,
        )
    };
    NonNull::new(ptr.cast::<u8>()).ok_or_else(Error::last_os_error)
}

/// `VirtualAlloc` cannot trim a reservation, so probe for an aligned spot:
/// reserve an oversized range to learn a usable address, release it, then
/// re-allocate at the aligned address inside it. The address can be taken
/// by another thread between the two calls, hence the retry loop.
pub fn map_aligned(size: usize, align: usize) -> io::Result<NonNull<u8>> {
    let over = size.checked_add(align).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "length plus alignment overflows")
    })?;

    for _ in 0..16 {
        let probe = unsafe { VirtualAlloc(ptr::null(), over, MEM_RESERVE, PAGE_READWRITE) };
        if probe.is_null() {
            return Err(Error::last_os_error());
        }
        let aligned = (probe as usize + align - 1) & !(align - 1);
        unsafe {
            VirtualFree(probe, 0, MEM_RELEASE);
        }

        let ptr = unsafe {
            VirtualAlloc(
                aligned as *const _,
                size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_READWRITE,
            )
        };
        if let Some(ptr) = NonNull::new(ptr.cast::<u8>()) {
            return Ok(ptr);
        }
    }
    Err(Error::new(
        io::ErrorKind::AddrNotAvailable,
        "could not place an aligned mapping",
    ))
}

pub unsafe fn unmap(ptr: NonNull<u8>, _size: usize) {
    unsafe {
        VirtualFree(ptr.as_ptr().cast(), 0, MEM_RELEASE);
    }
}

/// Address space cannot be partially released here; decommitting the tail
/// still returns the physical pages.
pub unsafe fn release_tail(ptr: NonNull<u8>, new_size: usize, old_size: usize) {
    unsafe {
        VirtualFree(
            ptr.as_ptr().add(new_size).cast(),
            old_size - new_size,
            MEM_DECOMMIT,
        );
    }
}
