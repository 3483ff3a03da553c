use std::ptr::NonNull;

#[cfg(unix)]
#[allow(unused)]
mod unix {
    use core::ffi::c_void;

    pub const PROT_NONE: i32 = 0x0;
    pub const PROT_READ: i32 = 0x1;
    pub const PROT_WRITE: i32 = 0x2;

    pub const MAP_PRIVATE: i32 = 0x02;

    #[cfg(target_os = "linux")]
    pub const MAP_ANON: i32 = 0x20;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const MAP_ANON: i32 = 0x1000;

    #[cfg(target_os = "linux")]
    pub const MAP_NORESERVE: i32 = 0x4000;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const MAP_NORESERVE: i32 = 0x40;

    pub const MADV_DONTNEED: i32 = 4;

    pub const MAP_FAILED: isize = -1;

    /// posix mmap, munmap, mprotect and madvise
    /// # Safety
    /// see valid usage online
    unsafe extern "C" {
        pub fn mmap(
            addr: *mut c_void,
            length: usize,
            prot: i32,
            flags: i32,
            fd: i32,
            offset: isize,
        ) -> *mut c_void;

        pub fn munmap(addr: *mut c_void, length: usize) -> i32;

        pub fn mprotect(addr: *mut c_void, length: usize, prot: i32) -> i32;

        pub fn madvise(addr: *mut c_void, length: usize, advice: i32) -> i32;
    }

    /// reserve address space without backing it
    /// # Safety
    /// null must be checked
    #[inline]
    pub unsafe fn anonymous_reserve(len: usize) -> *mut u8 {
        // SAFETY: safe if contract holds
        let p = unsafe {
            mmap(
                core::ptr::null_mut(),
                len,
                PROT_NONE,
                MAP_PRIVATE | MAP_ANON | MAP_NORESERVE,
                -1,
                0,
            )
        };
        if (p as isize) == MAP_FAILED {
            core::ptr::null_mut()
        } else {
            p as *mut u8
        }
    }

    /// posix memory deallocation using munmap
    /// # Safety
    /// must be allocated by mmmap
    #[inline]
    pub unsafe fn anonymous_munmap(ptr: *mut u8, len: usize) {
        // SAFETY: safe if contract holds
        let _ = unsafe { munmap(ptr.cast(), len) };
    }
}

pub const OS_PAGE_SIZE: usize = 4096;

/// Reserves `size` bytes of address space aligned to `align` (a power of
/// two). Nothing is accessible until [`commit_memory`] is called.
#[must_use]
pub fn reserve_memory(size: usize, align: usize) -> Option<NonNull<u8>> {
    debug_assert!(align.is_power_of_two());
    let padded = size.checked_add(align)?;
    // SAFETY: this is safe
    let raw = unsafe { unix::anonymous_reserve(padded) };
    let raw = NonNull::new(raw)?;

    let start = raw.as_ptr() as usize;
    let aligned = (start + align - 1) & !(align - 1);
    let head = aligned - start;
    let tail = padded - head - size;
    // SAFETY: trimming parts of our own mapping
    unsafe {
        if head > 0 {
            unix::anonymous_munmap(raw.as_ptr(), head);
        }
        if tail > 0 {
            unix::anonymous_munmap((aligned + size) as *mut u8, tail);
        }
    }
    NonNull::new(aligned as *mut u8)
}

/// Makes `[ptr, ptr + size)` readable and writable.
pub fn commit_memory(ptr: NonNull<u8>, size: usize) -> bool {
    // SAFETY: ptr must be inside a reservation made by reserve_memory
    let rc = unsafe {
        unix::mprotect(ptr.as_ptr().cast(), size, unix::PROT_READ | unix::PROT_WRITE)
    };
    rc == 0
}

/// Drops the physical pages behind `[ptr, ptr + size)` and makes the range
/// inaccessible. The reservation is kept; committing again yields zeroed
/// memory.
pub fn uncommit_memory(ptr: NonNull<u8>, size: usize) -> bool {
    // SAFETY: ptr must be inside a reservation made by reserve_memory
    unsafe {
        let advised = unix::madvise(ptr.as_ptr().cast(), size, unix::MADV_DONTNEED);
        let protected = unix::mprotect(ptr.as_ptr().cast(), size, unix::PROT_NONE);
        advised == 0 && protected == 0
    }
}

pub fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: ptr must be from mmap allocation
    unsafe { unix::anonymous_munmap(ptr.as_ptr(), size) };
}
