use std::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use tracing::{debug, warn};

use crate::Pointer;

/// Abstraction for platform specific memory handling. The zones only need to
/// map page aligned regions and unmap them when their live count drops to
/// zero, they don't care about the APIs offered by the underlying kernel.
trait PlatformSpecificMemory {
    /// Requests a read-write, private region from the kernel where `length`
    /// bytes can be written safely. The returned address is page aligned.
    unsafe fn request_memory(length: usize) -> Pointer<u8>;

    /// Returns `length` bytes starting at `address` to the kernel. `address`
    /// and `length` must describe an entire region previously obtained with
    /// [`PlatformSpecificMemory::request_memory`]. Returns `false` if the
    /// kernel refused.
    unsafe fn return_memory(address: NonNull<u8>, length: usize) -> bool;

    /// Virtual memory page size in bytes.
    unsafe fn page_size() -> usize;
}

/// Zero sized type that implements [`PlatformSpecificMemory`] for each OS.
pub(crate) struct Platform;

/// Cached page size, zero until the first query.
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Virtual memory page size. 4096 bytes on most computers, but we only know it
/// at runtime, so we ask the kernel once and reuse the answer.
#[inline]
pub(crate) fn page_size() -> usize {
    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let size = unsafe { Platform::page_size() };
            PAGE_SIZE.store(size, Ordering::Relaxed);
            size
        }
        size => size,
    }
}

/// Maps a region of `length` bytes. `length` should be a multiple of
/// [`page_size`]. Failures are logged and reported as `None`.
pub(crate) unsafe fn request_memory(length: usize) -> Pointer<u8> {
    let address = Platform::request_memory(length);

    match address {
        Some(base) => debug!(base = ?base, length, "mapped region"),
        None => warn!(length, "kernel refused to map region"),
    }

    address
}

/// Unmaps a region previously returned by [`request_memory`]. If the kernel
/// refuses, the region stays mapped and there is nothing else we can do about
/// it, so we only log it.
pub(crate) unsafe fn return_memory(address: NonNull<u8>, length: usize) {
    if Platform::return_memory(address, length) {
        debug!(base = ?address, length, "unmapped region");
    } else {
        warn!(base = ?address, length, "kernel refused to unmap region");
    }
}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::ptr::{self, NonNull};

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            // Memory protection. Read-Write only.
            let protection = libc::PROT_READ | libc::PROT_WRITE;

            // Memory should be private to our process and not mapped to any file.
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

            // For all the configuration options that `mmap` accepts see
            // https://man7.org/linux/man-pages/man2/mmap.2.html
            match libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0) {
                libc::MAP_FAILED => None,
                address => NonNull::new(address.cast()),
            }
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) -> bool {
            libc::munmap(address.cast().as_ptr(), length) == 0
        }

        unsafe fn page_size() -> usize {
            libc::sysconf(libc::_SC_PAGESIZE) as usize
        }
    }
}

#[cfg(windows)]
#[cfg(not(miri))]
mod windows {
    use std::{mem::MaybeUninit, ptr::NonNull};

    use windows::Win32::System::{Memory, SystemInformation};

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            // Similar to mmap on Linux, Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            // Memory has to be reserved first and then committed in order to
            // become usable. We can do both at the same time with one call.
            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            // For more detailed explanations of each parameter, see
            // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualalloc#parameters
            let address = Memory::VirtualAlloc(None, length, flags, protection);

            NonNull::new(address.cast())
        }

        unsafe fn return_memory(address: NonNull<u8>, _length: usize) -> bool {
            // Length must be 0 when releasing with MEM_RELEASE, the whole
            // reservation goes back at once. See
            // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualfree#parameters
            Memory::VirtualFree(address.cast().as_ptr(), 0, Memory::MEM_RELEASE).as_bool()
        }

        unsafe fn page_size() -> usize {
            let mut system_info = MaybeUninit::uninit();
            SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

            system_info.assume_init().dwPageSize as usize
        }
    }
}

#[cfg(miri)]
mod miri {
    //! When using Miri, we can't rely on system calls such as `mmap` because
    //! there's no FFI support, so instead we'll use the global allocator to
    //! mock region mapping. This also makes Miri report regions that a zone
    //! forgot to unmap as leaks.

    use std::{alloc, ptr::NonNull};

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    const MIRI_PAGE_SIZE: usize = 4096;

    fn to_layout(length: usize) -> Option<alloc::Layout> {
        alloc::Layout::from_size_align(length, MIRI_PAGE_SIZE).ok()
    }

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            // Anonymous mappings are zero filled.
            NonNull::new(alloc::alloc_zeroed(to_layout(length)?))
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) -> bool {
            match to_layout(length) {
                Some(layout) => {
                    alloc::dealloc(address.as_ptr(), layout);
                    true
                }
                None => false,
            }
        }

        unsafe fn page_size() -> usize {
            MIRI_PAGE_SIZE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_cached_power_of_two() {
        let size = page_size();
        assert!(size.is_power_of_two());
        assert_eq!(page_size(), size);
    }

    #[test]
    fn map_write_unmap() {
        unsafe {
            let length = page_size() * 2;
            let base = request_memory(length).unwrap();
            assert_eq!(base.as_ptr() as usize % page_size(), 0);

            // Fresh anonymous memory reads as zeroes.
            assert_eq!(*base.as_ptr().add(length - 1), 0);
            *base.as_ptr().add(length - 1) = 7;
            assert_eq!(*base.as_ptr().add(length - 1), 7);

            return_memory(base, length);
        }
    }
}
