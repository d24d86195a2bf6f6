use std::ptr::NonNull;

use crate::Pointer;

/// Hardware page size in bytes. Blocks are always acquired and released in
/// whole multiples of this.
pub(crate) const PAGE_SIZE: usize = 4096;

/// Abstraction for platform specific page handling. The allocator only needs
/// to acquire ranges of pages and give them back when they are no longer in
/// use, it doesn't care about the APIs offered by the underlying kernel or
/// libraries. A freestanding port would implement this on top of its
/// physical frame allocator.
trait PageProvider {
    /// Requests `count` contiguous pages from the kernel. Returns the page
    /// aligned address of the first one, or `None` if the kernel refuses.
    /// The content of the pages is unspecified.
    unsafe fn acquire_pages(count: usize) -> Pointer<u8>;

    /// Returns `count` pages starting at `address` to the kernel. `address`
    /// must come from a previous [`PageProvider::acquire_pages`] call with
    /// the same count.
    unsafe fn release_pages(address: NonNull<u8>, count: usize);
}

/// Zero sized type that implements [`PageProvider`] for each OS.
pub(crate) struct Platform;

/// Convenience wrapper for [`PageProvider::acquire_pages`].
#[inline]
pub(crate) unsafe fn acquire_pages(count: usize) -> Pointer<u8> {
    Platform::acquire_pages(count)
}

/// Convenience wrapper for [`PageProvider::release_pages`].
#[inline]
pub(crate) unsafe fn release_pages(address: NonNull<u8>, count: usize) {
    Platform::release_pages(address, count)
}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::ptr::{self, NonNull};

    use super::{PageProvider, Platform, PAGE_SIZE};
    use crate::Pointer;

    impl PageProvider for Platform {
        unsafe fn acquire_pages(count: usize) -> Pointer<u8> {
            let length = count * PAGE_SIZE;

            // Memory protection. Read-Write only.
            let protection = libc::PROT_READ | libc::PROT_WRITE;

            // Memory should be private to our process and not mapped to any
            // file.
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

            // For all the configuration options that `mmap` accepts see
            // https://man7.org/linux/man-pages/man2/mmap.2.html
            let address = libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0);

            if address == libc::MAP_FAILED {
                None
            } else {
                Some(NonNull::new_unchecked(address).cast())
            }
        }

        unsafe fn release_pages(address: NonNull<u8>, count: usize) {
            if libc::munmap(address.cast().as_ptr(), count * PAGE_SIZE) != 0 {
                // The pages stay mapped. Nothing useful can be done about it
                // from inside an allocator.
            }
        }
    }
}

#[cfg(windows)]
#[cfg(not(miri))]
mod windows {
    use std::ptr::NonNull;

    use windows::Win32::System::Memory;

    use super::{PageProvider, Platform, PAGE_SIZE};
    use crate::Pointer;

    impl PageProvider for Platform {
        unsafe fn acquire_pages(count: usize) -> Pointer<u8> {
            // Similar to mmap on Linux, Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            // This works a little bit different from mmap, memory has to be
            // reserved first and then committed in order to become usable.
            // We can do both at the same time with one single call.
            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            // For more detailed explanations of each parameter, see
            // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualalloc#parameters
            let address = Memory::VirtualAlloc(None, count * PAGE_SIZE, flags, protection);

            NonNull::new(address.cast())
        }

        unsafe fn release_pages(address: NonNull<u8>, _count: usize) {
            // We have to decommit memory first and then release it. We can
            // skip decommitting by specifying length of 0 and MEM_RELEASE
            // flag. See the docs for details:
            // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualfree#parameters
            let address = address.cast().as_ptr();
            let length = 0;
            let flags = Memory::MEM_RELEASE;

            if !Memory::VirtualFree(address, length, flags).as_bool() {
                // Same situation as munmap failing on Unix.
            }
        }
    }
}

#[cfg(miri)]
mod miri {
    //! When using Miri we can't rely on system calls such as `mmap` because
    //! there's no FFI support, so instead we'll use the global allocator to
    //! mock low level page managament. This is also useful for detecting
    //! leaks in our own allocator (blocks that are not returned back to the
    //! kernel).

    use std::alloc;
    use std::ptr::NonNull;

    use super::{PageProvider, Platform, PAGE_SIZE};
    use crate::Pointer;

    fn to_layout(count: usize) -> alloc::Layout {
        alloc::Layout::from_size_align(count * PAGE_SIZE, PAGE_SIZE).unwrap()
    }

    impl PageProvider for Platform {
        unsafe fn acquire_pages(count: usize) -> Pointer<u8> {
            // Anonymous mappings come back zeroed and the split safety probe
            // reads tags from memory it never wrote, so the mock has to hand
            // out zeroed pages as well.
            NonNull::new(alloc::alloc_zeroed(to_layout(count)))
        }

        unsafe fn release_pages(address: NonNull<u8>, count: usize) {
            alloc::dealloc(address.as_ptr(), to_layout(count));
        }
    }
}
