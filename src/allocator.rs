use std::alloc::{GlobalAlloc, Layout};
use std::ptr::{self, NonNull};
use std::sync::Mutex;

use crate::{
    heap::Heap,
    region::{PAYLOAD_ALIGNMENT, REGION_OVERHEAD},
    stats::HeapStats,
    tag,
    AllocError, AllocResult,
};

/// Public interface of the allocator. This wraps the heap state in a
/// [`Mutex`] so that every entry point runs serialized, which is all the
/// concurrency control the data structures need. A poisoned lock makes every
/// call fail instead of touching state that a panicking thread left behind.
///
/// Multiple independent instances can coexist, each one owns its own blocks.
///
/// # Examples
///
/// ## Standalone allocator
///
/// ```rust
/// use halloc::Halloc;
///
/// let halloc = Halloc::new();
/// let address = halloc.allocate(128).unwrap();
///
/// unsafe {
///     // Payloads are always 16 byte aligned.
///     assert_eq!(address.as_ptr() as usize % 16, 0);
///     address.as_ptr().write_bytes(42, 128);
///     assert_eq!(*address.as_ptr(), 42);
///     halloc.deallocate(address.as_ptr());
/// }
/// ```
///
/// ## Global allocator
///
/// ```no_run
/// use halloc::Halloc;
///
/// #[global_allocator]
/// static ALLOCATOR: Halloc = Halloc::new();
///
/// fn main() {
///     let num = Box::new(5);
///     assert_eq!(*num, 5);
/// }
/// ```
///
/// Note that [`Halloc::stats`] builds a [`Vec`] through the global
/// allocator, so don't call it on the instance that *is* the global
/// allocator, the lock is not reentrant.
pub struct Halloc {
    heap: Mutex<Heap>,
}

/// The heap is full of raw pointers, so the compiler refuses to share it
/// across threads on its own. Every access goes through the mutex.
unsafe impl Sync for Halloc {}

impl Halloc {
    pub const fn new() -> Self {
        Self {
            heap: Mutex::new(Heap::new()),
        }
    }

    /// Returns a 16 byte aligned address where `size` bytes can be written.
    pub fn allocate(&self, size: usize) -> AllocResult {
        match self.heap.lock() {
            Ok(mut heap) => unsafe { heap.allocate(size) },
            Err(_) => Err(AllocError::Poisoned),
        }
    }

    /// Releases the allocation at `address`. Null pointers and addresses
    /// whose region is already free are ignored, and so are addresses that
    /// don't belong to any block.
    ///
    /// # Safety
    ///
    /// `address` must be null or a value previously returned by this
    /// allocator that is still mapped, reading the tag in front of it is
    /// what detects double frees.
    pub unsafe fn deallocate(&self, address: *mut u8) {
        let Some(address) = NonNull::new(address) else {
            return;
        };

        if !tag::header_of(address).as_ref().is_used() {
            return;
        }

        if let Ok(mut heap) = self.heap.lock() {
            heap.deallocate(address);
        }
    }

    /// Moves the allocation at `address` to a new one of `new_size` bytes,
    /// preserving the common prefix of the contents. Passing null is the
    /// same as calling [`Halloc::allocate`]. On failure the original
    /// allocation stays valid and untouched. No resize happens in place,
    /// except that asking for exactly the stored payload size returns the
    /// same address.
    ///
    /// # Safety
    ///
    /// Same contract as [`Halloc::deallocate`].
    pub unsafe fn reallocate(&self, address: *mut u8, new_size: usize) -> AllocResult {
        let Some(address) = NonNull::new(address) else {
            return self.allocate(new_size);
        };

        let old_size = tag::header_of(address).as_ref().region_size() - REGION_OVERHEAD;

        if new_size == old_size {
            return Ok(address);
        }

        let new_address = self.allocate(new_size)?;

        ptr::copy_nonoverlapping(
            address.as_ptr().cast_const(),
            new_address.as_ptr(),
            old_size.min(new_size),
        );
        self.deallocate(address.as_ptr());

        Ok(new_address)
    }

    /// Allocates room for `count` elements of `elem_size` bytes each and
    /// zeroes the whole payload. Zero sized elements are refused.
    pub fn allocate_zeroed(&self, count: usize, elem_size: usize) -> AllocResult {
        if elem_size == 0 {
            return Err(AllocError::ZeroElementSize);
        }

        let size = count.checked_mul(elem_size).ok_or(AllocError::TooLarge)?;
        let address = self.allocate(size)?;

        unsafe {
            let payload = tag::header_of(address).as_ref().region_size() - REGION_OVERHEAD;
            address.as_ptr().write_bytes(0, payload);
        }

        Ok(address)
    }

    /// Payload bytes actually stored for the allocation at `address`, which
    /// can exceed what was asked for because of padding. 0 for null.
    ///
    /// # Safety
    ///
    /// `address` must be null or point to a live allocation of this
    /// allocator.
    pub unsafe fn usable_size(&self, address: *mut u8) -> usize {
        match NonNull::new(address) {
            Some(address) => tag::header_of(address).as_ref().region_size() - REGION_OVERHEAD,
            None => 0,
        }
    }

    /// Snapshot of every live block: pages, sizes and the content of each
    /// free list. See the type level note about the global allocator case.
    pub fn stats(&self) -> Result<HeapStats, AllocError> {
        match self.heap.lock() {
            Ok(heap) => Ok(unsafe { heap.stats() }),
            Err(_) => Err(AllocError::Poisoned),
        }
    }
}

impl Default for Halloc {
    fn default() -> Self {
        Halloc::new()
    }
}

unsafe impl GlobalAlloc for Halloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > PAYLOAD_ALIGNMENT {
            return ptr::null_mut();
        }

        match self.allocate(layout.size()) {
            Ok(address) => address.as_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, address: *mut u8, _layout: Layout) {
        self.deallocate(address);
    }

    unsafe fn realloc(&self, address: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > PAYLOAD_ALIGNMENT {
            return ptr::null_mut();
        }

        match self.reallocate(address, new_size) {
            Ok(new_address) => new_address.as_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }
}
