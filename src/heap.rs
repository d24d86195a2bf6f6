use std::ptr::NonNull;

use crate::{
    block::{Block, RESERVATION_PAYLOAD},
    list,
    platform::PAGE_SIZE,
    region::REGION_OVERHEAD,
    stats::HeapStats,
    tag::{self, MAX_REGION_SIZE},
    AllocError, AllocResult, Pointer,
};

/// Capacity of the first block of an instance, in region bytes. Starting
/// with a few pages avoids bouncing tiny blocks off the kernel while a
/// program warms up. Requests larger than this get a block sized for them.
const INITIAL_BLOCK_CAPACITY: usize = 4 * PAGE_SIZE;

/// Largest accepted payload. Region sizes live in a 28 bit field and a block
/// carries its own header plus page rounding on top of the region, this
/// leaves room for both.
const MAX_REQUEST: usize = MAX_REGION_SIZE - 2 * PAGE_SIZE;

/// An allocator instance: the address ordered list of live blocks plus the
/// baseline used to decide when a block is empty. The public API at
/// [`crate::allocator::Halloc`] is a thin facade that wraps one of these in
/// a lock, so isolated instances are cheap to create, which is also how the
/// tests run without stepping on each other.
pub(crate) struct Heap {
    /// All live blocks, sorted by ascending start address.
    blocks: Pointer<Block>,
    /// `used_size` of a freshly created block: header plus the synthetic
    /// reservation. A block back at this value has no user allocations.
    /// Written once, when the first block is created.
    baseline: usize,
}

impl Heap {
    pub const fn new() -> Self {
        Self {
            blocks: None,
            baseline: 0,
        }
    }

    /// Creates a block able to host a region of `region_size` bytes and
    /// links it into the block list.
    unsafe fn grow(&mut self, region_size: usize) -> Result<NonNull<Block>, AllocError> {
        let capacity = if self.blocks.is_none() {
            region_size.max(INITIAL_BLOCK_CAPACITY)
        } else {
            region_size
        };

        let mut block = Block::create(capacity)?;

        // Synthetic allocation that is never handed out. It consumes the
        // leading slack of the block, which puts every later split boundary
        // at an offset whose payload is 16 byte aligned.
        let reserved = block
            .as_mut()
            .allocate_region(RESERVATION_PAYLOAD + REGION_OVERHEAD);
        debug_assert!(reserved.is_some());

        if self.baseline == 0 {
            self.baseline = block.as_ref().used_size();
        }

        list::insert_ordered(&mut self.blocks, block);

        Ok(block)
    }

    /// Returns an address where `size` bytes can be written, 16 byte
    /// aligned. Walks the block list for a fit and grows by one block when
    /// nothing fits.
    pub(crate) unsafe fn allocate(&mut self, size: usize) -> AllocResult {
        if size > MAX_REQUEST {
            return Err(AllocError::TooLarge);
        }

        let region_size = size + REGION_OVERHEAD;

        let mut target = None;
        for block in list::iter(self.blocks) {
            if !block.as_ref().is_full() && block.as_ref().find_fit(region_size).is_some() {
                target = Some(block);
                break;
            }
        }

        let mut block = match target {
            Some(block) => block,
            None => self.grow(region_size)?,
        };

        let header = block
            .as_mut()
            .allocate_region(region_size)
            .ok_or(AllocError::OutOfPages)?;

        Ok(tag::payload_of(header))
    }

    /// Frees the allocation at `address`. Addresses that no block owns are
    /// ignored. A block whose last user allocation goes away is unlinked
    /// and its pages returned to the kernel.
    pub(crate) unsafe fn deallocate(&mut self, address: NonNull<u8>) {
        let Some(mut block) = self.block_of(address) else {
            return;
        };

        block.as_mut().deallocate_region(tag::header_of(address));

        if block.as_ref().used_size() <= self.baseline {
            list::remove(&mut self.blocks, block);
            Block::release(block);
        }
    }

    /// The block owning `address`, found by scanning the block list.
    unsafe fn block_of(&self, address: NonNull<u8>) -> Pointer<Block> {
        for block in list::iter(self.blocks) {
            if Block::contains(block, address) {
                return Some(block);
            }
        }

        None
    }

    /// Snapshot of every live block for diagnostics.
    pub(crate) unsafe fn stats(&self) -> HeapStats {
        let mut blocks = Vec::new();

        for block in list::iter(self.blocks) {
            blocks.push(block.as_ref().stats());
        }

        HeapStats { blocks }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        // Blocks normally disappear when their last allocation is freed.
        // Whatever is still here belongs to allocations the caller leaked,
        // dropping the instance invalidates those pointers.
        unsafe {
            while let Some(block) = self.blocks {
                list::remove(&mut self.blocks, block);
                Block::release(block);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::mem;
    use std::ptr::NonNull;

    use super::*;
    use crate::block::{class_of, BLOCK_HEADER_SIZE};
    use crate::region::{MIN_REGION_SIZE, PAYLOAD_ALIGNMENT};
    use crate::tag::Tag;

    unsafe fn fill(address: NonNull<u8>, size: usize, value: u8) {
        address.as_ptr().write_bytes(value, size);
    }

    unsafe fn check(address: NonNull<u8>, size: usize, value: u8) {
        for offset in 0..size {
            assert_eq!(*address.as_ptr().add(offset), value);
        }
    }

    impl Heap {
        /// Re-derives the state of every block from the raw bytes and cross
        /// checks it against the bookkeeping: header/footer parity, exact
        /// tiling, no adjacent free regions, used size accounting, class
        /// residency and address ordering.
        unsafe fn check_invariants(&self) {
            let mut previous: Pointer<Block> = None;

            for block in list::iter(self.blocks) {
                if let Some(prev) = previous {
                    assert!(prev.as_ptr() < block.as_ptr(), "block list out of order");
                }
                previous = Some(block);

                let mut cursor = block.as_ptr().cast::<u8>().add(BLOCK_HEADER_SIZE);
                let end = block.as_ptr().cast::<u8>().add(block.as_ref().size());

                let mut used_sum = BLOCK_HEADER_SIZE;
                let mut previous_free = false;
                let mut free_regions = Vec::new();

                while cursor < end {
                    let header = NonNull::new_unchecked(cursor).cast::<Tag>();
                    let size = header.as_ref().region_size();

                    assert!(size >= MIN_REGION_SIZE, "region too small to exist");
                    assert!(cursor.add(size) <= end, "region sticks out of its block");
                    assert_eq!(
                        *header.as_ptr(),
                        *tag::footer_of(header).as_ptr(),
                        "header and footer disagree"
                    );

                    let used = header.as_ref().used();
                    assert!(used <= 1, "unknown used bit pattern");

                    if used == 1 {
                        used_sum += size;
                        previous_free = false;
                    } else {
                        assert!(!previous_free, "two adjacent free regions");
                        previous_free = true;
                        free_regions.push((cursor as usize, size));
                    }

                    cursor = cursor.add(size);
                }

                assert_eq!(cursor, end, "regions must tile the block exactly");
                assert_eq!(used_sum, block.as_ref().used_size());

                // Every free region sits in exactly the list of its class
                // and every list member is a real free region.
                let mut listed = Vec::new();
                for (class, head) in block.as_ref().free_lists().iter().enumerate() {
                    for member in list::iter(*head) {
                        assert_eq!(class_of(member.as_ref().size()), class);
                        listed.push((member.as_ptr() as usize, member.as_ref().size()));
                    }
                }
                listed.sort_unstable();
                assert_eq!(listed, free_regions);
            }
        }

        unsafe fn block_count(&self) -> usize {
            list::iter(self.blocks).count()
        }
    }

    #[test]
    fn single_small_allocation() {
        unsafe {
            let mut heap = Heap::new();

            let address = heap.allocate(mem::size_of::<u32>()).unwrap();
            assert_eq!(address.as_ptr() as usize % PAYLOAD_ALIGNMENT, 0);

            address.cast::<u32>().as_ptr().write(42);
            assert_eq!(*address.cast::<u32>().as_ptr(), 42);
            heap.check_invariants();

            heap.deallocate(address);

            // No user allocations left, the pages went back to the kernel.
            assert!(heap.blocks.is_none());
        }
    }

    #[test]
    fn five_element_burst() {
        unsafe {
            let mut heap = Heap::new();
            let mut addresses = Vec::new();

            for value in 0..5u32 {
                let address = heap.allocate(mem::size_of::<u32>()).unwrap();
                assert_eq!(address.as_ptr() as usize % PAYLOAD_ALIGNMENT, 0);
                address.cast::<u32>().as_ptr().write(42 + value);
                addresses.push(address);
            }

            heap.check_invariants();

            // Distinct and pairwise disjoint.
            let mut ranges: Vec<usize> = addresses.iter().map(|a| a.as_ptr() as usize).collect();
            ranges.sort_unstable();
            for window in ranges.windows(2) {
                assert!(window[0] + mem::size_of::<u32>() <= window[1]);
            }

            for (value, address) in addresses.iter().enumerate() {
                assert_eq!(*address.cast::<u32>().as_ptr(), 42 + value as u32);
            }

            for address in addresses {
                heap.deallocate(address);
            }

            assert!(heap.blocks.is_none());
        }
    }

    unsafe fn run_coalesce_left(size: usize) {
        let mut heap = Heap::new();

        let a = heap.allocate(size).unwrap();
        let b = heap.allocate(size).unwrap();
        let c = heap.allocate(size).unwrap();

        fill(a, size, 1);
        fill(b, size, 2);
        fill(c, size, 3);

        heap.deallocate(b);
        heap.deallocate(a);
        heap.check_invariants();

        // The two spans merged, first fit hands the combined one back at
        // the address where the first allocation lived.
        let merged = heap.allocate(size * 2).unwrap();
        assert_eq!(merged, a);

        fill(merged, size * 2, 4);
        check(c, size, 3);
        heap.check_invariants();

        heap.deallocate(merged);
        heap.deallocate(c);
        assert!(heap.blocks.is_none());
    }

    #[test]
    fn coalesce_left() {
        unsafe { run_coalesce_left(64) }
    }

    #[test]
    fn coalesce_left_multi_page() {
        unsafe { run_coalesce_left(4096) }
    }

    unsafe fn run_coalesce_right(size: usize) {
        let mut heap = Heap::new();

        let a = heap.allocate(size).unwrap();
        let b = heap.allocate(size).unwrap();
        let c = heap.allocate(size).unwrap();
        let d = heap.allocate(size).unwrap();

        fill(a, size, 1);
        fill(b, size, 2);
        fill(c, size, 3);
        fill(d, size, 4);

        heap.deallocate(c);
        heap.deallocate(d);
        heap.check_invariants();

        let merged = heap.allocate(size * 2).unwrap();
        assert_eq!(merged, c);

        fill(merged, size * 2, 5);
        check(a, size, 1);
        check(b, size, 2);
        heap.check_invariants();

        heap.deallocate(a);
        heap.deallocate(b);
        heap.deallocate(merged);
        assert!(heap.blocks.is_none());
    }

    #[test]
    fn coalesce_right() {
        unsafe { run_coalesce_right(64) }
    }

    #[test]
    fn coalesce_right_multi_page() {
        unsafe { run_coalesce_right(4096) }
    }

    unsafe fn run_coalesce_both_sides(size: usize) {
        let mut heap = Heap::new();

        let a = heap.allocate(size).unwrap();
        let b = heap.allocate(size).unwrap();
        let c = heap.allocate(size).unwrap();
        let d = heap.allocate(size).unwrap();

        fill(a, size, 1);
        fill(b, size, 2);
        fill(c, size, 3);
        fill(d, size, 4);

        heap.deallocate(c);
        heap.deallocate(b);
        heap.deallocate(d);
        heap.check_invariants();

        let merged = heap.allocate(size * 3).unwrap();
        assert_eq!(merged, b);

        fill(merged, size * 3, 5);
        check(a, size, 1);
        heap.check_invariants();

        heap.deallocate(a);
        heap.deallocate(merged);
        assert!(heap.blocks.is_none());
    }

    #[test]
    fn coalesce_both_sides() {
        unsafe { run_coalesce_both_sides(64) }
    }

    #[test]
    fn coalesce_both_sides_multi_page() {
        unsafe { run_coalesce_both_sides(4096) }
    }

    #[test]
    fn large_allocation_is_isolated_from_small_ones() {
        unsafe {
            let mut heap = Heap::new();

            let big = heap.allocate(4096).unwrap();
            fill(big, 4096, 0xAB);

            let mut small = Vec::new();
            for _ in 0..6 {
                let address = heap.allocate(64).unwrap();
                fill(address, 64, 0x11);
                small.push(address);
            }

            check(big, 4096, 0xAB);
            heap.check_invariants();

            for address in small {
                heap.deallocate(address);
            }

            check(big, 4096, 0xAB);

            heap.deallocate(big);
            assert!(heap.blocks.is_none());
        }
    }

    #[test]
    fn free_then_allocate_reuses_the_address() {
        unsafe {
            let mut heap = Heap::new();

            let first = heap.allocate(100).unwrap();
            heap.deallocate(first);

            let second = heap.allocate(100).unwrap();
            assert_eq!(second, first);

            heap.deallocate(second);
            assert!(heap.blocks.is_none());
        }
    }

    #[test]
    fn grows_by_whole_blocks_on_demand() {
        unsafe {
            let mut heap = Heap::new();

            let first = heap.allocate(INITIAL_BLOCK_CAPACITY).unwrap();
            assert_eq!(heap.block_count(), 1);

            // Nothing left in the first block for another request like
            // this, so a second block shows up.
            let second = heap.allocate(INITIAL_BLOCK_CAPACITY).unwrap();
            assert_eq!(heap.block_count(), 2);
            heap.check_invariants();

            fill(first, INITIAL_BLOCK_CAPACITY, 7);
            fill(second, INITIAL_BLOCK_CAPACITY, 9);
            check(first, INITIAL_BLOCK_CAPACITY, 7);
            check(second, INITIAL_BLOCK_CAPACITY, 9);

            heap.deallocate(first);
            assert_eq!(heap.block_count(), 1);

            heap.deallocate(second);
            assert!(heap.blocks.is_none());
        }
    }

    #[test]
    fn first_allocation_can_exceed_the_initial_block() {
        unsafe {
            let mut heap = Heap::new();

            let address = heap.allocate(100_000).unwrap();
            assert_eq!(address.as_ptr() as usize % PAYLOAD_ALIGNMENT, 0);
            assert_eq!(heap.block_count(), 1);

            fill(address, 100_000, 0x5A);
            check(address, 100_000, 0x5A);
            heap.check_invariants();

            heap.deallocate(address);
            assert!(heap.blocks.is_none());
        }
    }

    #[test]
    fn oversized_requests_are_refused() {
        unsafe {
            let mut heap = Heap::new();

            assert_eq!(heap.allocate(MAX_REQUEST + 1), Err(AllocError::TooLarge));
            assert!(heap.blocks.is_none());
        }
    }

    #[test]
    fn foreign_pointers_are_ignored() {
        unsafe {
            let mut heap = Heap::new();

            let address = heap.allocate(64).unwrap();

            let mut foreign = [0u8; 16];
            heap.deallocate(NonNull::new(foreign.as_mut_ptr()).unwrap());

            // The real allocation is untouched by the bogus free.
            heap.check_invariants();
            assert_eq!(heap.block_count(), 1);

            heap.deallocate(address);
            assert!(heap.blocks.is_none());
        }
    }

    #[test]
    fn stats_reflect_block_state() {
        unsafe {
            let mut heap = Heap::new();

            let address = heap.allocate(64).unwrap();

            let stats = heap.stats();
            assert_eq!(stats.blocks.len(), 1);

            let block = &stats.blocks[0];
            assert_eq!(block.size, block.pages * PAGE_SIZE);
            assert!(block.used_size > BLOCK_HEADER_SIZE);
            // Only the remainder region is free at this point.
            assert_eq!(block.free_count(), 1);
            assert_eq!(block.free_bytes(), block.largest_free());
            assert_eq!(block.largest_free(), block.smallest_free());

            heap.deallocate(address);
            assert!(heap.stats().blocks.is_empty());
        }
    }

    #[test]
    fn randomized_operations_preserve_invariants() {
        unsafe {
            let mut heap = Heap::new();
            let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();
            let mut state: u64 = 0x9E37_79B9_7F4A_7C15;

            // Miri is slow, but it doesn't need as many operations to find
            // undefined behavior either.
            let operations = if cfg!(miri) { 60 } else { 600 };

            for operation in 0..operations {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;

                if live.is_empty() || state % 3 != 0 {
                    let size = if state % 11 == 0 {
                        2048 + (state % 8192) as usize
                    } else {
                        1 + (state % 512) as usize
                    };

                    let address = heap.allocate(size).unwrap();
                    assert_eq!(address.as_ptr() as usize % PAYLOAD_ALIGNMENT, 0);

                    let value = (operation % 251) as u8 + 1;
                    fill(address, size, value);
                    live.push((address, size, value));
                } else {
                    let index = (state as usize >> 8) % live.len();
                    let (address, size, value) = live.swap_remove(index);

                    // Writing through other allocations must not have
                    // touched this one.
                    check(address, size, value);
                    heap.deallocate(address);
                }

                heap.check_invariants();
            }

            for (address, size, value) in &live {
                check(*address, *size, *value);
            }

            while let Some((address, _, _)) = live.pop() {
                heap.deallocate(address);
            }

            heap.check_invariants();
            assert!(heap.blocks.is_none());
        }
    }
}
