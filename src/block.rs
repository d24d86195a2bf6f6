use std::mem;
use std::ptr::NonNull;

use crate::{
    list::{self, Link},
    platform::{self, PAGE_SIZE},
    region::{self, FreeRegion, MIN_REGION_SIZE, PAYLOAD_ALIGNMENT, REGION_OVERHEAD},
    stats::{BlockStats, FreeRegionStats},
    tag::{self, Tag, TAG_SIZE},
    AllocError, Pointer,
};

/// Block header size in bytes. See [`Block`].
pub(crate) const BLOCK_HEADER_SIZE: usize = mem::size_of::<Block>();

/// Number of segregated free lists per block.
pub const SIZE_CLASSES: usize = 6;

/// Upper bounds of the first five classes, in total region bytes. Everything
/// above the last bound lands in the sixth class.
const CLASS_BOUNDS: [usize; SIZE_CLASSES - 1] = [32, 64, 128, 256, 512];

/// Payload bytes of the synthetic allocation placed at the start of every
/// fresh block. See [`crate::heap::Heap`].
pub(crate) const RESERVATION_PAYLOAD: usize = 2 * mem::size_of::<usize>();

/// Total bytes the synthetic allocation occupies. The first region of a
/// block always starts [`BLOCK_HEADER_SIZE`] bytes past a page boundary, so
/// this is the same fixed amount for every block and has to be accounted for
/// when sizing one.
fn reservation_span() -> usize {
    let size = (RESERVATION_PAYLOAD + REGION_OVERHEAD).max(MIN_REGION_SIZE);
    let end = BLOCK_HEADER_SIZE + size + TAG_SIZE;

    size + (PAYLOAD_ALIGNMENT - end % PAYLOAD_ALIGNMENT)
}

/// Class index for a region of `size` total bytes. Used both when linking a
/// region into a free list and when unlinking it, so callers must read the
/// size before mutating it.
pub(crate) fn class_of(size: usize) -> usize {
    CLASS_BOUNDS
        .iter()
        .position(|bound| size <= *bound)
        .unwrap_or(SIZE_CLASSES - 1)
}

/// Header of a heap block, a page aligned range acquired from the kernel in
/// one piece. The header sits at the very start of the range and the rest is
/// tiled by regions, beginning with one big free region:
///
/// ```text
/// +-------------------------+ <- Page boundary.
/// | pages / size / usedSize |
/// | next / prev block       |
/// | free list heads [0..=5] |
/// +-------------------------+
/// | region                  | <- First region, BLOCK_HEADER_SIZE bytes in.
/// +-------------------------+
/// | region                  |
/// +-------------------------+
/// |          ...            |
/// +-------------------------+ <- Block end, also a page boundary.
/// ```
///
/// The free lists only index regions of this block. `used_size` counts the
/// header itself plus every allocated region, so a block whose `used_size`
/// is back at its freshly created value has no user allocations and can be
/// returned to the kernel.
pub(crate) struct Block {
    /// Pages acquired from the kernel for this block.
    pages: usize,
    /// Total size in bytes, always `pages * PAGE_SIZE`.
    size: usize,
    /// Header size plus the total size of all allocated regions.
    used_size: usize,
    /// Next block in the address ordered block list.
    next: Pointer<Block>,
    /// Previous block in the address ordered block list.
    prev: Pointer<Block>,
    /// One list head per size class, each list sorted by ascending address.
    free_regions: [Pointer<FreeRegion>; SIZE_CLASSES],
}

impl Link for Block {
    fn next(&self) -> Pointer<Self> {
        self.next
    }

    fn set_next(&mut self, link: Pointer<Self>) {
        self.next = link;
    }

    fn prev(&self) -> Pointer<Self> {
        self.prev
    }

    fn set_prev(&mut self, link: Pointer<Self>) {
        self.prev = link;
    }
}

impl Block {
    /// Acquires pages for a new block whose initial free region can host a
    /// region of `capacity` bytes, then initializes the header and that
    /// region. The extra terms make sure the fit check still succeeds after
    /// the synthetic reservation and the split alignment padding take their
    /// share.
    pub(crate) unsafe fn create(capacity: usize) -> Result<NonNull<Block>, AllocError> {
        let capacity = capacity.max(MIN_REGION_SIZE);
        let memory_size = capacity + BLOCK_HEADER_SIZE + MIN_REGION_SIZE + reservation_span();
        let pages = memory_size.div_ceil(PAGE_SIZE);

        let address = platform::acquire_pages(pages).ok_or(AllocError::OutOfPages)?;
        let size = pages * PAGE_SIZE;

        let mut block = address.cast::<Block>();
        block.as_ptr().write(Block {
            pages,
            size,
            used_size: BLOCK_HEADER_SIZE,
            next: None,
            prev: None,
            free_regions: [None; SIZE_CLASSES],
        });

        let first = region::create(
            NonNull::new_unchecked(address.as_ptr().add(BLOCK_HEADER_SIZE)),
            size - BLOCK_HEADER_SIZE,
        );
        block.as_mut().insert_free_region(first);

        Ok(block)
    }

    /// Returns the pages of `block` to the kernel. The header and every
    /// region in it are gone after this.
    pub(crate) unsafe fn release(block: NonNull<Block>) {
        let pages = block.as_ref().pages;
        platform::release_pages(block.cast(), pages);
    }

    /// Whether `address` falls inside the byte range of `block`.
    pub(crate) unsafe fn contains(block: NonNull<Block>, address: NonNull<u8>) -> bool {
        let start = block.as_ptr().cast::<u8>();
        let end = start.add(block.as_ref().size);

        start <= address.as_ptr() && address.as_ptr() < end
    }

    #[inline]
    pub fn pages(&self) -> usize {
        self.pages
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn used_size(&self) -> usize {
        self.used_size
    }

    /// A full block has no free region left at all.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.used_size == self.size
    }

    /// Links `region` into the free list of its class.
    pub(crate) unsafe fn insert_free_region(&mut self, region: NonNull<FreeRegion>) {
        let class = class_of(region.as_ref().size());
        list::insert_ordered(&mut self.free_regions[class], region);
    }

    /// Unlinks `region` from the free list of its class. The size is read
    /// here, before any caller mutates it for a merge.
    pub(crate) unsafe fn remove_free_region(&mut self, region: NonNull<FreeRegion>) {
        let class = class_of(region.as_ref().size());
        list::remove(&mut self.free_regions[class], region);
    }

    /// Whether `candidate` is the header or footer of one of this block's
    /// free regions. Only addresses are compared, `candidate` itself is
    /// never read, so it is fine to pass the address right before the first
    /// region or right past the last one. Walking the lists instead of
    /// trusting the tag bits at `candidate` means corrupted metadata shows
    /// up as a failed merge instead of silently growing a region over live
    /// data.
    unsafe fn is_free_region(&self, candidate: NonNull<Tag>) -> bool {
        for head in self.free_regions {
            for member in list::iter(head) {
                let header = member.cast::<Tag>();

                if header == candidate || tag::footer_of(header) == candidate {
                    return true;
                }
            }
        }

        false
    }

    /// First free region that can host a region of `region_size` bytes, or
    /// `None`. Classes are scanned smallest first and each list in address
    /// order, so the lowest suitable address of the smallest suitable class
    /// wins.
    pub(crate) unsafe fn find_fit(&self, region_size: usize) -> Pointer<FreeRegion> {
        for head in self.free_regions {
            for candidate in list::iter(head) {
                if region::split_size(candidate, region_size) < candidate.as_ref().size() {
                    return Some(candidate);
                }
            }
        }

        None
    }

    /// Flips a free region to allocated and accounts for it.
    unsafe fn mark_used(&mut self, mut region: NonNull<FreeRegion>) -> NonNull<Tag> {
        region.as_mut().tag.set_used(1);

        let header = region.cast::<Tag>();
        let mut footer = tag::footer_of(header);
        footer.as_mut().set_used(1);

        self.used_size += region.as_ref().size();

        header
    }

    /// Flips an allocated region back to free, clears the stale link bytes
    /// and rewrites the footer.
    unsafe fn mark_free(&mut self, header: NonNull<Tag>) -> NonNull<FreeRegion> {
        let mut region = header.cast::<FreeRegion>();

        region.as_mut().tag.set_used(0);
        region.as_mut().next = None;
        region.as_mut().prev = None;
        tag::footer_of(header).as_ptr().write(region.as_ref().tag);

        self.used_size -= region.as_ref().size();

        region
    }

    /// Serves a region of `region_size` bytes from this block, or `None` if
    /// no free region fits. The winning region leaves its free list, sheds a
    /// remainder if the split produces one, and is handed out allocated.
    pub(crate) unsafe fn allocate_region(&mut self, region_size: usize) -> Pointer<Tag> {
        let free = self.find_fit(region_size)?;

        self.remove_free_region(free);

        if let Some(remainder) = region::split(free, region_size) {
            self.insert_free_region(remainder);
        }

        Some(self.mark_used(free))
    }

    /// Frees the region at `header`, links it into its class and merges it
    /// with any free physical neighbor.
    pub(crate) unsafe fn deallocate_region(&mut self, header: NonNull<Tag>) {
        let region = self.mark_free(header);

        self.insert_free_region(region);
        self.coalesce(region);
    }

    /// Merges `region` with its free physical neighbors. The left neighbor
    /// is reached through the footer right before `region`, the right one
    /// through the header right past it. Neither address is dereferenced
    /// before the membership probe vouches for it, regions at the block
    /// edges have no neighbor on one side.
    unsafe fn coalesce(&mut self, region: NonNull<FreeRegion>) {
        let bytes = region.as_ptr().cast::<u8>();
        let left = NonNull::new_unchecked(bytes.sub(TAG_SIZE)).cast::<Tag>();
        let right = NonNull::new_unchecked(bytes.add(region.as_ref().size())).cast::<Tag>();

        match (self.is_free_region(left), self.is_free_region(right)) {
            (false, false) => {}
            (false, true) => self.merge_right(region, right),
            (true, false) => self.merge_left(left, region),
            (true, true) => self.merge_both(left, region, right),
        }
    }

    /// Grows `region` over its right neighbor.
    unsafe fn merge_right(&mut self, mut region: NonNull<FreeRegion>, right: NonNull<Tag>) {
        let neighbor = right.cast::<FreeRegion>();

        self.remove_free_region(neighbor);
        self.remove_free_region(region);

        let merged = region.as_ref().size() + neighbor.as_ref().size();
        region.as_mut().tag.set_size(merged as u32);
        tag::footer_of(region.cast()).as_ptr().write(region.as_ref().tag);

        self.insert_free_region(region);
    }

    /// Grows the left neighbor over `region`. The neighbor header is found
    /// by walking its size backwards from the footer.
    unsafe fn merge_left(&mut self, left_footer: NonNull<Tag>, region: NonNull<FreeRegion>) {
        let offset = left_footer.as_ref().region_size();
        let mut neighbor = NonNull::new_unchecked(region.as_ptr().cast::<u8>().sub(offset))
            .cast::<FreeRegion>();

        self.remove_free_region(neighbor);
        self.remove_free_region(region);

        let merged = neighbor.as_ref().size() + region.as_ref().size();
        neighbor.as_mut().tag.set_size(merged as u32);
        tag::footer_of(neighbor.cast()).as_ptr().write(neighbor.as_ref().tag);

        self.insert_free_region(neighbor);
    }

    /// Grows the left neighbor over `region` and the right neighbor, fusing
    /// all three into one region.
    unsafe fn merge_both(
        &mut self,
        left_footer: NonNull<Tag>,
        region: NonNull<FreeRegion>,
        right: NonNull<Tag>,
    ) {
        let offset = left_footer.as_ref().region_size();
        let mut neighbor = NonNull::new_unchecked(region.as_ptr().cast::<u8>().sub(offset))
            .cast::<FreeRegion>();
        let right_neighbor = right.cast::<FreeRegion>();

        self.remove_free_region(neighbor);
        self.remove_free_region(right_neighbor);
        self.remove_free_region(region);

        let merged =
            neighbor.as_ref().size() + region.as_ref().size() + right_neighbor.as_ref().size();
        neighbor.as_mut().tag.set_size(merged as u32);
        tag::footer_of(neighbor.cast()).as_ptr().write(neighbor.as_ref().tag);

        self.insert_free_region(neighbor);
    }

    /// Snapshot of this block for diagnostics.
    pub(crate) unsafe fn stats(&self) -> BlockStats {
        let mut classes: [Vec<FreeRegionStats>; SIZE_CLASSES] = Default::default();

        for (class, head) in self.free_regions.iter().enumerate() {
            for member in list::iter(*head) {
                classes[class].push(FreeRegionStats {
                    address: member.as_ptr() as usize,
                    size: member.as_ref().size(),
                });
            }
        }

        BlockStats {
            address: self as *const Block as usize,
            pages: self.pages,
            size: self.size,
            used_size: self.used_size,
            classes,
        }
    }

    /// Only used for testing at [`crate::heap`].
    #[cfg(test)]
    pub(crate) fn free_lists(&self) -> &[Pointer<FreeRegion>; SIZE_CLASSES] {
        &self.free_regions
    }
}
