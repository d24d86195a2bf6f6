use std::mem;
use std::ptr::NonNull;

use crate::{
    list::Link,
    tag::{self, Tag, TAG_SIZE},
    Pointer,
};

/// Free region header size in bytes. See [`FreeRegion`].
pub(crate) const FREE_HEADER_SIZE: usize = mem::size_of::<FreeRegion>();

/// Smallest region that can exist. Anything below this cannot store its own
/// link fields once it becomes free again.
pub(crate) const MIN_REGION_SIZE: usize = FREE_HEADER_SIZE + TAG_SIZE;

/// Bytes of metadata that every region carries: one [`Tag`] at each end.
pub(crate) const REGION_OVERHEAD: usize = 2 * TAG_SIZE;

/// Alignment guaranteed for every address handed out to callers.
pub(crate) const PAYLOAD_ALIGNMENT: usize = 16;

/// Header of a free region. While a region is allocated only its two [`Tag`]
/// words mean anything and everything in between belongs to the caller. Once
/// the region is freed we reclaim the first bytes of that payload to store
/// the links of the segregated free list it lands in:
///
/// ```text
/// +--------------------------+
/// | tag                      | <- Shared with the allocated layout.
/// +--------------------------+
/// | reserved (64 bit only)   | <- Keeps the links pointer aligned.
/// +--------------------------+
/// | next free region         | <-+
/// +--------------------------+   | Same size class, same block.
/// | prev free region         | <-+
/// +--------------------------+
/// | unused bytes             |
/// +--------------------------+
/// | tag (footer)             |
/// +--------------------------+
/// ```
///
/// The links are borrowed views into the owning block's storage, the block
/// owns all of the backing pages. Nothing here is ever allocated separately.
#[repr(C)]
pub(crate) struct FreeRegion {
    pub tag: Tag,
    #[cfg(target_pointer_width = "64")]
    _reserved: u32,
    pub next: Pointer<FreeRegion>,
    pub prev: Pointer<FreeRegion>,
}

impl FreeRegion {
    /// Total region size in bytes, including both tags.
    #[inline]
    pub fn size(&self) -> usize {
        self.tag.region_size()
    }
}

impl Link for FreeRegion {
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

/// Writes a brand new free region over `[address, address + size)`. The
/// header tag is mirrored into the footer and the links start out empty.
///
/// # Safety
///
/// The whole byte range must be writable and owned by the caller, and `size`
/// must be at least [`MIN_REGION_SIZE`] and fit in the tag size field.
pub(crate) unsafe fn create(address: NonNull<u8>, size: usize) -> NonNull<FreeRegion> {
    debug_assert!(size >= MIN_REGION_SIZE);

    address.as_ptr().write_bytes(0, FREE_HEADER_SIZE);

    let mut region = address.cast::<FreeRegion>();
    region.as_mut().tag = Tag::free(size);
    tag::footer_of(region.cast()).as_ptr().write(region.as_ref().tag);

    region
}

/// Size that the leading fragment of `region` must have so that a trailing
/// fragment starting right after it hands out 16 byte aligned payloads.
///
/// Two paddings are applied to `requested`:
///
/// * If the request is smaller than [`MIN_REGION_SIZE`] it is bumped up to
///   it, otherwise a remainder produced later at this boundary could be too
///   small to hold its own links.
/// * Tail padding so that the end of the fragment plus one tag is 16 byte
///   aligned. The next region starts with its own tag at that point, which
///   puts its payload exactly on a 16 byte boundary.
///
/// All arithmetic is done in `usize`, addresses don't fit in anything
/// smaller.
///
/// # Safety
///
/// `region` must point to a valid free region.
pub(crate) unsafe fn split_size(region: NonNull<FreeRegion>, requested: usize) -> usize {
    let address = region.as_ptr() as usize;

    let size = requested.max(MIN_REGION_SIZE);
    let end = address + size + TAG_SIZE;

    size + (PAYLOAD_ALIGNMENT - end % PAYLOAD_ALIGNMENT)
}

/// Splits `region` into a leading fragment of [`split_size`] bytes and a
/// trailing free remainder, returning the remainder.
///
/// No remainder is produced when the leftover bytes cannot hold free region
/// metadata, or when the tag at the prospective remainder address claims to
/// be allocated. The latter would mean the remainder boundary landed on top
/// of live caller data, so the region is left alone. In both cases the
/// region keeps its full original size and the extra bytes ride along with
/// the allocation.
///
/// The caller is responsible for free list bookkeeping of both fragments.
///
/// # Safety
///
/// `region` must point to a valid free region that is not currently linked
/// into any free list.
pub(crate) unsafe fn split(region: NonNull<FreeRegion>, requested: usize) -> Pointer<FreeRegion> {
    let total = region.as_ref().size();
    let leading = split_size(region, requested);

    if total < leading + MIN_REGION_SIZE {
        return None;
    }

    let remainder = NonNull::new_unchecked(region.as_ptr().cast::<u8>().add(leading));

    if remainder.cast::<Tag>().as_ref().is_used() {
        return None;
    }

    create(region.cast(), leading);

    Some(create(remainder, total - leading))
}
