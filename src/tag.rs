use std::mem;
use std::ptr::NonNull;

use modular_bitfield::{
    bitfield,
    specifiers::{B28, B4},
};

/// Size of a boundary tag in bytes.
pub(crate) const TAG_SIZE: usize = mem::size_of::<Tag>();

/// Largest value the 28 bit size field can hold.
pub(crate) const MAX_REGION_SIZE: usize = (1 << 28) - 1;

/// Metadata word that delimits every region. Each region carries two
/// identical copies of it, one at the first 4 bytes (the header) and one at
/// the last 4 bytes (the footer):
///
/// ```text
/// +----------+ <- Tag (header)
/// |   Tag    |
/// +----------+
/// | Payload  | <- Caller data, or free list links while the region is free.
/// |   ...    |
/// +----------+
/// |   Tag    |
/// +----------+ <- Tag (footer), same bits as the header.
/// ```
///
/// The duplicated footer is what makes merging adjacent regions O(1) in both
/// directions. The word right before a region header is the footer of its
/// left physical neighbor, and the word right after a region's last byte is
/// the header of its right neighbor, so both neighbors can be sized up
/// without walking the block.
///
/// `used` is written as 0 (free) or 1 (allocated) only. The remaining bit
/// patterns are reserved for future tagging and are treated as garbage by
/// [`crate::region::split`].
#[bitfield]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Tag {
    pub used: B4,
    pub size: B28,
}

impl Tag {
    /// Builds the tag of a free region of `size` total bytes.
    ///
    /// `size` must have been checked against [`MAX_REGION_SIZE`] already,
    /// public entry points do that before any arithmetic.
    #[inline]
    pub fn free(size: usize) -> Self {
        Tag::new().with_size(size as u32)
    }

    /// Total region size in bytes, including both tags.
    #[inline]
    pub fn region_size(&self) -> usize {
        self.size() as usize
    }

    /// Whether the region is currently allocated to a caller.
    #[inline]
    pub fn is_used(&self) -> bool {
        self.used() != 0
    }
}

/// Returns the address of a region header given the address handed out to
/// the caller.
///
/// # Safety
///
/// `payload` must be an address previously returned by the allocator, which
/// guarantees that a valid [`Tag`] sits right before it.
#[inline]
pub(crate) unsafe fn header_of(payload: NonNull<u8>) -> NonNull<Tag> {
    NonNull::new_unchecked(payload.as_ptr().cast::<Tag>().sub(1))
}

/// Returns the address handed out to the caller for the region starting at
/// `header`. The payload begins right after the header tag on every target;
/// combined with the tail padding applied by [`crate::region::split_size`]
/// this is what keeps caller pointers 16 byte aligned.
///
/// # Safety
///
/// `header` must point to a valid region header.
#[inline]
pub(crate) unsafe fn payload_of(header: NonNull<Tag>) -> NonNull<u8> {
    NonNull::new_unchecked(header.as_ptr().add(1)).cast()
}

/// Returns the footer address of the region starting at `header`.
///
/// # Safety
///
/// `header` must point to a valid region header whose size field already
/// describes the whole region.
#[inline]
pub(crate) unsafe fn footer_of(header: NonNull<Tag>) -> NonNull<Tag> {
    let size = header.as_ref().region_size();
    NonNull::new_unchecked(header.as_ptr().cast::<u8>().add(size - TAG_SIZE).cast())
}
