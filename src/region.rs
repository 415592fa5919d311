use std::ptr::NonNull;

use crate::{
    align::page_round,
    block::{Chain, BLOCK_HEADER_SIZE},
    header::Header,
    platform::page_size,
};

/// Big zone region specific data. All region headers are also linked list
/// nodes, see [`Header<T>`], so a complete region header is
/// [`Header<Region>`]. It sits at the very start of the mapping and the block
/// chain follows it:
///
/// ```text
/// +--------+------------------------+      +--------+-------------------------------------+
/// |        | +-------+    +-------+ |      |        | +-------+    +-------+    +-------+ |
/// | Region | | Block | -> | Free  | | ---> | Region | | Free  | -> | Block | -> | Free  | |
/// |        | +-------+    +-------+ |      |        | +-------+    +-------+    +-------+ |
/// +--------+------------------------+      +--------+-------------------------------------+
/// ```
///
/// We cannot assume that regions are adjacent, `mmap` may be used outside of
/// this allocator or we may have unmapped a region in between, so regions are
/// linked in creation order and blocks never merge across them.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Region {
    /// Number of used blocks in this region. Reaching zero unmaps it.
    pub live: usize,
    /// Total mapped length, header included.
    pub length: usize,
}

/// Region header size in bytes, padded so that the first block is aligned.
pub(crate) const REGION_HEADER_SIZE: usize = Header::<Region>::content_offset();

impl Header<Region> {
    /// Block chain that fills this region after the header.
    ///
    /// # Safety
    ///
    /// `header` must point to a mapped region formatted by the big zone.
    #[inline]
    pub unsafe fn chain_of(header: NonNull<Self>) -> Chain {
        Chain::from_raw_parts(
            Self::content_address_of(header),
            header.as_ref().data.length - REGION_HEADER_SIZE,
        )
    }

    #[inline]
    pub fn live(&self) -> usize {
        self.data.live
    }

    #[inline]
    pub fn length(&self) -> usize {
        self.data.length
    }
}

/// Bytes needed to store a single block with `capacity` bytes of payload in
/// a region of its own, headers included. `None` on overflow.
#[inline]
pub(crate) fn overhead_for(capacity: usize) -> Option<usize> {
    capacity.checked_add(REGION_HEADER_SIZE + BLOCK_HEADER_SIZE)
}

/// Calculates the length that we should call `mmap` with to store a block of
/// `capacity` bytes.
///
/// Requests that don't fit in `dedicated_pages` get a region sized exactly
/// for them (rounded up to whole pages), since nothing else is likely to fit
/// next to them. Everything else gets a shared region of `region_pages` pages
/// so that many future allocations can be served from the same mapping.
///
/// Returns the length together with whether the region is dedicated, or
/// `None` if the length can't even be represented.
pub(crate) fn determine_region_length(
    capacity: usize,
    dedicated_pages: usize,
    region_pages: usize,
) -> Option<(usize, bool)> {
    let total_size = overhead_for(capacity)?;
    let page = page_size();

    // Leave room for the page round up without overflowing.
    if total_size > isize::MAX as usize - page {
        return None;
    }

    if total_size > dedicated_pages.saturating_mul(page) {
        return Some((page_round(total_size), true));
    }

    // A shared region smaller than the request would be useless.
    let length = page_round(total_size).max(region_pages.saturating_mul(page));

    Some((length, false))
}
