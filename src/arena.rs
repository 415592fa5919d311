use std::ptr::{self, NonNull};

use tracing::trace;

use crate::{
    block::{capacity_for, Chain, Cursor},
    error::{Error, Result},
    header::Header,
    list::LinkedList,
    platform,
    region::{determine_region_length, Region},
    Pointer,
};

/// Free list zone for big requests. Unlike the small zone it can hold any
/// number of regions, each one with its own block chain:
///
/// ```text
///              +--------+------------------------+      +--------+-------------------------------------+
///              |        | +-------+    +-------+ |      |        | +-------+    +-------+    +-------+ |
/// regions ---> | Region | | Block | -> | Free  | | ---> | Region | | Free  | -> | Block | -> | Free  | |
///              |        | +-------+    +-------+ |      |        | +-------+    +-------+    +-------+ |
///              +--------+------------------------+      +--------+-------------------------------------+
/// ```
///
/// Allocation is first fit across all regions in creation order. If nothing
/// fits, a new region is mapped. Each region counts its live blocks and is
/// unmapped the moment that count drops to zero.
pub(crate) struct ArenaFreeListAllocator {
    /// Requests that don't fit in this many pages get a region of their own.
    dedicated_pages: usize,
    /// Length in pages of shared regions.
    region_pages: usize,
    /// Regions in creation order.
    regions: LinkedList<Region>,
}

impl ArenaFreeListAllocator {
    pub const fn new(dedicated_pages: usize, region_pages: usize) -> Self {
        Self {
            dedicated_pages,
            region_pages,
            regions: LinkedList::new(),
        }
    }

    #[inline]
    pub fn regions(&self) -> &LinkedList<Region> {
        &self.regions
    }

    /// Number of used blocks across all regions.
    pub fn live(&self) -> usize {
        self.regions
            .iter()
            .map(|region| unsafe { region.as_ref().live() })
            .sum()
    }

    /// Allocates a block that can hold `size` bytes. Small enough requests are
    /// served first fit from existing regions, everything else gets a new
    /// region.
    pub unsafe fn alloc(&mut self, size: usize) -> Result<NonNull<u8>> {
        if size == 0 {
            return Err(Error::SizeRejected { size });
        }

        let capacity = capacity_for(size).ok_or(Error::SizeRejected { size })?;
        let (length, dedicated) =
            determine_region_length(capacity, self.dedicated_pages, self.region_pages)
                .ok_or(Error::SizeRejected { size })?;

        if !dedicated {
            if let Some(address) = self.alloc_in_existing_region(size, capacity) {
                return Ok(address);
            }
        }

        self.request_region(length, size)
    }

    /// First fit over every region in creation order.
    unsafe fn alloc_in_existing_region(&mut self, size: usize, capacity: usize) -> Pointer<u8> {
        for mut region in self.regions.iter() {
            let chain = Header::<Region>::chain_of(region);

            if let Some(offset) = chain.first_fit(capacity) {
                let address = chain.take(offset, size);
                region.as_mut().data.live += 1;
                trace!(?address, size, region = ?region, "big alloc");

                return Some(address);
            }
        }

        None
    }

    /// Maps a new region of `length` bytes, appends it to the region list and
    /// places a used block of `size` bytes at its head.
    unsafe fn request_region(&mut self, length: usize, size: usize) -> Result<NonNull<u8>> {
        let address = platform::request_memory(length).ok_or(Error::MappingFailure { length })?;

        let region = self.regions.append(Region { live: 1, length }, address);
        let chain = Header::<Region>::chain_of(region);
        Chain::format_used(chain.area(), chain.length(), size);

        let address = chain.payload(0);
        trace!(?address, size, region = ?region, length, "big alloc in new region");

        Ok(address)
    }

    /// Finds the region and live block for `address`. Only the region that
    /// contains the address is scanned block by block.
    unsafe fn locate(&self, address: NonNull<u8>) -> Result<(NonNull<Header<Region>>, Cursor)> {
        for region in self.regions.iter() {
            match Header::<Region>::chain_of(region).find(address) {
                Ok(cursor) => return Ok((region, cursor)),
                Err(Error::PointerOutOfRange) => continue,
                Err(error) => return Err(error),
            }
        }

        Err(Error::NotFound)
    }

    /// Frees the block at `address`. If it was the last live block of its
    /// region the whole region is unmapped, otherwise the block is coalesced
    /// with its neighbours inside that same region.
    pub unsafe fn free(&mut self, address: NonNull<u8>) -> Result<()> {
        let (mut region, cursor) = self.locate(address)?;

        region.as_mut().data.live -= 1;
        trace!(?address, region = ?region, live = region.as_ref().live(), "big free");

        if region.as_ref().live() == 0 {
            self.return_region(region);
        } else {
            Header::<Region>::chain_of(region).release(cursor);
        }

        Ok(())
    }

    /// Same three way policy as the small zone: resize in place, grow into a
    /// free neighbour, or move. Moving allocates the replacement first (which
    /// may map a new region), copies the contents and then frees the old
    /// block, so on [`Error::MappingFailure`] the old block is still valid.
    pub unsafe fn realloc(&mut self, address: NonNull<u8>, size: usize) -> Result<Pointer<u8>> {
        let (region, cursor) = self.locate(address)?;

        if size == 0 {
            self.free(address)?;
            return Ok(None);
        }

        if capacity_for(size).is_none() {
            return Err(Error::SizeRejected { size });
        }

        let chain = Header::<Region>::chain_of(region);

        if chain.resize_in_place(cursor.offset, size) {
            trace!(?address, size, "big realloc in place");
            return Ok(Some(address));
        }

        let old_size = chain.block(cursor.offset).used;
        let new_address = self.alloc(size)?;
        ptr::copy_nonoverlapping(address.as_ptr(), new_address.as_ptr(), old_size.min(size));
        self.free(address)?;
        trace!(?address, ?new_address, size, "big realloc moved");

        Ok(Some(new_address))
    }

    /// Used length of the block at `address`, 0 if it's not a live block.
    pub fn size_of(&self, address: NonNull<u8>) -> usize {
        match unsafe { self.locate(address) } {
            Ok((region, cursor)) => unsafe {
                Header::<Region>::chain_of(region).block(cursor.offset).used
            },
            Err(_) => 0,
        }
    }

    /// Calls `f` with the address and used length of every live block, region
    /// by region.
    pub fn for_each_live(&self, mut f: impl FnMut(NonNull<u8>, usize)) {
        for region in self.regions.iter() {
            self.for_each_live_in(region, &mut f);
        }
    }

    /// Same as [`Self::for_each_live`] but only for one of our regions.
    pub fn for_each_live_in(
        &self,
        region: NonNull<Header<Region>>,
        mut f: impl FnMut(NonNull<u8>, usize),
    ) {
        unsafe {
            let chain = Header::<Region>::chain_of(region);
            for (offset, block) in chain.iter() {
                if !block.is_free() {
                    f(chain.payload(offset), block.used);
                }
            }
        }
    }

    /// Unlinks `region` and gives it back to the kernel. Region has to be
    /// removed before unmapping, otherwise seg fault.
    unsafe fn return_region(&mut self, region: NonNull<Header<Region>>) {
        let length = region.as_ref().length();
        let removed = self.regions.remove(region);
        debug_assert!(removed, "region {region:?} is not in the list");
        platform::return_memory(region.cast(), length);
    }

    /// Unmaps every region, live blocks included.
    pub fn release(&mut self) {
        while let Some(region) = self.regions.first() {
            unsafe { self.return_region(region) };
        }
    }
}

impl Drop for ArenaFreeListAllocator {
    fn drop(&mut self) {
        self.release();
    }
}
