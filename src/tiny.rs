use std::{mem, ptr::NonNull, slice};

use tracing::trace;

use crate::{
    align::{align, page_round},
    error::{Error, Result},
    platform, Pointer,
};

/// Fixed size slot pool for the tiniest requests. There's no splitting and no
/// coalescing, every slot has the same size. The whole pool is one region
/// that starts with a table of used lengths, one entry per slot, followed by
/// the slots themselves:
///
/// ```text
/// base
/// +-----+-----+-----+-----+---------+--------+--------+--------+-----+
/// |  u0 |  u1 |  u2 | ... | padding | slot 0 | slot 1 | slot 2 | ... |
/// +-----+-----+-----+-----+---------+--------+--------+--------+-----+
///  used length table (0 = free)     ^
///                                   +-- storage, aligned.
/// ```
///
/// The region is mapped on the first allocation and unmapped as soon as the
/// last live slot is freed, so the next allocation starts from scratch.
pub(crate) struct SlotAllocator {
    slot_size: usize,
    slot_count: usize,
    /// Base of the mapped region, `None` while uninitialized.
    region: Pointer<u8>,
    /// Number of used slots.
    live: usize,
}

type UsedLength = u16;

impl SlotAllocator {
    pub const fn new(slot_size: usize, slot_count: usize) -> Self {
        Self {
            slot_size,
            slot_count,
            region: None,
            live: 0,
        }
    }

    /// Offset of the first slot from the region base.
    #[inline]
    fn storage_offset(&self) -> usize {
        align(self.slot_count * mem::size_of::<UsedLength>())
    }

    #[inline]
    fn storage_length(&self) -> usize {
        self.slot_count * self.slot_size
    }

    /// Length we request from the kernel, table and storage rounded up to
    /// whole pages.
    #[inline]
    pub fn region_length(&self) -> usize {
        page_round(self.storage_offset() + self.storage_length())
    }

    #[inline]
    pub fn live(&self) -> usize {
        self.live
    }

    /// Base of the mapped region, if any.
    #[inline]
    pub fn base(&self) -> Pointer<u8> {
        self.region
    }

    /// Used length table. Only valid while the region is mapped.
    #[inline]
    unsafe fn table(&mut self, region: NonNull<u8>) -> &mut [UsedLength] {
        slice::from_raw_parts_mut(region.cast().as_ptr(), self.slot_count)
    }

    #[inline]
    unsafe fn slot_address(&self, region: NonNull<u8>, index: usize) -> NonNull<u8> {
        NonNull::new_unchecked(
            region
                .as_ptr()
                .add(self.storage_offset() + index * self.slot_size),
        )
    }

    /// Maps the region if we don't have one yet. Fresh anonymous memory is
    /// zeroed, so the whole table starts out free.
    unsafe fn region_or_map(&mut self) -> Result<NonNull<u8>> {
        if let Some(region) = self.region {
            return Ok(region);
        }

        let length = self.region_length();
        let region = platform::request_memory(length).ok_or(Error::MappingFailure { length })?;
        self.region = Some(region);
        self.live = 0;

        Ok(region)
    }

    /// Hands out the first free slot and records `size` as its used length.
    pub unsafe fn alloc(&mut self, size: usize) -> Result<NonNull<u8>> {
        if size == 0 || size > self.slot_size {
            return Err(Error::SizeRejected { size });
        }

        let region = self.region_or_map()?;
        let table = self.table(region);

        let Some(index) = table.iter().position(|used| *used == 0) else {
            return Err(Error::Exhausted);
        };

        table[index] = size as UsedLength;
        self.live += 1;

        let address = self.slot_address(region, index);
        trace!(?address, size, index, "tiny alloc");

        Ok(address)
    }

    /// Converts `address` into a slot index. The address must be inside the
    /// storage area and point exactly at the start of a slot.
    fn slot_index(&self, address: NonNull<u8>) -> Result<(NonNull<u8>, usize)> {
        let region = self.region.ok_or(Error::PointerOutOfRange)?;

        let storage = region.as_ptr() as usize + self.storage_offset();
        let offset = (address.as_ptr() as usize)
            .checked_sub(storage)
            .ok_or(Error::PointerOutOfRange)?;

        if offset >= self.storage_length() || offset % self.slot_size != 0 {
            return Err(Error::PointerOutOfRange);
        }

        Ok((region, offset / self.slot_size))
    }

    /// Frees the slot at `address`. Unmaps the whole pool when it was the last
    /// one in use.
    pub unsafe fn free(&mut self, address: NonNull<u8>) -> Result<()> {
        let (region, index) = self.slot_index(address)?;
        let table = self.table(region);

        if table[index] == 0 {
            return Err(Error::NotFound);
        }

        table[index] = 0;
        self.live -= 1;
        trace!(?address, index, live = self.live, "tiny free");

        if self.live == 0 {
            self.release();
        }

        Ok(())
    }

    /// Resizes the slot at `address` in place. Any size up to the slot size
    /// fits, anything larger is [`Error::SizeRejected`] and must move to
    /// another zone. Zero frees the slot and returns `None`.
    pub unsafe fn realloc(&mut self, address: NonNull<u8>, size: usize) -> Result<Pointer<u8>> {
        let (region, index) = self.slot_index(address)?;

        if self.table(region)[index] == 0 {
            return Err(Error::NotFound);
        }

        if size == 0 {
            self.free(address)?;
            return Ok(None);
        }

        if size > self.slot_size {
            return Err(Error::SizeRejected { size });
        }

        self.table(region)[index] = size as UsedLength;
        trace!(?address, size, index, "tiny realloc in place");

        Ok(Some(address))
    }

    /// Used length of the slot at `address`, 0 if it's not a live slot.
    pub fn size_of(&self, address: NonNull<u8>) -> usize {
        match self.slot_index(address) {
            Ok((region, index)) => unsafe {
                *region.cast::<UsedLength>().as_ptr().add(index) as usize
            },
            Err(_) => 0,
        }
    }

    /// Calls `f` with the address and used length of every live slot.
    pub fn for_each_live(&self, mut f: impl FnMut(NonNull<u8>, usize)) {
        let Some(region) = self.region else {
            return;
        };

        unsafe {
            let table = slice::from_raw_parts(region.cast::<UsedLength>().as_ptr(), self.slot_count);
            for (index, used) in table.iter().enumerate() {
                if *used != 0 {
                    f(self.slot_address(region, index), *used as usize);
                }
            }
        }
    }

    /// Unmaps the pool, live slots included, and goes back to uninitialized.
    pub fn release(&mut self) {
        if let Some(region) = self.region.take() {
            unsafe { platform::return_memory(region, self.region_length()) };
        }

        self.live = 0;
    }
}

impl Drop for SlotAllocator {
    fn drop(&mut self) {
        self.release();
    }
}
