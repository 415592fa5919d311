use std::{mem, ptr::NonNull};

use crate::{
    align::{align, ALIGNMENT},
    error::{Error, Result},
};

/// Block header size in bytes, padded to the alignment unit so that payloads
/// are aligned whenever headers are. See [`Block`].
pub(crate) const BLOCK_HEADER_SIZE: usize = align(mem::size_of::<Block>());

/// Smallest capacity a block can have. A free remainder is only carved when it
/// can hold a header plus this many bytes.
pub(crate) const MIN_BLOCK_CAPACITY: usize = ALIGNMENT;

/// End of chain marker for [`Block::next`].
const NIL: usize = usize::MAX;

/// Variable size block header, written inline right before the payload it
/// describes. Both the small zone and every big region carve their memory into
/// a chain of these:
///
/// ```text
/// +----------------------------+          <----------------------+
/// | capacity                   |                                 |
/// +----------------------------+                                 |
/// | used (0 = free)            |                                 | BLOCK_HEADER_SIZE
/// +----------------------------+                                 |
/// | offset of next block       |                                 |
/// +----------------------------+                                 |
/// | padding                    |                                 |
/// +----------------------------+          <----------------------+
/// |       Block payload        |   <------+
/// |            ...             |          | capacity bytes, the caller
/// |            ...             |          | may write `used` of them.
/// |            ...             |   <------+
/// +----------------------------+
/// ```
///
/// Links are byte offsets from the start of the block area instead of
/// pointers, so a block can only ever point inside its own region and the
/// chain order is the address order.
#[repr(C)]
pub(crate) struct Block {
    /// Payload bytes excluding the header. Always a multiple of [`ALIGNMENT`].
    pub capacity: usize,
    /// Exact number of bytes requested by the caller, never the rounded
    /// capacity. Zero means the block is free.
    pub used: usize,
    /// Offset of the next block or [`NIL`].
    next: usize,
}

impl Block {
    #[inline]
    pub fn is_free(&self) -> bool {
        self.used == 0
    }

    /// Capacity plus header.
    #[inline]
    pub fn total_size(&self) -> usize {
        BLOCK_HEADER_SIZE + self.capacity
    }

    #[inline]
    pub fn next(&self) -> Option<usize> {
        (self.next != NIL).then_some(self.next)
    }
}

/// Capacity that a request of `size` bytes needs. `None` on overflow.
#[inline]
pub(crate) fn capacity_for(size: usize) -> Option<usize> {
    Some(size.checked_add(ALIGNMENT - 1)? & !(ALIGNMENT - 1))
}

/// Position of a block inside a [`Chain`], together with the block right
/// before it. Coalescing needs both and we get both for free while scanning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Cursor {
    pub prev: Option<usize>,
    pub offset: usize,
}

/// View over a block area: a contiguous piece of a region that is completely
/// tiled by blocks, starting with a block at offset 0.
///
/// ```text
/// area                                                        area + length
/// +--------+---------+--------+---------+--------+-----------------+
/// | Header | Payload | Header | Payload | Header |     Payload     |
/// +--------+---------+--------+---------+--------+-----------------+
///   offset 0           next ->            next ->   next = NIL
/// ```
///
/// The view is `Copy` and doesn't own anything. Every method is unsafe in the
/// sense that the area must be mapped and formatted, which the zones
/// guarantee for as long as they hold the view.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Chain {
    area: NonNull<u8>,
    length: usize,
}

impl Chain {
    /// Builds a view over an area that already contains a chain.
    #[inline]
    pub unsafe fn from_raw_parts(area: NonNull<u8>, length: usize) -> Self {
        Self { area, length }
    }

    /// Formats the area as one single free block that spans all of it.
    ///
    /// # Safety
    ///
    /// `area` must be aligned, writable for `length` bytes and `length` must
    /// be a multiple of [`ALIGNMENT`] that fits at least one block.
    pub unsafe fn format_free(area: NonNull<u8>, length: usize) -> Self {
        let chain = Self { area, length };
        chain.write(0, length - BLOCK_HEADER_SIZE, 0, NIL);
        chain
    }

    /// Formats the area with a used block of `size` bytes at its head. If the
    /// remainder after that block is larger than two headers, a trailing free
    /// block captures it, otherwise the head block takes the whole area.
    ///
    /// # Safety
    ///
    /// Same as [`Self::format_free`], plus `capacity_for(size)` must fit in
    /// the area.
    pub unsafe fn format_used(area: NonNull<u8>, length: usize, size: usize) -> Self {
        let chain = Self { area, length };
        let capacity = align(size);
        let remainder = length - BLOCK_HEADER_SIZE - capacity;

        if remainder > 2 * BLOCK_HEADER_SIZE {
            let next = BLOCK_HEADER_SIZE + capacity;
            chain.write(0, capacity, size, next);
            chain.write(next, remainder - BLOCK_HEADER_SIZE, 0, NIL);
        } else {
            chain.write(0, length - BLOCK_HEADER_SIZE, size, NIL);
        }

        chain
    }

    #[inline]
    pub fn area(&self) -> NonNull<u8> {
        self.area
    }

    #[inline]
    pub fn length(&self) -> usize {
        self.length
    }

    /// Converts `address` into an offset inside this area, or `None` if it
    /// lies outside of it. Addresses are compared as integers relative to the
    /// area base, never ordered against pointers from other mappings.
    #[inline]
    pub fn offset_of(&self, address: NonNull<u8>) -> Option<usize> {
        let offset = (address.as_ptr() as usize).checked_sub(self.area.as_ptr() as usize)?;
        (offset < self.length).then_some(offset)
    }

    #[inline]
    unsafe fn header(&self, offset: usize) -> *mut Block {
        self.area.as_ptr().add(offset).cast()
    }

    #[inline]
    unsafe fn write(&self, offset: usize, capacity: usize, used: usize, next: usize) {
        self.header(offset).write(Block {
            capacity,
            used,
            next,
        });
    }

    #[inline]
    pub unsafe fn block(&self, offset: usize) -> &Block {
        &*self.header(offset)
    }

    #[inline]
    unsafe fn block_mut(&self, offset: usize) -> &mut Block {
        &mut *self.header(offset)
    }

    /// Address handed out to the caller for the block at `offset`.
    #[inline]
    pub unsafe fn payload(&self, offset: usize) -> NonNull<u8> {
        NonNull::new_unchecked(self.area.as_ptr().add(offset + BLOCK_HEADER_SIZE))
    }

    /// Iterates over `(offset, block)` pairs in address order.
    pub fn iter(&self) -> Blocks<'_> {
        Blocks {
            chain: self,
            current: Some(0),
        }
    }

    /// Finds the live block whose payload starts exactly at `address`.
    ///
    /// Errors:
    /// - [`Error::PointerOutOfRange`] if `address` is not inside this area.
    /// - [`Error::InvalidPointer`] if no block payload starts at `address`.
    /// - [`Error::NotFound`] if the block exists but is free.
    pub unsafe fn find(&self, address: NonNull<u8>) -> Result<Cursor> {
        let target = self.offset_of(address).ok_or(Error::PointerOutOfRange)?;

        let mut prev = None;
        let mut current = Some(0);

        while let Some(offset) = current {
            let payload = offset + BLOCK_HEADER_SIZE;

            if payload == target {
                if self.block(offset).is_free() {
                    return Err(Error::NotFound);
                }

                return Ok(Cursor { prev, offset });
            }

            // Offsets only grow, we've already passed the target.
            if payload > target {
                break;
            }

            prev = current;
            current = self.block(offset).next();
        }

        Err(Error::InvalidPointer)
    }

    /// First fit: returns the first free block that can hold `capacity`
    /// bytes.
    pub unsafe fn first_fit(&self, capacity: usize) -> Option<usize> {
        self.iter()
            .find(|(_, block)| block.is_free() && block.capacity >= capacity)
            .map(|(offset, _)| offset)
    }

    /// Marks the free block at `offset` as used by `size` bytes, splitting off
    /// whatever it doesn't need. The block must be able to hold `size`.
    pub unsafe fn take(&self, offset: usize, size: usize) -> NonNull<u8> {
        self.split_if_possible(offset, align(size));
        self.block_mut(offset).used = size;
        self.payload(offset)
    }

    /// Block splitting. Let's say we have a free block that can hold 512
    /// bytes and a request needs 64 bytes. We'll split the block in two:
    ///
    /// **Before**:
    ///
    /// ```text
    ///         +-->  +-----------+
    ///         |     |   Header  | <- H bytes.
    /// Block   |     +-----------+
    ///         |     |  Payload  | <- 512 bytes.
    ///         +-->  +-----------+
    /// ```
    /// **After**:
    ///
    /// ```text
    ///         +-->  +-----------+
    ///         |     |   Header  | <- H bytes.
    /// Block 1 |     +-----------+
    ///         |     |  Payload  | <- 64 bytes.
    ///         +-->  +-----------+
    ///         |     |   Header  | <- H bytes.
    /// Block 2 |     +-----------+
    ///         |     |  Payload  | <- 512 bytes - 64 bytes - H bytes.
    ///         +-->  +-----------+
    /// ```
    ///
    /// If the remainder can't hold a header plus [`MIN_BLOCK_CAPACITY`] the
    /// block stays as it is and the extra bytes remain reserved to it.
    unsafe fn split_if_possible(&self, offset: usize, capacity: usize) {
        let block = self.block_mut(offset);

        if block.capacity < capacity + BLOCK_HEADER_SIZE + MIN_BLOCK_CAPACITY {
            return;
        }

        let remainder = offset + BLOCK_HEADER_SIZE + capacity;
        self.write(
            remainder,
            block.capacity - capacity - BLOCK_HEADER_SIZE,
            0,
            block.next,
        );

        block.capacity = capacity;
        block.next = remainder;
    }

    /// Merges the block that follows `offset` into it. The next block must
    /// exist.
    ///
    /// ```text
    /// +----------------+---------------+
    /// |    Block A     |   Block B     |
    /// +----------------+---------------+
    ///        ^                 |
    ///        |                 |
    ///        +-----------------+
    ///           Merge B into A
    /// ```
    unsafe fn absorb_next(&self, offset: usize) {
        let next = self.block(offset).next;
        let (capacity, after) = {
            let absorbed = self.block(next);
            (absorbed.total_size(), absorbed.next)
        };

        let block = self.block_mut(offset);
        block.capacity += capacity;
        block.next = after;
    }

    /// Frees the block under `cursor` and coalesces it with its neighbours,
    /// one hop in each direction:
    ///
    /// ```text
    /// +--------+---------+--------+         +--------------------------+
    /// | A free | B freed | C free |   =>    |      A + B + C + 2H      |
    /// +--------+---------+--------+         +--------------------------+
    /// ```
    ///
    /// The next block is absorbed first, then the previous block absorbs the
    /// result. Returns the offset of the resulting free block.
    pub unsafe fn release(&self, cursor: Cursor) -> usize {
        self.block_mut(cursor.offset).used = 0;

        if self
            .block(cursor.offset)
            .next()
            .is_some_and(|next| self.block(next).is_free())
        {
            self.absorb_next(cursor.offset);
        }

        match cursor.prev {
            Some(prev) if self.block(prev).is_free() => {
                self.absorb_next(prev);
                prev
            }
            _ => cursor.offset,
        }
    }

    /// Tries to resize the live block at `offset` to `size` bytes without
    /// moving it. Shrinking, or growing within the current capacity, only
    /// updates `used`. Otherwise the following block is absorbed if it is free
    /// and the combined capacity is enough; any surplus that can hold a block
    /// is split off again. Returns `false` if none of that is possible.
    pub unsafe fn resize_in_place(&self, offset: usize, size: usize) -> bool {
        let capacity = align(size);
        let block = self.block(offset);

        if block.capacity >= capacity {
            self.block_mut(offset).used = size;
            return true;
        }

        let Some(next) = block.next() else {
            return false;
        };

        let neighbour = self.block(next);
        if !neighbour.is_free() || block.capacity + neighbour.total_size() < capacity {
            return false;
        }

        self.absorb_next(offset);
        self.split_if_possible(offset, capacity);
        self.block_mut(offset).used = size;

        true
    }

    /// Number of blocks currently in use.
    #[cfg(test)]
    pub fn live_blocks(&self) -> usize {
        self.iter().filter(|(_, block)| !block.is_free()).count()
    }

    /// Panics if the chain is broken: blocks must be aligned, in strictly
    /// increasing order, never overlap and tile the whole area.
    #[cfg(test)]
    pub fn check_invariants(&self) {
        let mut expected = 0;

        for (offset, block) in self.iter() {
            assert_eq!(offset, expected, "gap or overlap at offset {offset}");
            assert_eq!(offset % ALIGNMENT, 0);
            assert_eq!(block.capacity % ALIGNMENT, 0);
            assert!(block.used <= block.capacity);
            expected = offset + block.total_size();
        }

        assert_eq!(expected, self.length, "chain doesn't cover the area");
    }
}

/// See [`Chain::iter`].
pub(crate) struct Blocks<'c> {
    chain: &'c Chain,
    current: Option<usize>,
}

impl<'c> Iterator for Blocks<'c> {
    type Item = (usize, &'c Block);

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.current?;
        let chain = self.chain;
        let block = unsafe { chain.block(offset) };
        self.current = block.next();
        Some((offset, block))
    }
}
