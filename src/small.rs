use std::ptr::{self, NonNull};

use tracing::trace;

use crate::{
    align::{align, page_round},
    block::{Chain, BLOCK_HEADER_SIZE},
    error::{Error, Result},
    platform, Pointer,
};

/// Free list zone for medium requests. All of its blocks live in one single
/// region that is mapped on first use and sized for a fixed number of maximum
/// size blocks. The region never grows: when no block is large enough the
/// zone reports [`Error::Exhausted`] and the dispatcher escalates to the big
/// zone.
///
/// ```text
/// +-------+    +-------+    +-------+    +-----------------------------+
/// | Block | -> | Free  | -> | Block | -> |        Free (rest)          |
/// +-------+    +-------+    +-------+    +-----------------------------+
/// ^                                                                    ^
/// region base                                          base + length
/// ```
///
/// When the last live block is freed the region goes back to the kernel.
pub(crate) struct FreeListAllocator {
    max_size: usize,
    block_count: usize,
    /// Block chain of the mapped region, `None` while uninitialized.
    chain: Option<Chain>,
    /// Number of used blocks.
    live: usize,
}

impl FreeListAllocator {
    pub const fn new(max_size: usize, block_count: usize) -> Self {
        Self {
            max_size,
            block_count,
            chain: None,
            live: 0,
        }
    }

    #[inline]
    pub fn region_length(&self) -> usize {
        page_round(self.block_count * (BLOCK_HEADER_SIZE + align(self.max_size)))
    }

    #[inline]
    pub fn live(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn base(&self) -> Pointer<u8> {
        self.chain.map(|chain| chain.area())
    }

    #[cfg(test)]
    pub(crate) fn chain(&self) -> Option<Chain> {
        self.chain
    }

    unsafe fn chain_or_map(&mut self) -> Result<Chain> {
        if let Some(chain) = self.chain {
            return Ok(chain);
        }

        let length = self.region_length();
        let base = platform::request_memory(length).ok_or(Error::MappingFailure { length })?;
        let chain = Chain::format_free(base, length);

        self.chain = Some(chain);
        self.live = 0;

        Ok(chain)
    }

    #[inline]
    fn mapped_chain(&self) -> Result<Chain> {
        self.chain.ok_or(Error::PointerOutOfRange)
    }

    /// First fit allocation, splitting the block found if it's larger than
    /// needed.
    pub unsafe fn alloc(&mut self, size: usize) -> Result<NonNull<u8>> {
        if size == 0 || size > self.max_size {
            return Err(Error::SizeRejected { size });
        }

        let chain = self.chain_or_map()?;
        let offset = chain.first_fit(align(size)).ok_or(Error::Exhausted)?;
        let address = chain.take(offset, size);
        self.live += 1;

        trace!(?address, size, offset, "small alloc");

        Ok(address)
    }

    /// Frees the block at `address` and coalesces it with its neighbours.
    pub unsafe fn free(&mut self, address: NonNull<u8>) -> Result<()> {
        let chain = self.mapped_chain()?;
        let cursor = chain.find(address)?;

        chain.release(cursor);
        self.live -= 1;
        trace!(?address, live = self.live, "small free");

        if self.live == 0 {
            self.release();
        }

        Ok(())
    }

    /// Resizes the block at `address`:
    ///
    /// 1. If the new size fits the current capacity, only `used` changes.
    /// 2. If the next block is free and both together are enough, the block
    ///    grows into it.
    /// 3. Otherwise a new block is taken somewhere else in the region, the
    ///    contents are copied and the old block is freed.
    ///
    /// Sizes above the zone maximum are [`Error::SizeRejected`] and a full
    /// region is [`Error::Exhausted`]; in both cases the old block stays
    /// untouched so the caller can move it to another zone. Zero frees the
    /// block and returns `None`.
    pub unsafe fn realloc(&mut self, address: NonNull<u8>, size: usize) -> Result<Pointer<u8>> {
        let chain = self.mapped_chain()?;
        let cursor = chain.find(address)?;

        if size == 0 {
            self.free(address)?;
            return Ok(None);
        }

        if size > self.max_size {
            return Err(Error::SizeRejected { size });
        }

        if chain.resize_in_place(cursor.offset, size) {
            trace!(?address, size, "small realloc in place");
            return Ok(Some(address));
        }

        let old_size = chain.block(cursor.offset).used;
        let offset = chain.first_fit(align(size)).ok_or(Error::Exhausted)?;
        let new_address = chain.take(offset, size);
        ptr::copy_nonoverlapping(address.as_ptr(), new_address.as_ptr(), old_size.min(size));
        self.live += 1;

        // Taking the new block may have split the old block's predecessor.
        self.free(address)?;
        trace!(?address, ?new_address, size, "small realloc moved");

        Ok(Some(new_address))
    }

    /// Used length of the block at `address`, 0 if it's not a live block.
    pub fn size_of(&self, address: NonNull<u8>) -> usize {
        let Some(chain) = self.chain else {
            return 0;
        };

        unsafe {
            match chain.find(address) {
                Ok(cursor) => chain.block(cursor.offset).used,
                Err(_) => 0,
            }
        }
    }

    /// Calls `f` with the address and used length of every live block.
    pub fn for_each_live(&self, mut f: impl FnMut(NonNull<u8>, usize)) {
        let Some(chain) = self.chain else {
            return;
        };

        unsafe {
            for (offset, block) in chain.iter() {
                if !block.is_free() {
                    f(chain.payload(offset), block.used);
                }
            }
        }
    }

    /// Unmaps the region, live blocks included, and goes back to
    /// uninitialized.
    pub fn release(&mut self) {
        if let Some(chain) = self.chain.take() {
            unsafe { platform::return_memory(chain.area(), chain.length()) };
        }

        self.live = 0;
    }
}

impl Drop for FreeListAllocator {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ALIGNMENT;

    const MAX: usize = 4066;
    const COUNT: usize = 100;
    const H: usize = BLOCK_HEADER_SIZE;

    fn zone() -> FreeListAllocator {
        FreeListAllocator::new(MAX, COUNT)
    }

    fn region_bounds(zone: &FreeListAllocator) -> (usize, usize) {
        let chain = zone.chain().unwrap();
        let start = chain.area().as_ptr() as usize;
        (start, start + chain.length())
    }

    #[test]
    fn alloc_within_region() {
        let mut zone = zone();

        unsafe {
            for size in [65, 100, 1000, MAX] {
                let address = zone.alloc(size).unwrap();
                let (start, end) = region_bounds(&zone);

                assert!((start..end).contains(&(address.as_ptr() as usize)));
                assert_eq!(address.as_ptr() as usize % ALIGNMENT, 0);
                assert_eq!(zone.size_of(address), size);
                address.as_ptr().write_bytes(0x5A, size);
            }

            zone.chain().unwrap().check_invariants();
            assert_eq!(zone.live(), 4);
        }
    }

    #[test]
    fn rejects_bad_sizes() {
        let mut zone = zone();

        unsafe {
            assert_eq!(zone.alloc(0), Err(Error::SizeRejected { size: 0 }));
            assert_eq!(zone.alloc(MAX + 1), Err(Error::SizeRejected { size: MAX + 1 }));
        }

        assert!(zone.base().is_none());
    }

    #[test]
    fn exhaustion() {
        let mut zone = FreeListAllocator::new(MAX, 2);

        unsafe {
            let mut addresses = Vec::new();
            loop {
                match zone.alloc(MAX) {
                    Ok(address) => addresses.push(address),
                    Err(error) => {
                        assert_eq!(error, Error::Exhausted);
                        break;
                    }
                }
            }

            // Sized for at least two max blocks, and it's finite.
            assert!(addresses.len() >= 2);
            zone.chain().unwrap().check_invariants();
        }
    }

    #[test]
    fn coalescing_both_orders() {
        for reverse in [false, true] {
            let mut zone = zone();

            unsafe {
                let a = zone.alloc(100).unwrap();
                let b = zone.alloc(100).unwrap();
                // Keeps the region alive and bounds the merged space.
                let guard = zone.alloc(100).unwrap();

                let (first, second) = if reverse { (b, a) } else { (a, b) };
                zone.free(first).unwrap();
                zone.free(second).unwrap();
                zone.chain().unwrap().check_invariants();

                // Two 112 byte capacities plus the header between them.
                let merged = 2 * align(100) + H;
                let address = zone.alloc(merged).unwrap();
                assert_eq!(address, a);

                zone.free(address).unwrap();
                zone.free(guard).unwrap();
                assert!(zone.base().is_none());
            }
        }
    }

    #[test]
    fn free_errors() {
        let mut zone = zone();

        unsafe {
            let outside = NonNull::new_unchecked(0x10 as *mut u8);
            assert_eq!(zone.free(outside), Err(Error::PointerOutOfRange));

            let address = zone.alloc(200).unwrap();
            let keep = zone.alloc(200).unwrap();

            let inside = NonNull::new_unchecked(address.as_ptr().add(8));
            assert_eq!(zone.free(inside), Err(Error::InvalidPointer));

            zone.free(address).unwrap();
            assert_eq!(zone.free(address), Err(Error::NotFound));
            assert_eq!(zone.live(), 1);
            assert_eq!(zone.size_of(keep), 200);
        }
    }

    #[test]
    fn teardown_and_rebirth() {
        let mut zone = zone();

        unsafe {
            let address = zone.alloc(500).unwrap();
            zone.free(address).unwrap();

            assert!(zone.base().is_none());
            assert_eq!(zone.size_of(address), 0);

            let again = zone.alloc(700).unwrap();
            assert_eq!(zone.size_of(again), 700);
            assert_eq!(zone.live(), 1);
        }
    }

    #[test]
    fn realloc_policies() {
        let mut zone = zone();

        unsafe {
            let a = zone.alloc(100).unwrap();
            let b = zone.alloc(100).unwrap();
            let c = zone.alloc(100).unwrap();
            a.as_ptr().write_bytes(7, 100);

            // Shrink keeps the capacity reserved.
            assert_eq!(zone.realloc(a, 10), Ok(Some(a)));
            assert_eq!(zone.size_of(a), 10);
            assert_eq!(zone.realloc(a, 100), Ok(Some(a)));

            // Grow into the next block once it's free.
            zone.free(b).unwrap();
            assert_eq!(zone.realloc(a, 200), Ok(Some(a)));
            assert_eq!(zone.size_of(a), 200);
            zone.chain().unwrap().check_invariants();

            // Can't grow, C is in the way: the block moves and keeps its
            // contents.
            let moved = zone.realloc(a, 1000).unwrap().unwrap();
            assert_ne!(moved, a);
            assert_eq!(zone.size_of(moved), 1000);
            assert_eq!(zone.size_of(a), 0);
            for i in 0..100 {
                assert_eq!(*moved.as_ptr().add(i), 7);
            }
            assert_eq!(zone.live(), 2);
            zone.chain().unwrap().check_invariants();

            // Too big for this zone, nothing changes.
            assert_eq!(
                zone.realloc(c, MAX + 1),
                Err(Error::SizeRejected { size: MAX + 1 })
            );
            assert_eq!(zone.size_of(c), 100);

            assert_eq!(zone.realloc(c, 0), Ok(None));
            assert_eq!(zone.realloc(moved, 0), Ok(None));
            assert!(zone.base().is_none());
        }
    }
}
