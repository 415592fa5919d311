use std::{
    alloc::{GlobalAlloc, Layout},
    fmt,
    ptr::{self, NonNull},
    sync::{Mutex, MutexGuard, PoisonError},
};

use tracing::{trace, warn};

use crate::{
    align::ALIGNMENT,
    arena::ArenaFreeListAllocator,
    config::Config,
    error::{Error, Result},
    realloc::Realloc,
    report::{LiveAllocation, Stats, Zone},
    small::FreeListAllocator,
    tiny::SlotAllocator,
    Pointer,
};

/// This is the main allocator, it owns one instance of each zone and routes
/// every request by size. Once you've read [`crate::tiny`], [`crate::block`],
/// [`crate::small`], [`crate::region`] and [`crate::arena`], this is where the
/// circle gets completed:
///
/// ```text
///                     +-----+-----+-----+---------+--------+--------+--------+
/// tiny  (size <= S)   |  u0 |  u1 | ... | padding | slot 0 | slot 1 |  ...   |
///                     +-----+-----+-----+---------+--------+--------+--------+
///
///                     +-------+    +-------+    +-------+    +----------------+
/// small (size <= M)   | Block | -> | Free  | -> | Block | -> |      Free      |
///                     +-------+    +-------+    +-------+    +----------------+
///
///                     +--------+------------------------+      +--------+-------------------------------------+
///                     |        | +-------+    +-------+ |      |        | +-------+    +-------+    +-------+ |
/// big   (size > M)    | Region | | Block | -> | Free  | | ---> | Region | | Free  | -> | Block | -> | Free  | |
///                     |        | +-------+    +-------+ |      |        | +-------+    +-------+    +-------+ |
///                     +--------+------------------------+      +--------+-------------------------------------+
/// ```
///
/// Zones don't expose a cheap range test for arbitrary pointers, so `free`,
/// `realloc` and `size_of` probe them in order, tiny first. A zone that
/// doesn't own the pointer answers [`Error::PointerOutOfRange`] and the next
/// one is asked.
///
/// This struct is not thread safe and it also needs mutable borrows to
/// operate, so it has to be wrapped in some container like [`Mutex`] to be
/// used as [`GlobalAlloc`]. See [`SyncZoneAllocator`].
///
/// # Drop
///
/// This struct doesn't implement [`Drop`] because region unmapping is
/// implemented by each zone. The compiler calls [`Drop::drop`] on all the
/// struct members one by one, so every region goes back to the kernel when
/// the allocator is dropped.
///
/// # Examples
///
/// ```rust
/// use zonealloc::{Zone, ZoneAllocator};
///
/// let mut allocator = ZoneAllocator::default();
///
/// let tiny = allocator.alloc(10);
/// let big = allocator.alloc(5000);
///
/// assert_eq!(allocator.zone_of(tiny), Some(Zone::Tiny));
/// assert_eq!(allocator.size_of(big), 5000);
///
/// unsafe {
///     let grown = allocator.realloc(tiny, 100);
///     assert_eq!(allocator.zone_of(grown), Some(Zone::Small));
///
///     allocator.free(grown).unwrap();
///     allocator.free(big).unwrap();
/// }
///
/// assert_eq!(allocator.stats().total_live(), 0);
/// ```
pub struct ZoneAllocator {
    config: Config,
    tiny: SlotAllocator,
    small: FreeListAllocator,
    big: ArenaFreeListAllocator,
}

// Regions are owned by exactly one allocator and never shared, moving the
// whole thing to another thread moves the ownership with it.
unsafe impl Send for ZoneAllocator {}

impl ZoneAllocator {
    /// Builds an allocator with [`Config::DEFAULT`].
    pub const fn with_default_config() -> Self {
        Self::with_config(Config::DEFAULT)
    }

    /// Builds an allocator with the given configuration. Nothing is mapped
    /// until the first allocation. The configuration is not checked here so
    /// that this can be used in `static` items, see [`Self::try_with_config`].
    pub const fn with_config(config: Config) -> Self {
        Self {
            config,
            tiny: SlotAllocator::new(config.tiny_slot_size, config.tiny_slot_count),
            small: FreeListAllocator::new(config.small_max_size, config.small_block_count),
            big: ArenaFreeListAllocator::new(config.big_dedicated_pages, config.big_region_pages),
        }
    }

    /// Same as [`Self::with_config`] but rejects configurations that
    /// [`Config::validate`] doesn't like.
    pub fn try_with_config(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_config(config))
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Size class of a request of `size` bytes.
    pub fn zone_for(&self, size: usize) -> Zone {
        if size <= self.config.tiny_slot_size {
            Zone::Tiny
        } else if size <= self.config.small_max_size {
            Zone::Small
        } else {
            Zone::Big
        }
    }

    unsafe fn alloc_in(&mut self, zone: Zone, size: usize) -> Result<NonNull<u8>> {
        match zone {
            Zone::Tiny => self.tiny.alloc(size),
            Zone::Small => self.small.alloc(size),
            Zone::Big => self.big.alloc(size),
        }
    }

    unsafe fn free_in(&mut self, zone: Zone, address: NonNull<u8>) -> Result<()> {
        match zone {
            Zone::Tiny => self.tiny.free(address),
            Zone::Small => self.small.free(address),
            Zone::Big => self.big.free(address),
        }
    }

    unsafe fn realloc_in(
        &mut self,
        zone: Zone,
        address: NonNull<u8>,
        size: usize,
    ) -> Result<Pointer<u8>> {
        match zone {
            Zone::Tiny => self.tiny.realloc(address, size),
            Zone::Small => self.small.realloc(address, size),
            Zone::Big => self.big.realloc(address, size),
        }
    }

    fn size_in(&self, zone: Zone, address: NonNull<u8>) -> usize {
        match zone {
            Zone::Tiny => self.tiny.size_of(address),
            Zone::Small => self.small.size_of(address),
            Zone::Big => self.big.size_of(address),
        }
    }

    /// Returns an address where `size` bytes can be safely written, aligned to
    /// [`ALIGNMENT`], or `None` if `size` is zero or no memory is available.
    ///
    /// The request goes to the zone of its size class. If that zone is
    /// exhausted it escalates to the next larger class, so a tiny request can
    /// end up in the small zone and a small one in the big zone. Mapping
    /// failures are never retried.
    pub fn alloc(&mut self, size: usize) -> Pointer<u8> {
        if size == 0 {
            return None;
        }

        let mut zone = Some(self.zone_for(size));

        while let Some(current) = zone {
            match unsafe { self.alloc_in(current, size) } {
                Ok(address) => return Some(address),
                Err(Error::Exhausted) => {
                    trace!(zone = %current, size, "zone exhausted, escalating");
                    zone = current.next();
                }
                Err(error) => {
                    trace!(zone = %current, size, %error, "alloc failed");
                    return None;
                }
            }
        }

        None
    }

    /// Deallocates the memory block at `address`.
    ///
    /// Errors:
    /// - [`Error::InvalidPointer`] for null, or for an address that points
    ///   inside a zone but not at the start of an allocation.
    /// - [`Error::NotFound`] if no zone is tracking `address`, which includes
    ///   double frees.
    ///
    /// Failed calls never change the allocator state.
    ///
    /// # Safety
    ///
    /// The caller must not use `address` after a successful call.
    pub unsafe fn free(&mut self, address: Pointer<u8>) -> Result<()> {
        let address = address.ok_or(Error::InvalidPointer)?;

        for zone in Zone::ALL {
            match self.free_in(zone, address) {
                Err(Error::PointerOutOfRange) => continue,
                result => return result,
            }
        }

        Err(Error::NotFound)
    }

    /// Reallocation algorithm. The zone that owns `address` gets the first
    /// chance to resize it, either in place or by moving it inside the zone.
    /// If the zone can't hold the new size, the contents are moved to
    /// whichever zone can: a replacement is allocated first, the smaller of
    /// both sizes is copied and then the old allocation is freed.
    ///
    /// - `None` address behaves like [`Self::alloc`].
    /// - Zero size frees `address` and returns `None`.
    /// - An address that no zone tracks gets a fresh allocation.
    /// - If no replacement can be allocated the result is `None` and
    ///   `address` is still valid and untouched.
    ///
    /// # Safety
    ///
    /// If the result is not `None`, `address` must not be used anymore.
    pub unsafe fn realloc(&mut self, address: Pointer<u8>, size: usize) -> Pointer<u8> {
        let Some(address) = address else {
            return self.alloc(size);
        };

        for zone in Zone::ALL {
            match self.realloc_in(zone, address, size) {
                Ok(new_address) => return new_address,
                Err(Error::PointerOutOfRange) => continue,
                Err(Error::Exhausted | Error::SizeRejected { .. }) => {
                    let old_size = self.size_in(zone, address);
                    return self.relocate(&Realloc::new(address, zone, old_size, size));
                }
                Err(error @ Error::MappingFailure { .. }) => {
                    trace!(?address, size, %error, "realloc failed");
                    return None;
                }
                Err(error) => {
                    trace!(?address, zone = %zone, %error, "realloc of untracked pointer");
                    break;
                }
            }
        }

        self.alloc(size)
    }

    /// Moves an allocation to another zone. See [`Self::realloc`].
    unsafe fn relocate(&mut self, realloc: &Realloc) -> Pointer<u8> {
        let new_address = self.alloc(realloc.new_size)?;

        ptr::copy_nonoverlapping(
            realloc.address.as_ptr(),
            new_address.as_ptr(),
            realloc.count(),
        );

        if let Err(error) = self.free_in(realloc.zone, realloc.address) {
            warn!(address = ?realloc.address, %error, "old allocation not freed after relocation");
        }

        trace!(
            address = ?realloc.address,
            ?new_address,
            from = %realloc.zone,
            size = realloc.new_size,
            "relocated"
        );

        Some(new_address)
    }

    /// Exact size requested for `address`, 0 if it's not a live allocation.
    pub fn size_of(&self, address: Pointer<u8>) -> usize {
        let Some(address) = address else {
            return 0;
        };

        Zone::ALL
            .into_iter()
            .map(|zone| self.size_in(zone, address))
            .find(|size| *size != 0)
            .unwrap_or(0)
    }

    /// Zone currently tracking `address`, if any.
    pub fn zone_of(&self, address: Pointer<u8>) -> Option<Zone> {
        let address = address?;

        Zone::ALL
            .into_iter()
            .find(|zone| self.size_in(*zone, address) != 0)
    }

    /// Calls `f` once per live allocation, zone by zone, in address order
    /// within each region.
    pub fn for_each_live(&self, mut f: impl FnMut(LiveAllocation)) {
        let mut visit = |zone, address, size| f(LiveAllocation { zone, address, size });

        self.tiny
            .for_each_live(|address, size| visit(Zone::Tiny, address, size));
        self.small
            .for_each_live(|address, size| visit(Zone::Small, address, size));
        self.big
            .for_each_live(|address, size| visit(Zone::Big, address, size));
    }

    /// Writes every mapped region and its live allocations to `out`:
    ///
    /// ```text
    /// TINY : 0x00007F3A5C000000
    /// 0x00007F3A5C000070 - 0x00007F3A5C00007A : 10 bytes
    /// BIG : 0x00007F3A5BFEC000
    /// 0x00007F3A5BFEC040 - 0x00007F3A5BFED3C8 : 5000 bytes
    /// Total : 5010 bytes
    /// ```
    pub fn report(&self, out: &mut impl fmt::Write) -> fmt::Result {
        let mut total = 0;

        if let Some(base) = self.tiny.base() {
            total += write_region(out, Zone::Tiny, base, |f| self.tiny.for_each_live(f))?;
        }

        if let Some(base) = self.small.base() {
            total += write_region(out, Zone::Small, base, |f| self.small.for_each_live(f))?;
        }

        for region in self.big.regions().iter() {
            total += write_region(out, Zone::Big, region.cast(), |f| {
                self.big.for_each_live_in(region, f)
            })?;
        }

        writeln!(out, "Total : {total} bytes")
    }

    pub fn stats(&self) -> Stats {
        Stats {
            tiny_live: self.tiny.live(),
            small_live: self.small.live(),
            big_live: self.big.live(),
            big_regions: self.big.regions().len(),
        }
    }

    /// Unmaps every region of every zone, live allocations included. All
    /// addresses handed out so far become invalid.
    pub fn release_all(&mut self) {
        self.tiny.release();
        self.small.release();
        self.big.release();
    }
}

impl Default for ZoneAllocator {
    fn default() -> Self {
        Self::with_default_config()
    }
}

/// Writes one report section and returns the bytes it accounts for.
fn write_region(
    out: &mut impl fmt::Write,
    zone: Zone,
    base: NonNull<u8>,
    visit: impl FnOnce(&mut dyn FnMut(NonNull<u8>, usize)),
) -> std::result::Result<usize, fmt::Error> {
    writeln!(out, "{zone} : 0x{:016X}", base.as_ptr() as usize)?;

    let mut total = 0;
    let mut result = Ok(());

    visit(&mut |address, size| {
        if result.is_ok() {
            result = writeln!(out, "{}", LiveAllocation { zone, address, size });
            total += size;
        }
    });

    result.map(|()| total)
}

/// This struct exposes the public interface by implementing
/// [`GlobalAlloc`].
///
/// # Examples
///
/// ## Standalone allocator
///
/// ```rust
/// use zonealloc::SyncZoneAllocator;
///
/// let allocator = SyncZoneAllocator::default();
///
/// unsafe {
///     let address = allocator.alloc(128).unwrap();
///     address.as_ptr().write_bytes(1, 128);
///     assert_eq!(allocator.size_of(Some(address)), 128);
///     allocator.free(Some(address)).unwrap();
/// }
/// ```
///
/// ## Global allocator
///
/// ```no_run
/// use zonealloc::SyncZoneAllocator;
///
/// #[global_allocator]
/// static ALLOCATOR: SyncZoneAllocator = SyncZoneAllocator::with_default_config();
///
/// fn main() {
///     let num = Box::new(5);
///     assert_eq!(*num, 5);
/// }
/// ```
pub struct SyncZoneAllocator {
    /// One global lock around the whole allocator. Zones never share regions,
    /// so one lock per zone would work too, but relocations touch two zones
    /// at once and would have to take both locks in a fixed order.
    allocator: Mutex<ZoneAllocator>,
}

impl SyncZoneAllocator {
    pub const fn with_default_config() -> Self {
        Self::with_config(Config::DEFAULT)
    }

    pub const fn with_config(config: Config) -> Self {
        Self {
            allocator: Mutex::new(ZoneAllocator::with_config(config)),
        }
    }

    pub fn try_with_config(config: Config) -> Result<Self> {
        Ok(Self {
            allocator: Mutex::new(ZoneAllocator::try_with_config(config)?),
        })
    }

    /// Nothing in the zones panics halfway through a mutation, so a poisoned
    /// lock still guards consistent state.
    fn lock(&self) -> MutexGuard<'_, ZoneAllocator> {
        self.allocator.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// See [`ZoneAllocator::alloc`].
    pub fn alloc(&self, size: usize) -> Pointer<u8> {
        self.lock().alloc(size)
    }

    /// See [`ZoneAllocator::free`].
    ///
    /// # Safety
    ///
    /// Same as [`ZoneAllocator::free`].
    pub unsafe fn free(&self, address: Pointer<u8>) -> Result<()> {
        self.lock().free(address)
    }

    /// See [`ZoneAllocator::realloc`].
    ///
    /// # Safety
    ///
    /// Same as [`ZoneAllocator::realloc`].
    pub unsafe fn realloc(&self, address: Pointer<u8>, size: usize) -> Pointer<u8> {
        self.lock().realloc(address, size)
    }

    pub fn size_of(&self, address: Pointer<u8>) -> usize {
        self.lock().size_of(address)
    }

    pub fn zone_of(&self, address: Pointer<u8>) -> Option<Zone> {
        self.lock().zone_of(address)
    }

    pub fn stats(&self) -> Stats {
        self.lock().stats()
    }

    /// See [`ZoneAllocator::report`]. The lock is held while writing, so `out`
    /// must not allocate through this same allocator.
    pub fn report(&self, out: &mut impl fmt::Write) -> fmt::Result {
        self.lock().report(out)
    }

    /// See [`ZoneAllocator::release_all`].
    ///
    /// # Safety
    ///
    /// Nothing allocated so far may be used after this call.
    pub unsafe fn release_all(&self) {
        self.lock().release_all()
    }
}

impl Default for SyncZoneAllocator {
    fn default() -> Self {
        Self::with_default_config()
    }
}

unsafe impl GlobalAlloc for SyncZoneAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // Every address we hand out is aligned to ALIGNMENT and nothing more.
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        match self.lock().alloc(layout.size()) {
            Some(address) => address.as_ptr(),
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, address: *mut u8, _layout: Layout) {
        if let Err(error) = self.lock().free(NonNull::new(address)) {
            warn!(?address, %error, "dealloc failed");
        }
    }

    unsafe fn realloc(&self, address: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        match self.lock().realloc(NonNull::new(address), new_size) {
            Some(address) => address.as_ptr(),
            None => ptr::null_mut(),
        }
    }
}
