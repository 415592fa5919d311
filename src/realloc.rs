use std::ptr::NonNull;

use crate::report::Zone;

/// This is used to carry relocation metadata around when a block has to move
/// from one zone to another. For the in-zone business, see [`crate::small`]
/// and [`crate::arena`].
#[derive(Clone, Copy, Debug)]
pub(crate) struct Realloc {
    /// Current user pointer.
    pub address: NonNull<u8>,
    /// Zone that owns `address`.
    pub zone: Zone,
    /// Used length of the current block.
    pub old_size: usize,
    /// Size the caller wants now.
    pub new_size: usize,
}

impl Realloc {
    pub fn new(address: NonNull<u8>, zone: Zone, old_size: usize, new_size: usize) -> Self {
        Self {
            address,
            zone,
            old_size,
            new_size,
        }
    }

    /// Number of bytes that should be copied from the previous allocation. If
    /// we are shrinking, we only need to copy enough bytes to fill the new
    /// size, otherwise we'll copy everything the caller had.
    pub fn count(&self) -> usize {
        self.old_size.min(self.new_size)
    }
}
