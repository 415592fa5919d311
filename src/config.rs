use std::mem;

use crate::{
    align::ALIGNMENT,
    block::{capacity_for, BLOCK_HEADER_SIZE},
    error::{Error, Result},
    platform::page_size,
};

/// Size class boundaries and zone dimensions. Everything is `const` so that a
/// configured allocator can live in a `static` and be used as the global
/// allocator.
///
/// ```rust
/// use zonealloc::Config;
///
/// let config = Config::DEFAULT.with_tiny_slot_size(32).with_small_max_size(1024);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// Fixed slot size of the tiny zone. Requests of `size <= tiny_slot_size`
    /// are tiny.
    pub tiny_slot_size: usize,
    /// Number of slots in the tiny pool.
    pub tiny_slot_count: usize,
    /// Largest request served by the small zone.
    pub small_max_size: usize,
    /// The small region is sized to hold this many maximum size blocks.
    pub small_block_count: usize,
    /// Big requests whose block and region headers don't fit in this many
    /// pages are given a region of their own.
    pub big_dedicated_pages: usize,
    /// Length in pages of a shared big region.
    pub big_region_pages: usize,
}

impl Config {
    pub const DEFAULT: Self = Self {
        tiny_slot_size: 64,
        tiny_slot_count: 100,
        small_max_size: 4066,
        small_block_count: 100,
        big_dedicated_pages: 10,
        big_region_pages: 20,
    };

    pub const fn with_tiny_slot_size(mut self, size: usize) -> Self {
        self.tiny_slot_size = size;
        self
    }

    pub const fn with_tiny_slot_count(mut self, count: usize) -> Self {
        self.tiny_slot_count = count;
        self
    }

    pub const fn with_small_max_size(mut self, size: usize) -> Self {
        self.small_max_size = size;
        self
    }

    pub const fn with_small_block_count(mut self, count: usize) -> Self {
        self.small_block_count = count;
        self
    }

    pub const fn with_big_dedicated_pages(mut self, pages: usize) -> Self {
        self.big_dedicated_pages = pages;
        self
    }

    pub const fn with_big_region_pages(mut self, pages: usize) -> Self {
        self.big_region_pages = pages;
        self
    }

    /// Checks that the zones can actually be built with these numbers.
    pub fn validate(&self) -> Result<()> {
        if self.tiny_slot_size == 0
            || self.tiny_slot_count == 0
            || self.small_block_count == 0
            || self.big_dedicated_pages == 0
            || self.big_region_pages == 0
        {
            return Err(Error::InvalidConfig("zone dimensions must be positive"));
        }

        if self.tiny_slot_size % ALIGNMENT != 0 {
            return Err(Error::InvalidConfig(
                "tiny slot size must be a multiple of the alignment unit",
            ));
        }

        // Slot table entries are 16 bit.
        if self.tiny_slot_size > u16::MAX as usize {
            return Err(Error::InvalidConfig("tiny slot size too large"));
        }

        if self.small_max_size <= self.tiny_slot_size {
            return Err(Error::InvalidConfig(
                "small max size must be larger than tiny slot size",
            ));
        }

        let tiny_length = self
            .tiny_slot_count
            .checked_mul(mem::size_of::<u16>())
            .and_then(capacity_for)
            .zip(self.tiny_slot_count.checked_mul(self.tiny_slot_size))
            .and_then(|(table, storage)| table.checked_add(storage));

        if !fits_in_region(tiny_length) {
            return Err(Error::InvalidConfig("tiny region too large"));
        }

        let small_length = capacity_for(self.small_max_size)
            .and_then(|capacity| capacity.checked_add(BLOCK_HEADER_SIZE))
            .and_then(|block| block.checked_mul(self.small_block_count));

        if !fits_in_region(small_length) {
            return Err(Error::InvalidConfig("small region too large"));
        }

        let big_lengths = [self.big_dedicated_pages, self.big_region_pages]
            .map(|pages| pages.checked_mul(page_size()));

        if !big_lengths.into_iter().all(fits_in_region) {
            return Err(Error::InvalidConfig("big region too large"));
        }

        Ok(())
    }
}

/// Region lengths have to survive the round up to whole pages.
fn fits_in_region(length: Option<usize>) -> bool {
    length.is_some_and(|length| length <= isize::MAX as usize - page_size())
}

impl Default for Config {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(Config::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_broken_configs() {
        let broken = [
            Config::DEFAULT.with_tiny_slot_count(0),
            Config::DEFAULT.with_big_region_pages(0),
            Config::DEFAULT.with_tiny_slot_size(24),
            Config::DEFAULT.with_tiny_slot_size(1 << 20),
            Config::DEFAULT.with_small_max_size(64),
            Config::DEFAULT.with_tiny_slot_count(usize::MAX / 8),
            Config::DEFAULT.with_tiny_slot_count(usize::MAX / 2),
            Config::DEFAULT.with_small_block_count(usize::MAX / 2),
            Config::DEFAULT.with_small_max_size(usize::MAX - 4),
            Config::DEFAULT.with_big_dedicated_pages(usize::MAX / 2),
            Config::DEFAULT.with_big_region_pages(usize::MAX / 2),
        ];

        for config in broken {
            assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
        }
    }
}
