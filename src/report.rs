use std::{fmt, ptr::NonNull};

/// Size class of an allocation, which is also the zone that serves it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Zone {
    Tiny,
    Small,
    Big,
}

impl Zone {
    /// All zones in dispatch order.
    pub const ALL: [Zone; 3] = [Zone::Tiny, Zone::Small, Zone::Big];

    /// Next larger class, used when a zone is exhausted.
    pub fn next(self) -> Option<Zone> {
        match self {
            Zone::Tiny => Some(Zone::Small),
            Zone::Small => Some(Zone::Big),
            Zone::Big => None,
        }
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Zone::Tiny => "TINY",
            Zone::Small => "SMALL",
            Zone::Big => "BIG",
        })
    }
}

/// One live allocation as seen by [`crate::ZoneAllocator::for_each_live`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LiveAllocation {
    pub zone: Zone,
    pub address: NonNull<u8>,
    /// Exact size requested by the caller.
    pub size: usize,
}

impl LiveAllocation {
    /// One past the last byte the caller asked for.
    pub fn end(&self) -> usize {
        self.address.as_ptr() as usize + self.size
    }
}

/// Formats as `0x<start> - 0x<end> : <size> bytes`.
impl fmt::Display for LiveAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:016X} - 0x{:016X} : {} bytes",
            self.address.as_ptr() as usize,
            self.end(),
            self.size
        )
    }
}

/// Snapshot of how many allocations each zone is holding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub tiny_live: usize,
    pub small_live: usize,
    pub big_live: usize,
    /// Number of regions currently mapped by the big zone.
    pub big_regions: usize,
}

impl Stats {
    pub fn total_live(&self) -> usize {
        self.tiny_live + self.small_live + self.big_live
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        let allocation = LiveAllocation {
            zone: Zone::Small,
            address: NonNull::new(0x1000 as *mut u8).unwrap(),
            size: 100,
        };

        assert_eq!(
            allocation.to_string(),
            "0x0000000000001000 - 0x0000000000001064 : 100 bytes"
        );
        assert_eq!(Zone::Big.to_string(), "BIG");
        assert_eq!(Zone::Tiny.next(), Some(Zone::Small));
        assert_eq!(Zone::Big.next(), None);
    }
}
