use crate::platform::page_size;

/// Alignment unit of every zone. Slots, block headers, block capacities and
/// therefore all pointers handed out are multiples of this value.
pub const ALIGNMENT: usize = 16;

/// Rounds `value` up to the next multiple of `unit`, which must be a power of
/// two.
///
/// # Examples
///
/// ```rust
/// use zonealloc::align_up;
///
/// assert_eq!(align_up(13, 16), 16);
/// assert_eq!(align_up(32, 16), 32);
/// assert_eq!(align_up(4097, 4096), 8192);
/// ```
#[inline]
pub const fn align_up(value: usize, unit: usize) -> usize {
    (value + unit - 1) & !(unit - 1)
}

/// Rounds `value` up to the zone alignment unit.
#[inline]
pub(crate) const fn align(value: usize) -> usize {
    align_up(value, ALIGNMENT)
}

/// Rounds `length` up to a whole number of pages, which is what we have to
/// request from the kernel anyway.
#[inline]
pub(crate) fn page_round(length: usize) -> usize {
    align_up(length, page_size())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align() {
        let mut alignments = Vec::new();

        for i in 0..10 {
            // (1..16), (17..32), (33..48) and so on.
            let sizes = (ALIGNMENT * i + 1)..=(ALIGNMENT * (i + 1));
            // Matching the sizes above, this would be: 16, 32, 48 and so on.
            let expected_alignment = ALIGNMENT * (i + 1);
            alignments.push((sizes, expected_alignment));
        }

        for (sizes, expected) in alignments {
            for size in sizes {
                assert_eq!(expected, align(size));
            }
        }

        assert_eq!(align(0), 0);
    }

    #[test]
    fn test_page_round() {
        let page = page_size();
        assert_eq!(page_round(1), page);
        assert_eq!(page_round(page), page);
        assert_eq!(page_round(page + 1), 2 * page);
    }
}
