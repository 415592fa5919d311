use std::ptr::NonNull;

use rand::{rngs::StdRng, Rng, SeedableRng};
use zonealloc::{Config, Error, Stats, Zone, ZoneAllocator, ALIGNMENT};

const S: usize = Config::DEFAULT.tiny_slot_size;
const M: usize = Config::DEFAULT.small_max_size;

fn address(pointer: Option<NonNull<u8>>) -> usize {
    pointer.unwrap().as_ptr() as usize
}

#[test]
fn every_tiny_size_is_tracked_exactly() {
    let mut allocator = ZoneAllocator::default();

    let pointers: Vec<_> = (1..=S).map(|size| allocator.alloc(size)).collect();

    for (size, pointer) in (1..=S).zip(&pointers) {
        assert_eq!(allocator.zone_of(*pointer), Some(Zone::Tiny));
        assert_eq!(allocator.size_of(*pointer), size);
        assert_eq!(address(*pointer) % ALIGNMENT, 0);
    }

    // Slots are S bytes apart, so the pool spans exactly that many slots.
    let lowest = pointers.iter().map(|p| address(*p)).min().unwrap();
    let highest = pointers.iter().map(|p| address(*p)).max().unwrap();
    assert_eq!(highest - lowest, (S - 1) * S);
}

#[test]
fn size_class_boundaries() {
    let mut allocator = ZoneAllocator::default();

    let cases = [
        (S, Zone::Tiny),
        (S + 1, Zone::Small),
        (M, Zone::Small),
        (M + 1, Zone::Big),
    ];

    for (size, zone) in cases {
        let pointer = allocator.alloc(size);
        assert_eq!(allocator.zone_of(pointer), Some(zone), "size {size}");
        assert_eq!(allocator.size_of(pointer), size);
    }

    assert_eq!(allocator.alloc(0), None);
}

#[test]
fn freed_pointers_are_no_longer_tracked() {
    let mut allocator = ZoneAllocator::default();

    for size in [1, S, S + 1, M, M + 1, 1 << 20] {
        let keep = allocator.alloc(size);
        let pointer = allocator.alloc(size);

        unsafe { allocator.free(pointer).unwrap() };

        assert_eq!(allocator.size_of(pointer), 0);
        assert_eq!(allocator.zone_of(pointer), None);
        assert_eq!(allocator.size_of(keep), size);
    }
}

#[test]
fn free_null_changes_nothing() {
    let mut allocator = ZoneAllocator::default();
    let pointer = allocator.alloc(100);
    let before = allocator.stats();

    unsafe {
        assert_eq!(allocator.free(None), Err(Error::InvalidPointer));
    }

    assert_eq!(allocator.stats(), before);
    assert_eq!(allocator.size_of(pointer), 100);
}

#[test]
fn double_free_is_reported() {
    let mut allocator = ZoneAllocator::default();

    for size in [10, 1000, 10_000] {
        let keep = allocator.alloc(size);
        let pointer = allocator.alloc(size);

        unsafe {
            allocator.free(pointer).unwrap();
            let stats = allocator.stats();

            let second = allocator.free(pointer);
            assert!(
                matches!(second, Err(Error::NotFound | Error::InvalidPointer)),
                "size {size}: {second:?}"
            );
            assert_eq!(allocator.stats(), stats);
        }

        assert_eq!(allocator.size_of(keep), size);
    }
}

#[test]
fn fragmentation_reuse() {
    let mut allocator = ZoneAllocator::default();

    let pointers: Vec<_> = (0..10).map(|_| allocator.alloc(64)).collect();

    for index in (0..10).step_by(2) {
        unsafe { allocator.free(pointers[index]).unwrap() };
    }

    let reused = allocator.alloc(64);
    assert!((0..10).step_by(2).any(|index| pointers[index] == reused));
}

#[test]
fn teardown_and_rebirth() {
    let mut allocator = ZoneAllocator::default();

    for size in [500, 50_000] {
        let pointers: Vec<_> = (0..5).map(|_| allocator.alloc(size)).collect();

        for pointer in &pointers {
            unsafe { allocator.free(*pointer).unwrap() };
        }

        assert_eq!(allocator.stats(), Stats::default());
        for pointer in &pointers {
            assert_eq!(allocator.size_of(*pointer), 0);
        }

        let again = allocator.alloc(size);
        assert_eq!(allocator.size_of(again), size);
        unsafe { allocator.free(again).unwrap() };
    }
}

#[test]
fn neighbours_coalesce_in_either_order() {
    for reverse in [false, true] {
        let mut allocator = ZoneAllocator::default();

        let a = allocator.alloc(100);
        let b = allocator.alloc(100);
        // Keeps the small region mapped.
        let guard = allocator.alloc(100);
        // 100 bytes take 112 of capacity, the rest is B's header.
        let header = address(b) - address(a) - 112;

        let (first, second) = if reverse { (b, a) } else { (a, b) };
        unsafe {
            allocator.free(first).unwrap();
            allocator.free(second).unwrap();
        }

        // Both capacities plus the header that used to sit between them.
        let merged = allocator.alloc(112 + header + 112);
        assert_eq!(merged, a);
        assert_eq!(allocator.size_of(guard), 100);
    }
}

#[test]
fn realloc_moves_contents_across_zones() {
    let mut allocator = ZoneAllocator::default();

    unsafe {
        let mut pointer = allocator.alloc(20);
        for i in 0..20 {
            *pointer.unwrap().as_ptr().add(i) = i as u8;
        }

        for (size, zone) in [(S, Zone::Tiny), (1000, Zone::Small), (100_000, Zone::Big)] {
            pointer = allocator.realloc(pointer, size);
            assert_eq!(allocator.zone_of(pointer), Some(zone));
            assert_eq!(allocator.size_of(pointer), size);

            for i in 0..20 {
                assert_eq!(*pointer.unwrap().as_ptr().add(i), i as u8);
            }
        }

        assert_eq!(allocator.stats().total_live(), 1);
        assert_eq!(allocator.realloc(pointer, 0), None);
        assert_eq!(allocator.stats(), Stats::default());
    }
}

#[test]
fn realloc_failure_keeps_the_old_allocation() {
    let mut allocator = ZoneAllocator::default();

    unsafe {
        let pointer = allocator.alloc(5000);
        pointer.unwrap().as_ptr().write_bytes(3, 5000);

        assert_eq!(allocator.realloc(pointer, usize::MAX - 4), None);
        assert_eq!(allocator.size_of(pointer), 5000);
        assert_eq!(*pointer.unwrap().as_ptr().add(4999), 3);
    }
}

// Representable as a region length, but no kernel will map it.
const UNMAPPABLE: usize = isize::MAX as usize / 2;

#[test]
#[cfg_attr(miri, ignore)]
fn mapping_failure_leaves_nothing_mapped() {
    let mut allocator = ZoneAllocator::default();

    assert_eq!(allocator.alloc(UNMAPPABLE), None);
    assert_eq!(allocator.stats(), Stats::default());

    let pointer = allocator.alloc(100);
    assert_eq!(allocator.alloc(UNMAPPABLE), None);
    assert_eq!(allocator.stats().small_live, 1);
    assert_eq!(allocator.stats().big_regions, 0);
    assert_eq!(allocator.size_of(pointer), 100);
}

#[test]
#[cfg_attr(miri, ignore)]
fn realloc_mapping_failure_keeps_the_old_allocation() {
    let mut allocator = ZoneAllocator::default();

    for size in [10, 1000, 5000] {
        unsafe {
            let pointer = allocator.alloc(size);
            pointer.unwrap().as_ptr().write_bytes(7, size);
            let stats = allocator.stats();

            assert_eq!(allocator.realloc(pointer, UNMAPPABLE), None);

            assert_eq!(allocator.stats(), stats, "size {size}");
            assert_eq!(allocator.size_of(pointer), size);
            for i in 0..size {
                assert_eq!(*pointer.unwrap().as_ptr().add(i), 7);
            }

            allocator.free(pointer).unwrap();
        }
    }

    assert_eq!(allocator.stats(), Stats::default());
}

/// Random alloc, free and realloc calls over every size class. Every live
/// allocation is filled with a byte derived from its id and checked before it
/// goes away, so any overlap or lost copy shows up as a mismatch.
#[test]
fn random_workload() {
    let mut allocator = ZoneAllocator::default();
    let mut rng = StdRng::seed_from_u64(0x5EED);

    struct Live {
        pointer: Option<NonNull<u8>>,
        size: usize,
        fill: u8,
    }

    fn check(allocator: &ZoneAllocator, live: &Live) {
        assert_eq!(allocator.size_of(live.pointer), live.size);
        for i in 0..live.size {
            let byte = unsafe { *live.pointer.unwrap().as_ptr().add(i) };
            assert_eq!(byte, live.fill);
        }
    }

    let mut live: Vec<Live> = Vec::new();
    let operations = if cfg!(miri) { 200 } else { 5000 };

    for id in 0..operations {
        let size = match rng.gen_range(0..10) {
            0..=4 => rng.gen_range(1..=S),
            5..=7 => rng.gen_range(S + 1..=M),
            _ => rng.gen_range(M + 1..=M * 40),
        };
        let fill = id as u8;

        match rng.gen_range(0..3) {
            0 if !live.is_empty() => {
                let victim = live.swap_remove(rng.gen_range(0..live.len()));
                check(&allocator, &victim);
                unsafe { allocator.free(victim.pointer).unwrap() };
            }
            1 if !live.is_empty() => {
                let index = rng.gen_range(0..live.len());
                check(&allocator, &live[index]);

                let entry = &mut live[index];
                let pointer = unsafe { allocator.realloc(entry.pointer, size) };
                assert!(pointer.is_some());

                let kept = entry.size.min(size);
                for i in 0..kept {
                    assert_eq!(unsafe { *pointer.unwrap().as_ptr().add(i) }, entry.fill);
                }
                unsafe { pointer.unwrap().as_ptr().write_bytes(fill, size) };

                *entry = Live { pointer, size, fill };
            }
            _ => {
                let pointer = allocator.alloc(size);
                assert_eq!(address(pointer) % ALIGNMENT, 0);
                unsafe { pointer.unwrap().as_ptr().write_bytes(fill, size) };
                live.push(Live { pointer, size, fill });
            }
        }
    }

    assert_eq!(allocator.stats().total_live(), live.len());

    for entry in live.drain(..) {
        check(&allocator, &entry);
        unsafe { allocator.free(entry.pointer).unwrap() };
    }

    // Every region went back to the kernel.
    assert_eq!(allocator.stats(), Stats::default());
    let mut report = String::new();
    allocator.report(&mut report).unwrap();
    assert_eq!(report, "Total : 0 bytes\n");
}

#[test]
fn invalid_config_is_rejected() {
    let config = Config::DEFAULT.with_small_max_size(S);
    assert!(matches!(
        ZoneAllocator::try_with_config(config),
        Err(Error::InvalidConfig(_))
    ));

    let config = Config::DEFAULT.with_tiny_slot_size(32).with_small_max_size(2048);
    let mut allocator = ZoneAllocator::try_with_config(config).unwrap();
    let small = allocator.alloc(33);
    let big = allocator.alloc(2049);
    assert_eq!(allocator.zone_of(small), Some(Zone::Small));
    assert_eq!(allocator.zone_of(big), Some(Zone::Big));
}
