use std::ptr::NonNull;

use zonealloc::ZoneAllocator;

fn print_alloc(allocator: &ZoneAllocator, address: Option<NonNull<u8>>, size: usize) {
    println!("Requested {size} bytes of memory");
    match allocator.zone_of(address) {
        Some(zone) => println!("Received this address: {address:?} from {zone}"),
        None => println!("Allocation failed"),
    }
}

fn main() {
    let mut allocator = ZoneAllocator::default();

    let sizes = [1, 1024, 40_000];
    let addresses = sizes.map(|size| {
        let address = allocator.alloc(size);
        print_alloc(&allocator, address, size);
        address
    });

    let mut report = String::new();
    allocator.report(&mut report).unwrap();
    println!("\n{report}");

    println!("Now let's try some reallocs");
    unsafe {
        let mut address = addresses[0];
        address.unwrap().as_ptr().write(42);

        for size in [64, 65, 4066, 4067] {
            address = allocator.realloc(address, size);
            println!(
                "{size} bytes at {address:?} in {:?}, first byte still {}",
                allocator.zone_of(address),
                *address.unwrap().as_ptr()
            );
        }

        println!("Deallocating everything...");
        allocator.free(address).unwrap();
        for address in &addresses[1..] {
            allocator.free(*address).unwrap();
        }

        println!("Double free: {:?}", allocator.free(address));
    }

    println!("Stats: {:?}", allocator.stats());
}
