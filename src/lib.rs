//! Zone allocator built directly on top of the kernel's virtual memory
//! primitives. Requests are split in three size classes and each class has
//! its own engine:
//!
//! - **tiny** (`size <= S`): a pool of fixed size slots, the `tiny` module.
//! - **small** (`S < size <= M`): a first fit free list confined to one single
//!   region, the `small` module.
//! - **big** (`size > M`): first fit free lists over any number of regions,
//!   the `arena` module.
//!
//! [`ZoneAllocator`] routes requests between them and [`SyncZoneAllocator`]
//! wraps it in a lock so that it can be used as the global allocator:
//!
//! ```no_run
//! use zonealloc::SyncZoneAllocator;
//!
//! #[global_allocator]
//! static ALLOCATOR: SyncZoneAllocator = SyncZoneAllocator::with_default_config();
//!
//! fn main() {
//!     let v = vec![1u8, 2, 3];
//!     assert_eq!(v.len(), 3);
//! }
//! ```
//!
//! Every region is mapped on demand and unmapped as soon as nothing lives in
//! it anymore. Logging goes through [`tracing`] under the `zonealloc` target;
//! if this crate is the global allocator and the subscriber allocates, filter
//! that target out or the subscriber will re-enter the allocator.

mod align;
mod allocator;
mod arena;
mod block;
mod config;
mod error;
mod header;
mod list;
mod platform;
mod realloc;
mod region;
mod report;
mod small;
mod tiny;

use std::ptr::NonNull;

/// Non-null pointer to `T`. We use this in most cases instead of `*mut T`
/// because the compiler will yell at us if we don't write code for the `None`
/// case.
pub type Pointer<T> = Option<NonNull<T>>;

pub use align::{align_up, ALIGNMENT};
pub use allocator::{SyncZoneAllocator, ZoneAllocator};
pub use config::Config;
pub use error::{Error, Result};
pub use report::{LiveAllocation, Stats, Zone};
