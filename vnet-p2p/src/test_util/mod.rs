//! Test utilities for guest simulation
//!
//! A simulated guest owns an anonymous memory region, runs the driver side
//! of both virtqueues and talks to a `SockPair` the way a client would.

pub mod guest;
pub mod packets;
pub mod virtqueue;

use std::sync::Arc;

use vm_memory::{GuestAddress, GuestMemoryMmap, GuestRegionMmap, MmapRegion};

pub use guest::{GuestPort, RxPacket};
pub use virtqueue::{UsedBuffer, VirtqueueDriver};

/// An anonymous guest memory region at `base`.
pub fn guest_region(base: u64, size: usize) -> Arc<GuestRegionMmap> {
    let mmap = MmapRegion::new(size).expect("mmap region");
    Arc::new(GuestRegionMmap::new(mmap, GuestAddress(base)).expect("guest region"))
}

/// Single-region guest memory starting at address 0.
pub fn create_test_memory(size: usize) -> GuestMemoryMmap {
    GuestMemoryMmap::from_arc_regions(vec![guest_region(0, size)]).expect("guest memory")
}
