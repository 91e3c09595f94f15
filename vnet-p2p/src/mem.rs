//! Guest memory region table of one port
//!
//! A client announces how many memory regions (`num_ds`) it will share when
//! the port is created and then registers them one by one. Every guest
//! address the forwarding engine touches is translated through this table;
//! a range that is not wholly inside a single registered region is a
//! `BadDescriptor`, never an out-of-bounds access.

use std::sync::Arc;

use tracing::debug;
use vm_memory::{
    Address, GuestAddress, GuestMemory, GuestMemoryMmap, GuestMemoryRegion, GuestRegionMmap,
};

use crate::error::{BadDescriptor, PortError};

/// Region table of one port.
pub struct DriverMem {
    /// Maximum number of regions the client announced
    max_regions: usize,
    /// Regions in registration order
    regions: Vec<Arc<GuestRegionMmap>>,
    /// Lookup structure rebuilt whenever `regions` changes
    mem: GuestMemoryMmap,
}

impl DriverMem {
    /// Create an empty table accepting up to `max_regions` regions.
    pub fn new(max_regions: usize) -> Self {
        Self {
            max_regions,
            regions: Vec::new(),
            mem: GuestMemoryMmap::new(),
        }
    }

    /// Number of regions the client may register.
    pub fn max_regions(&self) -> usize {
        self.max_regions
    }

    /// Number of regions registered so far.
    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }

    /// Register one shared region.
    pub fn add_region(&mut self, region: Arc<GuestRegionMmap>) -> Result<(), PortError> {
        if self.regions.len() >= self.max_regions {
            return Err(PortError::TooManyRegions);
        }

        let mut regions = self.regions.clone();
        regions.push(region);
        regions.sort_by_key(|r| r.start_addr());

        let mem = GuestMemoryMmap::from_arc_regions(regions.clone())
            .map_err(|e| PortError::Memory(e.to_string()))?;

        debug!(
            regions = regions.len(),
            max_regions = self.max_regions,
            "registered guest memory region"
        );

        self.regions = regions;
        self.mem = mem;
        Ok(())
    }

    /// Drop all regions and set a new limit.
    pub fn reset(&mut self, max_regions: usize) {
        self.max_regions = max_regions;
        self.regions.clear();
        self.mem = GuestMemoryMmap::new();
    }

    /// The lookup structure for accessor calls.
    pub fn memory(&self) -> &GuestMemoryMmap {
        &self.mem
    }

    /// Check that `[addr, addr + len)` lies within one registered region.
    pub fn check(&self, addr: GuestAddress, len: u32) -> Result<(), BadDescriptor> {
        check_range(&self.mem, addr, len)
    }
}

/// Check that `[addr, addr + len)` lies within one region of `mem`.
pub fn check_range(mem: &GuestMemoryMmap, addr: GuestAddress, len: u32) -> Result<(), BadDescriptor> {
    let bad = BadDescriptor::BadAddress {
        addr: addr.raw_value(),
        len,
    };

    if len == 0 {
        return mem.find_region(addr).map(|_| ()).ok_or(bad);
    }

    addr.checked_add(len as u64 - 1).ok_or(bad)?;
    mem.get_slice(addr, len as usize).map(|_| ()).map_err(|_| bad)
}
