//! Device side of a virtio 1.0 split virtqueue
//!
//! This is the part of the virtqueue protocol the switch needs: pulling
//! available descriptor chains, walking them under validation, and returning
//! them through the used ring. Used elements can be written ahead of the used
//! index (`consumed_x`) and published in one burst (`finish_x`), so a packet
//! spread over several merged receive buffers produces a single guest
//! notification.

use std::sync::atomic::{Ordering, fence};

use tracing::{error, trace};
use vm_memory::{
    Address, ByteValued, Bytes, GuestAddress, GuestMemory, GuestMemoryMmap, Le16, Le32, Le64,
};

use crate::error::BadDescriptor;
use crate::mem::check_range;

/// Virtio descriptor flags
pub const VIRTQ_DESC_F_NEXT: u16 = 1;
pub const VIRTQ_DESC_F_WRITE: u16 = 2;
pub const VIRTQ_DESC_F_INDIRECT: u16 = 4;

/// Device asks the driver not to kick (used->flags)
pub const VRING_USED_F_NO_NOTIFY: u16 = 1;
/// Driver asks the device not to interrupt (avail->flags)
pub const VRING_AVAIL_F_NO_INTERRUPT: u16 = 1;

/// Ring layout constants
pub const DESC_SIZE: u64 = 16;
pub const AVAIL_RING_HEADER: u64 = 4; // flags(2) + idx(2)
pub const AVAIL_RING_ELEM: u64 = 2;
pub const USED_RING_HEADER: u64 = 4; // flags(2) + idx(2)
pub const USED_RING_ELEM: u64 = 8; // id(4) + len(4)

/// Largest queue size virtio allows for split rings
pub const MAX_QUEUE_SIZE: u16 = 32768;

/// Queue layout as configured by the driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueConfig {
    /// Number of descriptors
    pub num: u16,
    /// Guest address of the descriptor table
    pub desc_addr: u64,
    /// Guest address of the available ring
    pub avail_addr: u64,
    /// Guest address of the used ring
    pub used_addr: u64,
}

/// A descriptor as laid out in guest memory
#[repr(C)]
#[derive(Clone, Copy, Default, Debug)]
pub struct Descriptor {
    pub addr: Le64,
    pub len: Le32,
    pub flags: Le16,
    pub next: Le16,
}

// SAFETY: Descriptor contains only POD types
unsafe impl ByteValued for Descriptor {}

impl Descriptor {
    pub fn addr(&self) -> GuestAddress {
        GuestAddress(u64::from(self.addr))
    }

    pub fn len(&self) -> u32 {
        u32::from(self.len)
    }

    pub fn flags(&self) -> u16 {
        u16::from(self.flags)
    }

    pub fn next(&self) -> u16 {
        u16::from(self.next)
    }

    pub fn has_next(&self) -> bool {
        self.flags() & VIRTQ_DESC_F_NEXT != 0
    }

    pub fn is_write_only(&self) -> bool {
        self.flags() & VIRTQ_DESC_F_WRITE != 0
    }

    pub fn is_indirect(&self) -> bool {
        self.flags() & VIRTQ_DESC_F_INDIRECT != 0
    }
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct UsedElem {
    id: Le32,
    len: Le32,
}

// SAFETY: UsedElem contains only POD types
unsafe impl ByteValued for UsedElem {}

/// Head of an available descriptor chain.
///
/// "No chain" is expressed as `Option<HeadDesc>::None` by the holders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadDesc {
    index: u16,
}

/// Gets told whenever a queue's used index advanced.
pub trait QueueObserver {
    fn notify_queue(&self, queue: &Virtqueue, mem: &GuestMemoryMmap);
}

/// Device-side view of one split virtqueue
#[derive(Debug)]
pub struct Virtqueue {
    num: u16,
    desc: GuestAddress,
    avail: GuestAddress,
    used: GuestAddress,
    ready: bool,
    /// Next avail ring slot we will look at
    next_avail: u16,
    /// Shadow of used->idx
    next_used: u16,
}

impl Default for Virtqueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Virtqueue {
    /// A disabled queue.
    pub fn new() -> Self {
        Self {
            num: 0,
            desc: GuestAddress(0),
            avail: GuestAddress(0),
            used: GuestAddress(0),
            ready: false,
            next_avail: 0,
            next_used: 0,
        }
    }

    /// Set up the queue from a driver supplied configuration.
    ///
    /// Returns false, leaving the queue disabled, if the layout is not
    /// acceptable.
    pub fn setup(&mut self, mem: &GuestMemoryMmap, config: &QueueConfig, vq_max: u16) -> bool {
        self.disable();

        let num = config.num;
        if num == 0 || !num.is_power_of_two() || num > vq_max || num > MAX_QUEUE_SIZE {
            return false;
        }

        if config.desc_addr % 16 != 0 || config.avail_addr % 2 != 0 || config.used_addr % 4 != 0 {
            return false;
        }

        let n = num as u64;
        let areas = [
            (config.desc_addr, n * DESC_SIZE),
            (config.avail_addr, AVAIL_RING_HEADER + n * AVAIL_RING_ELEM + 2),
            (config.used_addr, USED_RING_HEADER + n * USED_RING_ELEM + 2),
        ];
        for (addr, size) in areas {
            if check_range(mem, GuestAddress(addr), size as u32).is_err() {
                return false;
            }
        }

        self.num = num;
        self.desc = GuestAddress(config.desc_addr);
        self.avail = GuestAddress(config.avail_addr);
        self.used = GuestAddress(config.used_addr);
        self.next_avail = 0;
        self.next_used = 0;
        self.ready = true;
        true
    }

    /// Stop servicing this queue.
    pub fn disable(&mut self) {
        self.ready = false;
        self.num = 0;
    }

    pub fn ready(&self) -> bool {
        self.ready
    }

    pub fn num(&self) -> u16 {
        self.num
    }

    pub fn desc_table(&self) -> GuestAddress {
        self.desc
    }

    fn avail_idx(&self, mem: &GuestMemoryMmap) -> Option<u16> {
        mem.load::<u16>(self.avail.unchecked_add(2), Ordering::Acquire)
            .ok()
            .map(u16::from_le)
    }

    fn avail_flags(&self, mem: &GuestMemoryMmap) -> u16 {
        mem.load::<u16>(self.avail, Ordering::Acquire)
            .map(u16::from_le)
            .unwrap_or(0)
    }

    /// Whether the driver made descriptor chains available we did not fetch yet.
    pub fn desc_avail(&self, mem: &GuestMemoryMmap) -> bool {
        self.ready && self.avail_idx(mem).is_some_and(|idx| idx != self.next_avail)
    }

    /// Fetch the next available chain, if any.
    pub fn next_avail(&mut self, mem: &GuestMemoryMmap) -> Result<Option<HeadDesc>, BadDescriptor> {
        if !self.ready {
            return Ok(None);
        }

        let avail = self.avail_idx(mem).ok_or(BadDescriptor::BadAddress {
            addr: self.avail.raw_value(),
            len: AVAIL_RING_HEADER as u32,
        })?;

        if avail == self.next_avail {
            return Ok(None);
        }

        if avail.wrapping_sub(self.next_avail) > self.num {
            return Err(BadDescriptor::BadIndex {
                avail,
                next: self.next_avail,
            });
        }

        // Read the ring entry only after observing the index
        fence(Ordering::Acquire);

        let slot = (self.next_avail % self.num) as u64;
        let entry = self
            .avail
            .unchecked_add(AVAIL_RING_HEADER + slot * AVAIL_RING_ELEM);
        let index = mem
            .read_obj::<Le16>(entry)
            .map(u16::from)
            .map_err(|_| BadDescriptor::BadAddress {
                addr: entry.raw_value(),
                len: AVAIL_RING_ELEM as u32,
            })?;

        self.next_avail = self.next_avail.wrapping_add(1);
        trace!(index, next_avail = self.next_avail, "fetched available chain");
        Ok(Some(HeadDesc { index }))
    }

    fn set_used_flags(&self, mem: &GuestMemoryMmap, flags: u16) {
        if !self.ready {
            return;
        }
        if let Err(e) = mem.store(flags.to_le(), self.used, Ordering::Release) {
            error!(error = %e, "failed to write used ring flags");
        }
    }

    /// Ask the driver to stop kicking us.
    pub fn disable_notify(&self, mem: &GuestMemoryMmap) {
        self.set_used_flags(mem, VRING_USED_F_NO_NOTIFY);
    }

    /// Ask the driver to kick us again when it adds descriptors.
    pub fn enable_notify(&self, mem: &GuestMemoryMmap) {
        self.set_used_flags(mem, 0);
        // The caller re-reads the avail index next
        fence(Ordering::SeqCst);
    }

    /// The driver does not want to be interrupted for used buffers.
    pub fn no_notify_guest(&self, mem: &GuestMemoryMmap) -> bool {
        self.avail_flags(mem) & VRING_AVAIL_F_NO_INTERRUPT != 0
    }

    /// Write a used element `n` slots ahead of the used index without
    /// publishing it. `head` is cleared.
    pub fn consumed_x(&self, mem: &GuestMemoryMmap, n: u16, head: &mut Option<HeadDesc>, len: u32) {
        let Some(h) = head.take() else {
            return;
        };
        if !self.ready {
            return;
        }

        let slot = (self.next_used.wrapping_add(n) % self.num) as u64;
        let addr = self
            .used
            .unchecked_add(USED_RING_HEADER + slot * USED_RING_ELEM);
        let elem = UsedElem {
            id: Le32::from(h.index as u32),
            len: Le32::from(len),
        };
        if let Err(e) = mem.write_obj(elem, addr) {
            error!(error = %e, "failed to write used ring element");
        }
    }

    /// Publish `n` previously consumed elements and notify the observer.
    pub fn finish_x(&mut self, mem: &GuestMemoryMmap, n: u16, observer: &dyn QueueObserver) {
        if !self.ready || n == 0 {
            return;
        }

        // Used elements must be visible before the index moves
        fence(Ordering::Release);
        self.next_used = self.next_used.wrapping_add(n);
        if let Err(e) = mem.store(
            self.next_used.to_le(),
            self.used.unchecked_add(2),
            Ordering::Release,
        ) {
            error!(error = %e, "failed to write used ring index");
            return;
        }

        // Order the index store before reading the driver's interrupt flag
        fence(Ordering::SeqCst);
        observer.notify_queue(self, mem);
    }

    /// Return a single chain to the driver.
    pub fn finish(
        &mut self,
        mem: &GuestMemoryMmap,
        head: &mut Option<HeadDesc>,
        observer: &dyn QueueObserver,
        len: u32,
    ) {
        if head.is_none() {
            return;
        }
        self.consumed_x(mem, 0, head, len);
        self.finish_x(mem, 1, observer);
    }
}

/// Cursor into the memory of one descriptor.
#[derive(Debug, Clone, Copy)]
pub struct Buffer {
    pub addr: GuestAddress,
    pub left: u32,
}

impl Default for Buffer {
    fn default() -> Self {
        Self {
            addr: GuestAddress(0),
            left: 0,
        }
    }
}

impl Buffer {
    pub fn done(&self) -> bool {
        self.left == 0
    }

    /// Consume `n` bytes.
    pub fn advance(&mut self, n: u32) {
        debug_assert!(n <= self.left);
        self.addr = self.addr.unchecked_add(n as u64);
        self.left -= n;
    }
}

/// Validated walker over one descriptor chain.
///
/// Every step re-reads the descriptor from guest memory and re-checks it
/// against the queue size (or indirect table size) and the region table. A
/// chain visiting more descriptors than its table holds is a loop.
#[derive(Debug)]
pub struct RequestProcessor {
    table: GuestAddress,
    table_len: u16,
    current: Descriptor,
    hops: u16,
}

impl Default for RequestProcessor {
    fn default() -> Self {
        Self {
            table: GuestAddress(0),
            table_len: 0,
            current: Descriptor::default(),
            hops: 0,
        }
    }
}

impl RequestProcessor {
    /// Begin walking the chain at `head`.
    ///
    /// `writable` selects the expected direction: device-writable for
    /// receive queues, device-readable for transmit queues.
    pub fn start(
        &mut self,
        mem: &GuestMemoryMmap,
        queue: &Virtqueue,
        head: HeadDesc,
        writable: bool,
    ) -> Result<Buffer, BadDescriptor> {
        self.table = queue.desc_table();
        self.table_len = queue.num();
        self.hops = 1;

        if head.index >= self.table_len {
            return Err(BadDescriptor::BadNext { index: head.index });
        }
        self.current = self.load(mem, head.index)?;

        if self.current.is_indirect() {
            if self.current.has_next() {
                return Err(BadDescriptor::BadFlags);
            }

            let len = self.current.len();
            let entries = len as u64 / DESC_SIZE;
            if len == 0 || len as u64 % DESC_SIZE != 0 || entries > MAX_QUEUE_SIZE as u64 {
                return Err(BadDescriptor::BadSize { len });
            }
            check_range(mem, self.current.addr(), len)?;

            self.table = self.current.addr();
            self.table_len = entries as u16;
            self.current = self.load(mem, 0)?;
            if self.current.is_indirect() {
                return Err(BadDescriptor::BadFlags);
            }
        }

        self.buffer(mem, writable)
    }

    /// Advance to the next descriptor of the chain.
    ///
    /// Returns `Ok(false)` at the end of the chain. Must only be called once
    /// `buf` is exhausted.
    pub fn next(
        &mut self,
        mem: &GuestMemoryMmap,
        writable: bool,
        buf: &mut Buffer,
    ) -> Result<bool, BadDescriptor> {
        if !buf.done() {
            return Err(BadDescriptor::Unconsumed);
        }
        if !self.current.has_next() {
            return Ok(false);
        }

        let index = self.current.next();
        self.hops += 1;
        if index >= self.table_len || self.hops > self.table_len {
            return Err(BadDescriptor::BadNext { index });
        }

        self.current = self.load(mem, index)?;
        if self.current.is_indirect() {
            return Err(BadDescriptor::BadFlags);
        }

        *buf = self.buffer(mem, writable)?;
        Ok(true)
    }

    fn load(&self, mem: &GuestMemoryMmap, index: u16) -> Result<Descriptor, BadDescriptor> {
        let addr = self.table.unchecked_add(index as u64 * DESC_SIZE);
        mem.read_obj::<Descriptor>(addr)
            .map_err(|_| BadDescriptor::BadAddress {
                addr: addr.raw_value(),
                len: DESC_SIZE as u32,
            })
    }

    fn buffer(&self, mem: &GuestMemoryMmap, writable: bool) -> Result<Buffer, BadDescriptor> {
        let desc = &self.current;
        if desc.is_write_only() != writable {
            return Err(BadDescriptor::BadRights);
        }

        check_range(mem, desc.addr(), desc.len())?;
        Ok(Buffer {
            addr: desc.addr(),
            left: desc.len(),
        })
    }
}
