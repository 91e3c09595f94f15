//! Driver side of a split virtqueue, for test clients
//!
//! Mirrors what a guest virtio driver does: a free list of descriptors,
//! chained scatter-gather buffers, publishing through the available ring and
//! reaping the used ring. The switch does not offer event index, so
//! notification suppression uses the ring flags only.

use std::io;
use std::sync::atomic::{Ordering, fence};

use vm_memory::{Bytes, GuestAddress, GuestMemory};

use crate::virtqueue::{
    AVAIL_RING_ELEM, AVAIL_RING_HEADER, DESC_SIZE, QueueConfig, USED_RING_ELEM, USED_RING_HEADER,
    VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE, VRING_AVAIL_F_NO_INTERRUPT, VRING_USED_F_NO_NOTIFY,
};

#[derive(Clone, Default)]
struct DescState {
    token: u64,
    chain_len: u16,
}

/// A chain the device handed back.
#[derive(Debug)]
pub struct UsedBuffer {
    /// Token passed when the chain was added
    pub token: u64,
    /// Bytes the device reported as written
    pub len: u32,
    /// Head descriptor index
    pub head: u16,
}

pub struct VirtqueueDriver {
    size: u16,
    desc_addr: u64,
    avail_addr: u64,
    used_addr: u64,

    free_head: u16,
    num_free: u16,

    /// What we published in avail->idx
    avail_idx_shadow: u16,
    /// Last used->idx we consumed
    last_used_idx: u16,
    avail_flags: u16,

    desc_state: Vec<DescState>,
}

fn mem_err<E: std::fmt::Debug>(what: &'static str) -> impl Fn(E) -> io::Error {
    move |e| io::Error::other(format!("{what}: {e:?}"))
}

impl VirtqueueDriver {
    /// Lay out a queue of `size` descriptors starting at `base_addr`.
    pub fn new(size: u16, base_addr: u64) -> Self {
        let desc_addr = base_addr;
        let avail_addr = desc_addr + size as u64 * DESC_SIZE;
        // flags + idx + ring[size] + used_event
        let avail_size = AVAIL_RING_HEADER + size as u64 * AVAIL_RING_ELEM + 2;
        let used_addr = (avail_addr + avail_size + 3) & !3;

        VirtqueueDriver {
            size,
            desc_addr,
            avail_addr,
            used_addr,
            free_head: 0,
            num_free: size,
            avail_idx_shadow: 0,
            last_used_idx: 0,
            avail_flags: 0,
            desc_state: vec![DescState::default(); size as usize],
        }
    }

    /// Bytes needed for the rings of a queue of `size` descriptors.
    pub fn total_size(size: u16) -> u64 {
        let desc_size = size as u64 * DESC_SIZE;
        let avail_size = AVAIL_RING_HEADER + size as u64 * AVAIL_RING_ELEM + 2;
        let used_size = USED_RING_HEADER + size as u64 * USED_RING_ELEM + 2;
        desc_size + ((avail_size + 3) & !3) + ((used_size + 3) & !3)
    }

    /// Zero the rings and link all descriptors into the free list.
    pub fn init<M: GuestMemory>(&mut self, mem: &M) -> io::Result<()> {
        let zeros = vec![0u8; Self::total_size(self.size) as usize];
        mem.write_slice(&zeros, GuestAddress(self.desc_addr))
            .map_err(mem_err("zero rings"))?;

        for i in 0..self.size {
            let next = if i == self.size - 1 { 0 } else { i + 1 };
            self.write_desc_next(mem, i, next)?;
        }

        self.free_head = 0;
        self.num_free = self.size;
        self.avail_idx_shadow = 0;
        self.last_used_idx = 0;
        self.avail_flags = 0;
        Ok(())
    }

    /// The layout to hand to the device.
    pub fn config(&self) -> QueueConfig {
        QueueConfig {
            num: self.size,
            desc_addr: self.desc_addr,
            avail_addr: self.avail_addr,
            used_addr: self.used_addr,
        }
    }

    pub fn desc_addr(&self) -> u64 {
        self.desc_addr
    }

    pub fn avail_addr(&self) -> u64 {
        self.avail_addr
    }

    pub fn used_addr(&self) -> u64 {
        self.used_addr
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn num_free(&self) -> u16 {
        self.num_free
    }

    /// Add a device-readable chain (transmit).
    pub fn add_outbuf<M: GuestMemory>(
        &mut self,
        mem: &M,
        buffers: &[(u64, u32)],
        token: u64,
    ) -> io::Result<u16> {
        self.add_chain(mem, buffers, &[], token)
    }

    /// Add a single device-writable buffer (receive).
    pub fn add_inbuf<M: GuestMemory>(
        &mut self,
        mem: &M,
        buf_addr: u64,
        len: u32,
        token: u64,
    ) -> io::Result<u16> {
        self.add_chain(mem, &[], &[(buf_addr, len)], token)
    }

    /// Add a chain of readable buffers followed by writable ones.
    pub fn add_chain<M: GuestMemory>(
        &mut self,
        mem: &M,
        out_bufs: &[(u64, u32)],
        in_bufs: &[(u64, u32)],
        token: u64,
    ) -> io::Result<u16> {
        let total = out_bufs.len() + in_bufs.len();
        if total == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty buffer list",
            ));
        }
        if total > self.num_free as usize {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("need {} descriptors, only {} free", total, self.num_free),
            ));
        }

        let head = self.free_head;
        let mut desc_idx = head;
        let mut prev_idx = head;

        let bufs = out_bufs
            .iter()
            .map(|b| (*b, false))
            .chain(in_bufs.iter().map(|b| (*b, true)));
        for (i, ((addr, len), write)) in bufs.enumerate() {
            let is_last = i == total - 1;
            self.write_desc(mem, desc_idx, addr, len, write, !is_last)?;
            prev_idx = desc_idx;
            if !is_last {
                desc_idx = self.read_desc_next(mem, desc_idx)?;
            }
        }

        self.free_head = self.read_desc_next(mem, prev_idx)?;
        self.num_free -= total as u16;
        self.desc_state[head as usize] = DescState {
            token,
            chain_len: total as u16,
        };

        let slot = self.avail_idx_shadow % self.size;
        let ring_offset = self.avail_addr + AVAIL_RING_HEADER + slot as u64 * AVAIL_RING_ELEM;
        mem.write_obj(head, GuestAddress(ring_offset))
            .map_err(mem_err("write avail ring"))?;

        // Ring entry before index
        fence(Ordering::SeqCst);

        self.avail_idx_shadow = self.avail_idx_shadow.wrapping_add(1);
        mem.write_obj(self.avail_idx_shadow, GuestAddress(self.avail_addr + 2))
            .map_err(mem_err("write avail idx"))?;

        Ok(head)
    }

    fn write_desc<M: GuestMemory>(
        &self,
        mem: &M,
        idx: u16,
        addr: u64,
        len: u32,
        write: bool,
        has_next: bool,
    ) -> io::Result<()> {
        let desc_offset = self.desc_addr + idx as u64 * DESC_SIZE;

        let mut flags: u16 = 0;
        if write {
            flags |= VIRTQ_DESC_F_WRITE;
        }
        if has_next {
            flags |= VIRTQ_DESC_F_NEXT;
        }

        mem.write_obj(addr, GuestAddress(desc_offset))
            .map_err(mem_err("write desc addr"))?;
        mem.write_obj(len, GuestAddress(desc_offset + 8))
            .map_err(mem_err("write desc len"))?;
        mem.write_obj(flags, GuestAddress(desc_offset + 12))
            .map_err(mem_err("write desc flags"))?;
        Ok(())
    }

    fn write_desc_next<M: GuestMemory>(&self, mem: &M, idx: u16, next: u16) -> io::Result<()> {
        let offset = self.desc_addr + idx as u64 * DESC_SIZE + 14;
        mem.write_obj(next, GuestAddress(offset))
            .map_err(mem_err("write desc next"))
    }

    fn read_desc_next<M: GuestMemory>(&self, mem: &M, idx: u16) -> io::Result<u16> {
        let offset = self.desc_addr + idx as u64 * DESC_SIZE + 14;
        mem.read_obj(GuestAddress(offset))
            .map_err(mem_err("read desc next"))
    }

    fn used_idx<M: GuestMemory>(&self, mem: &M) -> io::Result<u16> {
        mem.read_obj(GuestAddress(self.used_addr + 2))
            .map_err(mem_err("read used idx"))
    }

    /// Reap one used chain, if there is one.
    pub fn pop_used<M: GuestMemory>(&mut self, mem: &M) -> io::Result<Option<UsedBuffer>> {
        if self.used_idx(mem)? == self.last_used_idx {
            return Ok(None);
        }

        fence(Ordering::SeqCst);

        let slot = self.last_used_idx % self.size;
        let elem_offset = self.used_addr + USED_RING_HEADER + slot as u64 * USED_RING_ELEM;
        let id: u32 = mem
            .read_obj(GuestAddress(elem_offset))
            .map_err(mem_err("read used id"))?;
        let len: u32 = mem
            .read_obj(GuestAddress(elem_offset + 4))
            .map_err(mem_err("read used len"))?;

        let head = id as u16;
        let state = self.desc_state[head as usize].clone();
        self.free_chain(mem, head, state.chain_len)?;
        self.last_used_idx = self.last_used_idx.wrapping_add(1);

        Ok(Some(UsedBuffer {
            token: state.token,
            len,
            head,
        }))
    }

    fn free_chain<M: GuestMemory>(&mut self, mem: &M, head: u16, count: u16) -> io::Result<()> {
        let mut tail = head;
        for _ in 1..count {
            tail = self.read_desc_next(mem, tail)?;
        }
        self.write_desc_next(mem, tail, self.free_head)?;
        self.free_head = head;
        self.num_free += count;
        Ok(())
    }

    /// Whether the device wants to be kicked.
    pub fn needs_kick<M: GuestMemory>(&self, mem: &M) -> io::Result<bool> {
        fence(Ordering::SeqCst);
        let flags: u16 = mem
            .read_obj(GuestAddress(self.used_addr))
            .map_err(mem_err("read used flags"))?;
        Ok(flags & VRING_USED_F_NO_NOTIFY == 0)
    }

    fn write_avail_flags<M: GuestMemory>(&mut self, mem: &M, flags: u16) -> io::Result<()> {
        self.avail_flags = flags;
        mem.write_obj(flags, GuestAddress(self.avail_addr))
            .map_err(mem_err("write avail flags"))
    }

    /// Ask the device to interrupt on used buffers.
    pub fn enable_cb<M: GuestMemory>(&mut self, mem: &M) -> io::Result<()> {
        self.write_avail_flags(mem, self.avail_flags & !VRING_AVAIL_F_NO_INTERRUPT)
    }

    /// Ask the device not to interrupt.
    pub fn disable_cb<M: GuestMemory>(&mut self, mem: &M) -> io::Result<()> {
        self.write_avail_flags(mem, self.avail_flags | VRING_AVAIL_F_NO_INTERRUPT)
    }

    pub fn has_used<M: GuestMemory>(&self, mem: &M) -> io::Result<bool> {
        Ok(self.used_idx(mem)? != self.last_used_idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::create_test_memory;

    #[test]
    fn test_free_list_init() {
        let mem = create_test_memory(64 * 1024);
        let mut vq = VirtqueueDriver::new(16, 0);
        vq.init(&mem).expect("init");

        assert_eq!(vq.num_free(), 16);
        for i in 0..15u16 {
            assert_eq!(vq.read_desc_next(&mem, i).expect("read next"), i + 1);
        }
    }

    #[test]
    fn test_add_chain_flags() {
        let mem = create_test_memory(64 * 1024);
        let mut vq = VirtqueueDriver::new(16, 0);
        vq.init(&mem).expect("init");

        let head = vq
            .add_chain(&mem, &[(0x1000, 12)], &[(0x2000, 1500)], 42)
            .expect("add chain");
        assert_eq!(head, 0);
        assert_eq!(vq.num_free(), 14);

        let flags0: u16 = mem.read_obj(GuestAddress(12)).expect("flags0");
        assert_eq!(flags0, VIRTQ_DESC_F_NEXT);
        let flags1: u16 = mem.read_obj(GuestAddress(16 + 12)).expect("flags1");
        assert_eq!(flags1, VIRTQ_DESC_F_WRITE);

        let avail_idx: u16 = mem
            .read_obj(GuestAddress(vq.avail_addr() + 2))
            .expect("avail idx");
        assert_eq!(avail_idx, 1);
    }

    #[test]
    fn test_pop_used_returns_descriptors() {
        let mem = create_test_memory(64 * 1024);
        let mut vq = VirtqueueDriver::new(4, 0);
        vq.init(&mem).expect("init");

        vq.add_outbuf(&mem, &[(0x1000, 12), (0x2000, 64)], 7)
            .expect("add");
        assert_eq!(vq.num_free(), 2);

        // Play device: used[0] = {0, 0}, used->idx = 1
        let used = vq.used_addr();
        mem.write_obj(0u32, GuestAddress(used + 4)).unwrap();
        mem.write_obj(0u32, GuestAddress(used + 8)).unwrap();
        mem.write_obj(1u16, GuestAddress(used + 2)).unwrap();

        let buf = vq.pop_used(&mem).expect("pop").expect("used");
        assert_eq!(buf.token, 7);
        assert_eq!(vq.num_free(), 4);
        assert!(!vq.has_used(&mem).unwrap());
    }
}
