//! Internet checksum fix-up for forwarded packets
//!
//! A transmitting guest that negotiated checksum offload may hand over a
//! packet with `NEEDS_CSUM` set: the checksum field holds only the
//! pseudo-header sum and the rest is left to the device. If the receiving
//! guest did not negotiate `GUEST_CSUM` it expects a finished checksum, so the
//! switch computes it while copying and patches it into the receive buffer.

use tracing::trace;
use vm_memory::{Address, Bytes, GuestAddress, GuestMemoryMmap};

use crate::device::{
    VIRTIO_NET_HDR_F_DATA_VALID, VIRTIO_NET_HDR_F_NEEDS_CSUM, VIRTIO_NET_HDR_SIZE, VirtioNetHdr,
};
use crate::error::BadDescriptor;

/// Streaming ones-complement sum (RFC 1071).
///
/// Data may be fed in chunks of any length; odd chunk boundaries are carried
/// over to the next call.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetChecksum {
    sum: u64,
    odd: bool,
}

impl NetChecksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, mut data: &[u8]) {
        if self.odd
            && let Some((&b, rest)) = data.split_first()
        {
            self.sum += b as u64;
            self.odd = false;
            data = rest;
        }

        let mut words = data.chunks_exact(2);
        for w in &mut words {
            self.sum += u16::from_be_bytes([w[0], w[1]]) as u64;
        }
        if let [b] = words.remainder() {
            self.sum += (*b as u64) << 8;
            self.odd = true;
        }
    }

    /// The folded 16-bit sum, not inverted.
    pub fn folded(&self) -> u16 {
        let mut sum = self.sum;
        while sum >> 16 != 0 {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        sum as u16
    }

    /// The checksum to store in a header field.
    pub fn finalize(&self) -> u16 {
        !self.folded()
    }
}

const SCRATCH: usize = 256;

/// Per-direction checksum state of a packet in flight.
///
/// Positions are relative to the start of the Ethernet frame, i.e. after
/// the virtio-net header, as `csum_start` is.
#[derive(Debug, Default)]
pub struct ChecksumComputer {
    noop: bool,
    csum: NetChecksum,
    csum_start: u64,
    csum_offset: u64,
    /// Header of the packet in the receive buffer
    hdr: GuestAddress,
    /// Where the two result bytes go in the receive buffer. The field may
    /// straddle two receive descriptors.
    rxptr: [Option<GuestAddress>; 2],
}

impl ChecksumComputer {
    fn reset(&mut self, hdr: &VirtioNetHdr, guest_csum: bool) {
        self.noop = guest_csum || !hdr.needs_csum();
        self.csum = NetChecksum::new();
        self.csum_start = hdr.csum_start() as u64;
        self.csum_offset = hdr.csum_offset() as u64;
        self.rxptr = [None; 2];
        if !self.noop {
            trace!(
                csum_start = self.csum_start,
                csum_offset = self.csum_offset,
                "checksum fix-up armed"
            );
        }
    }

    /// Account for `len` bytes just copied to `chunk` in the receive memory.
    ///
    /// `chain_pos` is the offset of the chunk within the transmit chain. A
    /// chunk at offset 0 starts a new packet. The header is parsed once all
    /// of it has been copied, so it may arrive in several chunks.
    pub fn update(
        &mut self,
        rx_mem: &GuestMemoryMmap,
        guest_csum: bool,
        chain_pos: u32,
        chunk: GuestAddress,
        len: u32,
    ) -> Result<(), BadDescriptor> {
        let mut chunk = chunk;
        let mut len = len as u64;
        let mut pos = chain_pos as u64;

        if pos == 0 {
            self.hdr = chunk;
            self.noop = true;
            self.rxptr = [None; 2];
        }

        let hdr = VIRTIO_NET_HDR_SIZE as u64;
        if pos < hdr {
            let skip = (hdr - pos).min(len);
            if pos + skip == hdr {
                let at = self.hdr;
                let h: VirtioNetHdr = rx_mem.read_obj(at).map_err(|_| BadDescriptor::BadAddress {
                    addr: at.raw_value(),
                    len: VIRTIO_NET_HDR_SIZE as u32,
                })?;
                self.reset(&h, guest_csum);
            }
            chunk = chunk.unchecked_add(skip);
            len -= skip;
            pos += skip;
        }

        if self.noop || len == 0 {
            return Ok(());
        }

        let frame_pos = pos - hdr;
        let end = frame_pos + len;

        let field = self.csum_start + self.csum_offset;
        for (at, slot) in (field..field + 2).zip(self.rxptr.iter_mut()) {
            if slot.is_none() && (frame_pos..end).contains(&at) {
                *slot = Some(chunk.unchecked_add(at - frame_pos));
            }
        }

        if end <= self.csum_start {
            return Ok(());
        }

        let skip = self.csum_start.saturating_sub(frame_pos);
        let mut addr = chunk.unchecked_add(skip);
        let mut left = (len - skip) as usize;
        let mut buf = [0u8; SCRATCH];
        while left > 0 {
            let n = left.min(SCRATCH);
            rx_mem
                .read_slice(&mut buf[..n], addr)
                .map_err(|_| BadDescriptor::BadAddress {
                    addr: addr.raw_value(),
                    len: n as u32,
                })?;
            self.csum.add(&buf[..n]);
            addr = addr.unchecked_add(n as u64);
            left -= n;
        }
        Ok(())
    }

    /// Patch the checksum into the receive buffer and fix up the header.
    ///
    /// Returns false if the checksum field never showed up in the packet.
    pub fn finish(
        &mut self,
        rx_mem: &GuestMemoryMmap,
        rx_hdr: GuestAddress,
    ) -> Result<bool, BadDescriptor> {
        if self.noop {
            return Ok(true);
        }
        let [Some(hi), Some(lo)] = std::mem::take(&mut self.rxptr) else {
            return Ok(false);
        };

        let bad = |addr: GuestAddress, len: u32| BadDescriptor::BadAddress {
            addr: addr.raw_value(),
            len,
        };

        let csum = self.csum.finalize();
        let [b0, b1] = csum.to_be_bytes();
        rx_mem.write_obj(b0, hi).map_err(|_| bad(hi, 1))?;
        rx_mem.write_obj(b1, lo).map_err(|_| bad(lo, 1))?;

        let flags: u8 = rx_mem.read_obj(rx_hdr).map_err(|_| bad(rx_hdr, 1))?;
        let flags = flags & !(VIRTIO_NET_HDR_F_NEEDS_CSUM | VIRTIO_NET_HDR_F_DATA_VALID);
        rx_mem.write_obj(flags, rx_hdr).map_err(|_| bad(rx_hdr, 1))?;

        trace!(csum, "checksum patched");
        Ok(true)
    }
}
