//! A simulated guest bound to one switch port

use std::sync::Arc;

use anyhow::{Context, bail};
use vm_memory::{ByteValued, Bytes, GuestAddress, GuestMemoryMmap};

use super::{UsedBuffer, VirtqueueDriver, guest_region};
use crate::device::{
    STATUS_ACKNOWLEDGE, STATUS_DRIVER, STATUS_DRIVER_OK, STATUS_FAILED, STATUS_FEATURES_OK,
    VIRTIO_F_VERSION_1, VIRTIO_NET_HDR_SIZE, VirtioNetHdr,
};
use crate::irq::CountingIrq;
use crate::sock_pair::{Arg, PortCap, PortOp, PortReply, SockPair};
use crate::virtqueue::QueueConfig;

/// Size of the memory region each guest shares
pub const GUEST_MEM_SIZE: usize = 1 << 20;

/// Queue size the simulated driver sets up
pub const QUEUE_SIZE: u16 = 256;

const RX_RINGS: u64 = 0;
const TX_RINGS: u64 = 0x4000;
const BUFFERS: u64 = 0x10000;

/// One received buffer, split into header and frame bytes.
#[derive(Debug)]
pub struct RxPacket {
    pub hdr: VirtioNetHdr,
    pub frame: Vec<u8>,
    /// Used length reported by the device, header included
    pub len: u32,
}

/// Driver side of one port: memory, rings and the guest IRQ.
pub struct GuestPort {
    cap: PortCap,
    base: u64,
    mem: GuestMemoryMmap,
    irq: Arc<CountingIrq>,
    rx: VirtqueueDriver,
    tx: VirtqueueDriver,
    next_buf: u64,
}

impl GuestPort {
    /// Bind a port of `sp` and drive it to DRIVER_OK with `features`
    /// (feature word 0, masked by what the switch offers).
    pub fn connect(sp: &mut SockPair, base: u64, features: u32) -> anyhow::Result<Self> {
        let region = guest_region(base, GUEST_MEM_SIZE);
        let mem = GuestMemoryMmap::from_arc_regions(vec![region.clone()])
            .context("failed to build guest memory")?;

        let cap = sp.op_create(0, &[Arg::Int(1)])?;
        sp.port_op(&cap, PortOp::AddMemRegion(region))?;

        let irq = Arc::new(CountingIrq::new());
        sp.port_op(&cap, PortOp::SetGuestIrq(Box::new(irq.clone())))?;

        let offered = match sp.port_op(&cap, PortOp::HostFeatures(0))? {
            PortReply::Features(f) => f,
            other => bail!("unexpected reply to HostFeatures: {other:?}"),
        };
        sp.port_op(
            &cap,
            PortOp::SetGuestFeatures {
                word: 0,
                value: features & offered,
            },
        )?;
        sp.port_op(
            &cap,
            PortOp::SetGuestFeatures {
                word: 1,
                value: VIRTIO_F_VERSION_1,
            },
        )?;

        let mut status = STATUS_ACKNOWLEDGE | STATUS_DRIVER;
        sp.port_op(&cap, PortOp::SetStatus(status))?;
        status |= STATUS_FEATURES_OK;
        sp.port_op(&cap, PortOp::SetStatus(status))?;

        let mut rx = VirtqueueDriver::new(QUEUE_SIZE, base + RX_RINGS);
        let mut tx = VirtqueueDriver::new(QUEUE_SIZE, base + TX_RINGS);
        rx.init(&mem)?;
        tx.init(&mem)?;
        sp.port_op(
            &cap,
            PortOp::SetQueue {
                index: 0,
                config: rx.config(),
            },
        )?;
        sp.port_op(
            &cap,
            PortOp::SetQueue {
                index: 1,
                config: tx.config(),
            },
        )?;

        status |= STATUS_DRIVER_OK;
        match sp.port_op(&cap, PortOp::SetStatus(status))? {
            PortReply::Status(s) if s & STATUS_DRIVER_OK != 0 && s & STATUS_FAILED == 0 => {}
            other => bail!("device did not come up: {other:?}"),
        }

        Ok(Self {
            cap,
            base,
            mem,
            irq,
            rx,
            tx,
            next_buf: base + BUFFERS,
        })
    }

    pub fn cap(&self) -> &PortCap {
        &self.cap
    }

    pub fn memory(&self) -> &GuestMemoryMmap {
        &self.mem
    }

    /// Guest IRQs raised by the switch so far
    pub fn irqs(&self) -> u64 {
        self.irq.count()
    }

    /// Queue layout, for tests that reconfigure a queue by hand.
    pub fn queue_config(&self, index: usize) -> QueueConfig {
        if index == 0 {
            self.rx.config()
        } else {
            self.tx.config()
        }
    }

    /// Guest physical address just past the shared region.
    pub fn end(&self) -> u64 {
        self.base + GUEST_MEM_SIZE as u64
    }

    /// Carve `len` bytes out of the buffer area.
    pub fn alloc(&mut self, len: usize) -> anyhow::Result<u64> {
        let addr = self.next_buf;
        let next = (addr + len as u64 + 15) & !15;
        if next > self.end() {
            bail!("guest buffer area exhausted");
        }
        self.next_buf = next;
        Ok(addr)
    }

    pub fn write(&self, addr: u64, data: &[u8]) -> anyhow::Result<()> {
        self.mem
            .write_slice(data, GuestAddress(addr))
            .context("guest write")
    }

    pub fn read(&self, addr: u64, len: usize) -> anyhow::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.mem
            .read_slice(&mut buf, GuestAddress(addr))
            .context("guest read")?;
        Ok(buf)
    }

    /// Transmit `frame` as a header descriptor followed by a frame descriptor.
    pub fn send(&mut self, hdr: &VirtioNetHdr, frame: &[u8]) -> anyhow::Result<u16> {
        let hdr_addr = self.alloc(VIRTIO_NET_HDR_SIZE)?;
        self.mem
            .write_obj(*hdr, GuestAddress(hdr_addr))
            .context("write header")?;
        let frame_addr = self.alloc(frame.len())?;
        self.write(frame_addr, frame)?;

        self.send_raw(
            &[
                (hdr_addr, VIRTIO_NET_HDR_SIZE as u32),
                (frame_addr, frame.len() as u32),
            ],
            hdr_addr,
        )
    }

    /// Transmit the header in its own descriptor and the frame split into
    /// descriptors of `seg` bytes.
    pub fn send_segmented(
        &mut self,
        hdr: &VirtioNetHdr,
        frame: &[u8],
        seg: usize,
    ) -> anyhow::Result<u16> {
        let hdr_addr = self.alloc(VIRTIO_NET_HDR_SIZE)?;
        self.write(hdr_addr, hdr.as_slice())?;

        let mut segments = vec![(hdr_addr, VIRTIO_NET_HDR_SIZE as u32)];
        for chunk in frame.chunks(seg) {
            let addr = self.alloc(chunk.len())?;
            self.write(addr, chunk)?;
            segments.push((addr, chunk.len() as u32));
        }
        self.send_raw(&segments, hdr_addr)
    }

    /// Publish an arbitrary device-readable chain on the transmit queue.
    pub fn send_raw(&mut self, segments: &[(u64, u32)], token: u64) -> anyhow::Result<u16> {
        Ok(self.tx.add_outbuf(&self.mem, segments, token)?)
    }

    /// Post a receive buffer of `len` bytes; returns its address.
    pub fn post_rx(&mut self, len: u32) -> anyhow::Result<u64> {
        let addr = self.alloc(len as usize)?;
        self.rx.add_inbuf(&self.mem, addr, len, addr)?;
        Ok(addr)
    }

    /// Post a receive chain made of several writable descriptors.
    pub fn post_rx_chain(&mut self, lens: &[u32]) -> anyhow::Result<u64> {
        let mut bufs = Vec::with_capacity(lens.len());
        for &len in lens {
            bufs.push((self.alloc(len as usize)?, len));
        }
        let token = bufs[0].0;
        self.rx.add_chain(&self.mem, &[], &bufs, token)?;
        Ok(token)
    }

    /// Reap one used receive buffer.
    pub fn pop_rx_buffer(&mut self) -> anyhow::Result<Option<UsedBuffer>> {
        Ok(self.rx.pop_used(&self.mem)?)
    }

    /// Reap one used receive buffer and split off its header.
    pub fn pop_rx(&mut self) -> anyhow::Result<Option<RxPacket>> {
        let Some(used) = self.pop_rx_buffer()? else {
            return Ok(None);
        };

        let hdr: VirtioNetHdr = self
            .mem
            .read_obj(GuestAddress(used.token))
            .context("read header")?;
        let frame_len = (used.len as usize).saturating_sub(VIRTIO_NET_HDR_SIZE);
        let frame = self.read(used.token + VIRTIO_NET_HDR_SIZE as u64, frame_len)?;
        Ok(Some(RxPacket {
            hdr,
            frame,
            len: used.len,
        }))
    }

    /// Reap one completed transmit chain.
    pub fn pop_tx(&mut self) -> anyhow::Result<Option<UsedBuffer>> {
        Ok(self.tx.pop_used(&self.mem)?)
    }

    /// Whether the switch wants a kick for the transmit queue.
    pub fn tx_needs_kick(&self) -> anyhow::Result<bool> {
        Ok(self.tx.needs_kick(&self.mem)?)
    }

    /// Whether the switch wants a kick for the receive queue.
    pub fn rx_needs_kick(&self) -> anyhow::Result<bool> {
        Ok(self.rx.needs_kick(&self.mem)?)
    }

    /// Ask the switch not to interrupt for received packets.
    pub fn suppress_rx_irq(&mut self) -> anyhow::Result<()> {
        Ok(self.rx.disable_cb(&self.mem)?)
    }

    pub fn status(&self, sp: &mut SockPair) -> anyhow::Result<u8> {
        match sp.port_op(&self.cap, PortOp::Status)? {
            PortReply::Status(s) => Ok(s),
            other => bail!("unexpected reply to Status: {other:?}"),
        }
    }
}
