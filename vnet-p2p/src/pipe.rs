//! One direction of the link: copy engine between two ports
//!
//! A `Pipe` moves packets from the transmit queue of one port into the
//! receive queue of the other. Each side is an `EndPoint`, a cursor over the
//! descriptor chain currently being worked on. The copy runs until either
//! side runs out of descriptors; partially moved packets stay in the end
//! points and resume on the next kick.

use std::cmp::min;

use tracing::{trace, warn};
use vm_memory::{Address, Bytes, GuestAddress, GuestMemory, GuestMemoryMmap, Le16};

use crate::checksum::ChecksumComputer;
use crate::device::{
    RX_QUEUE, TX_QUEUE, VIRTIO_NET_HDR_NUM_BUFFERS, VIRTIO_NET_HDR_SIZE, VirtioNet,
};
use crate::error::BadDescriptor;
use crate::virtqueue::{Buffer, HeadDesc, RequestProcessor};

/// Outcome of trying to start on a new descriptor chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Start {
    /// A chain is in progress
    Ready,
    /// The queue has nothing to offer
    Empty,
    /// The chain was too short for a header and handed back unused
    Dropped,
}

/// Cursor over the chain one side of a pipe is working on.
#[derive(Debug)]
pub struct EndPoint {
    queue: usize,
    head: Option<HeadDesc>,
    proc: RequestProcessor,
    pkt: Buffer,
    /// Header of the current packet, in the first buffer of the packet
    hdr: Option<GuestAddress>,
    /// Bytes moved through the current chain
    consumed: u32,
}

impl EndPoint {
    pub fn new(queue: usize) -> Self {
        Self {
            queue,
            head: None,
            proc: RequestProcessor::default(),
            pkt: Buffer::default(),
            hdr: None,
            consumed: 0,
        }
    }

    fn writable(&self) -> bool {
        self.queue == RX_QUEUE
    }

    /// A chain is being worked on.
    pub fn active(&self) -> bool {
        self.head.is_some()
    }

    /// Fetch the next chain of the queue.
    ///
    /// With `merge` the chain continues the current packet and carries no
    /// header of its own.
    pub fn start_packet(&mut self, dev: &mut VirtioNet, merge: bool) -> Result<Start, BadDescriptor> {
        let Some(head) = dev.next_avail(self.queue)? else {
            return Ok(Start::Empty);
        };

        self.head = Some(head);
        self.consumed = 0;
        self.pkt = self
            .proc
            .start(dev.memory(), dev.queue(self.queue), head, self.writable())?;

        if merge {
            return Ok(Start::Ready);
        }

        if (self.pkt.left as usize) < VIRTIO_NET_HDR_SIZE {
            warn!(
                port = dev.id(),
                queue = self.queue,
                len = self.pkt.left,
                "descriptor too short for a header, dropping"
            );
            self.finish(dev, 0);
            dev.stats().inc_dropped();
            return Ok(Start::Dropped);
        }

        self.hdr = Some(self.pkt.addr);
        Ok(Start::Ready)
    }

    /// Move on to the next descriptor of the chain; false at its end.
    pub fn next(&mut self, dev: &VirtioNet) -> Result<bool, BadDescriptor> {
        let writable = self.writable();
        self.proc.next(dev.memory(), writable, &mut self.pkt)
    }

    /// Return the chain to the driver.
    pub fn finish(&mut self, dev: &mut VirtioNet, len: u32) {
        dev.finish(self.queue, &mut self.head, len);
        self.pkt = Buffer::default();
        self.hdr = None;
    }

    /// Write the used element `n` slots ahead without publishing it.
    fn consume(&mut self, dev: &VirtioNet, n: u16, len: u32) {
        dev.consumed_x(self.queue, n, &mut self.head, len);
        self.pkt = Buffer::default();
    }

    /// Forget the chain without handing it back.
    fn clear(&mut self) {
        self.head = None;
        self.pkt = Buffer::default();
        self.hdr = None;
        self.consumed = 0;
    }
}

enum Fault {
    Tx(BadDescriptor),
    Rx(BadDescriptor),
}

fn copy_chunk(
    src_mem: &GuestMemoryMmap,
    src: GuestAddress,
    dst_mem: &GuestMemoryMmap,
    dst: GuestAddress,
    len: u32,
) -> Result<(), Fault> {
    let bad = |addr: GuestAddress| BadDescriptor::BadAddress {
        addr: addr.raw_value(),
        len,
    };
    let from = src_mem
        .get_slice(src, len as usize)
        .map_err(|_| Fault::Tx(bad(src)))?;
    let to = dst_mem
        .get_slice(dst, len as usize)
        .map_err(|_| Fault::Rx(bad(dst)))?;
    from.copy_to_volatile_slice(to);
    Ok(())
}

/// One forwarding direction.
#[derive(Debug)]
pub struct Pipe {
    tx_port: usize,
    rx_port: usize,
    tx: EndPoint,
    rx: EndPoint,
    /// Bytes copied for the current packet
    total: u32,
    /// Receive buffers consumed but not yet published for the current packet
    nmerge: u16,
    /// Heads of those buffers, in used ring order
    merged: Vec<HeadDesc>,
    csum: ChecksumComputer,
}

impl Pipe {
    pub fn new(tx_port: usize, rx_port: usize) -> Self {
        Self {
            tx_port,
            rx_port,
            tx: EndPoint::new(TX_QUEUE),
            rx: EndPoint::new(RX_QUEUE),
            total: 0,
            nmerge: 0,
            merged: Vec::new(),
            csum: ChecksumComputer::default(),
        }
    }

    fn devices<'a>(&self, ports: &'a mut [VirtioNet; 2]) -> (&'a mut VirtioNet, &'a mut VirtioNet) {
        let [a, b] = ports;
        if self.tx_port == 0 { (a, b) } else { (b, a) }
    }

    /// Move as many packets as both queues allow.
    ///
    /// Returns true if any descriptor was consumed. A guest protocol error
    /// disables the faulting queue and aborts this call.
    pub fn copy(&mut self, ports: &mut [VirtioNet; 2]) -> bool {
        let (tx_dev, rx_dev) = self.devices(ports);
        match self.run(tx_dev, rx_dev) {
            Ok(progress) => progress,
            Err(Fault::Tx(e)) => {
                tx_dev.device_error(TX_QUEUE, e);
                self.abandon_tx(rx_dev);
                true
            }
            Err(Fault::Rx(e)) => {
                rx_dev.device_error(RX_QUEUE, e);
                self.abandon_rx(tx_dev);
                true
            }
        }
    }

    fn run(&mut self, tx_dev: &mut VirtioNet, rx_dev: &mut VirtioNet) -> Result<bool, Fault> {
        let mut progress = false;

        loop {
            if !self.tx.active() {
                match self.tx.start_packet(tx_dev, false).map_err(Fault::Tx)? {
                    Start::Empty => return Ok(progress),
                    Start::Dropped => {
                        progress = true;
                        continue;
                    }
                    Start::Ready => {
                        self.nmerge = 0;
                        self.merged.clear();
                        self.total = 0;
                    }
                }
            }

            if !self.rx.active() {
                let merge = self.nmerge > 0;
                match self.rx.start_packet(rx_dev, merge).map_err(Fault::Rx)? {
                    Start::Empty => return Ok(progress),
                    Start::Dropped => {
                        progress = true;
                        continue;
                    }
                    Start::Ready => {}
                }
            }

            if !self.tx.pkt.done() && !self.rx.pkt.done() {
                let n = min(self.tx.pkt.left, self.rx.pkt.left);
                copy_chunk(
                    tx_dev.memory(),
                    self.tx.pkt.addr,
                    rx_dev.memory(),
                    self.rx.pkt.addr,
                    n,
                )?;
                self.csum
                    .update(
                        rx_dev.memory(),
                        rx_dev.enabled_features().guest_csum(),
                        self.tx.consumed,
                        self.rx.pkt.addr,
                        n,
                    )
                    .map_err(Fault::Rx)?;

                self.tx.pkt.advance(n);
                self.rx.pkt.advance(n);
                self.tx.consumed += n;
                self.rx.consumed += n;
                self.total += n;
                progress = true;
            }

            if self.tx.pkt.done() && !self.tx.next(tx_dev).map_err(Fault::Tx)? {
                self.complete_packet(tx_dev, rx_dev).map_err(Fault::Rx)?;
                continue;
            }

            if self.rx.pkt.done() && !self.tx.pkt.done() {
                if self.rx.next(rx_dev).map_err(Fault::Rx)? {
                    continue;
                }

                let may_merge = rx_dev.enabled_features().mrg_rxbuf()
                    && (self.nmerge as u32 + 1) < rx_dev.queue(RX_QUEUE).num() as u32;
                if may_merge {
                    self.merged.extend(self.rx.head);
                    let len = self.rx.consumed;
                    self.rx.consume(rx_dev, self.nmerge, len);
                    self.nmerge += 1;
                    trace!(nmerge = self.nmerge, "receive buffer full, merging");
                } else {
                    self.truncate(tx_dev, rx_dev).map_err(Fault::Rx)?;
                }
            }
        }
    }

    fn complete_packet(
        &mut self,
        tx_dev: &mut VirtioNet,
        rx_dev: &mut VirtioNet,
    ) -> Result<(), BadDescriptor> {
        self.tx.finish(tx_dev, 0);

        if let Some(hdr) = self.rx.hdr {
            if !self.csum.finish(rx_dev.memory(), hdr)? {
                warn!(
                    from = self.tx_port,
                    to = self.rx_port,
                    "checksum field outside the packet, forwarding unchanged"
                );
                rx_dev.stats().inc_dropped();
            }

            if rx_dev.enabled_features().mrg_rxbuf() {
                let at = hdr.unchecked_add(VIRTIO_NET_HDR_NUM_BUFFERS);
                write_le16(rx_dev.memory(), at, self.nmerge + 1)?;
            }
        }

        let len = self.rx.consumed;
        self.rx.consume(rx_dev, self.nmerge, len);
        rx_dev.finish_x(RX_QUEUE, self.nmerge + 1);
        self.rx.hdr = None;

        tx_dev.stats().inc_tx();
        rx_dev.stats().inc_rx();
        trace!(
            from = self.tx_port,
            to = self.rx_port,
            len = self.total,
            buffers = self.nmerge + 1,
            "packet forwarded"
        );

        self.nmerge = 0;
        self.merged.clear();
        self.total = 0;
        Ok(())
    }

    /// The packet does not fit the receive side: hand back both chains.
    fn truncate(
        &mut self,
        tx_dev: &mut VirtioNet,
        rx_dev: &mut VirtioNet,
    ) -> Result<(), BadDescriptor> {
        warn!(
            from = self.tx_port,
            to = self.rx_port,
            copied = self.total,
            "receive buffer too small, dropping packet"
        );

        if let Some(hdr) = self.rx.hdr {
            rx_dev
                .memory()
                .write_obj(0u8, hdr)
                .map_err(|_| BadDescriptor::BadAddress {
                    addr: hdr.raw_value(),
                    len: 1,
                })?;
            if rx_dev.enabled_features().mrg_rxbuf() {
                let at = hdr.unchecked_add(VIRTIO_NET_HDR_NUM_BUFFERS);
                write_le16(rx_dev.memory(), at, self.nmerge + 1)?;
            }
        }

        // Every buffer of the dropped packet goes back empty
        for (n, head) in self.merged.drain(..).enumerate() {
            rx_dev.consumed_x(RX_QUEUE, n as u16, &mut Some(head), 0);
        }
        self.rx.consume(rx_dev, self.nmerge, 0);
        rx_dev.finish_x(RX_QUEUE, self.nmerge + 1);
        self.rx.hdr = None;
        self.tx.finish(tx_dev, 0);
        rx_dev.stats().inc_dropped();

        self.nmerge = 0;
        self.total = 0;
        Ok(())
    }

    /// The transmit side is gone: publish what the receiver already has.
    fn abandon_tx(&mut self, rx_dev: &mut VirtioNet) {
        self.tx.clear();

        let pending = self.nmerge + self.rx.active() as u16;
        if pending > 0 {
            let len = self.rx.consumed;
            self.rx.consume(rx_dev, self.nmerge, len);
            rx_dev.finish_x(RX_QUEUE, pending);
        }
        self.rx.clear();
        self.reset_packet();
    }

    /// The receive side is gone: return the transmit chain in flight.
    fn abandon_rx(&mut self, tx_dev: &mut VirtioNet) {
        self.rx.clear();
        if self.tx.active() {
            self.tx.finish(tx_dev, 0);
        }
        self.tx.clear();
        self.reset_packet();
    }

    fn reset_packet(&mut self) {
        self.nmerge = 0;
        self.merged.clear();
        self.total = 0;
        self.csum = ChecksumComputer::default();
    }

    /// Drop all state referring to `port`, which was reset.
    pub fn drop_port(&mut self, ports: &mut [VirtioNet; 2], port: usize) {
        let (tx_dev, rx_dev) = self.devices(ports);
        if port == self.tx_port {
            self.abandon_tx(rx_dev);
        } else if port == self.rx_port {
            self.abandon_rx(tx_dev);
        }
    }

    /// Both sides could make progress.
    pub fn work_pending(&self, ports: &[VirtioNet; 2]) -> bool {
        let tx_dev = &ports[self.tx_port];
        let rx_dev = &ports[self.rx_port];
        (self.tx.active() || tx_dev.desc_avail(TX_QUEUE))
            && (self.rx.active() || rx_dev.desc_avail(RX_QUEUE))
    }

    pub fn disable_notify(&self, ports: &[VirtioNet; 2]) {
        ports[self.tx_port].disable_notify(TX_QUEUE);
        ports[self.rx_port].disable_notify(RX_QUEUE);
    }

    pub fn enable_notify(&self, ports: &[VirtioNet; 2]) {
        ports[self.tx_port].enable_notify(TX_QUEUE);
        ports[self.rx_port].enable_notify(RX_QUEUE);
    }
}

fn write_le16(mem: &GuestMemoryMmap, at: GuestAddress, value: u16) -> Result<(), BadDescriptor> {
    mem.write_obj(Le16::from(value), at)
        .map_err(|_| BadDescriptor::BadAddress {
            addr: at.raw_value(),
            len: 2,
        })
}
