//! Virtio-net port device model
//!
//! One `VirtioNet` per switch port. It owns the port's two virtqueues, the
//! negotiated feature set, the guest memory region table and the guest
//! notification. Ports are created once and recycled: a disconnecting client
//! resets its port to defaults instead of destroying it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tracing::{debug, error, info, warn};
use vm_memory::{ByteValued, GuestMemoryMmap, GuestRegionMmap, Le16};

use crate::error::{BadDescriptor, PortError};
use crate::irq::Irq;
use crate::mem::DriverMem;
use crate::sock_pair::CapToken;
use crate::virtqueue::{HeadDesc, QueueConfig, QueueObserver, Virtqueue};

/// Queue indices
pub const RX_QUEUE: usize = 0;
pub const TX_QUEUE: usize = 1;
pub const NUM_QUEUES: usize = 2;

/// Size of the per-packet header (virtio 1.0 layout, num_buffers included)
pub const VIRTIO_NET_HDR_SIZE: usize = 12;

/// Offset of `num_buffers` inside the header
pub const VIRTIO_NET_HDR_NUM_BUFFERS: u64 = 10;

/// Feature bits, word 0
pub const VIRTIO_NET_F_CSUM: u32 = 1 << 0;
pub const VIRTIO_NET_F_GUEST_CSUM: u32 = 1 << 1;
pub const VIRTIO_NET_F_GSO: u32 = 1 << 6;
pub const VIRTIO_NET_F_GUEST_TSO4: u32 = 1 << 7;
pub const VIRTIO_NET_F_GUEST_TSO6: u32 = 1 << 8;
pub const VIRTIO_NET_F_GUEST_ECN: u32 = 1 << 9;
pub const VIRTIO_NET_F_GUEST_UFO: u32 = 1 << 10;
pub const VIRTIO_NET_F_HOST_TSO4: u32 = 1 << 11;
pub const VIRTIO_NET_F_HOST_TSO6: u32 = 1 << 12;
pub const VIRTIO_NET_F_HOST_ECN: u32 = 1 << 13;
pub const VIRTIO_NET_F_HOST_UFO: u32 = 1 << 14;
pub const VIRTIO_NET_F_MRG_RXBUF: u32 = 1 << 15;
pub const VIRTIO_F_RING_INDIRECT_DESC: u32 = 1 << 28;

/// Feature bits, word 1
pub const VIRTIO_F_VERSION_1: u32 = 1 << 0;

/// Segmentation offload is not implemented by the copy engine.
pub const FULL_SEGMENTATION_OFFLOAD: bool = false;

/// Device status bits
pub const STATUS_ACKNOWLEDGE: u8 = 1;
pub const STATUS_DRIVER: u8 = 2;
pub const STATUS_DRIVER_OK: u8 = 4;
pub const STATUS_FEATURES_OK: u8 = 8;
pub const STATUS_NEEDS_RESET: u8 = 0x40;
pub const STATUS_FAILED: u8 = 0x80;

/// Virtio-net header flags
pub const VIRTIO_NET_HDR_F_NEEDS_CSUM: u8 = 1;
pub const VIRTIO_NET_HDR_F_DATA_VALID: u8 = 2;

/// Virtio net header
#[repr(C)]
#[derive(Clone, Copy, Default, Debug)]
pub struct VirtioNetHdr {
    pub flags: u8,
    pub gso_type: u8,
    pub hdr_len: Le16,
    pub gso_size: Le16,
    pub csum_start: Le16,
    pub csum_offset: Le16,
    pub num_buffers: Le16,
}

// SAFETY: VirtioNetHdr contains only POD types
unsafe impl ByteValued for VirtioNetHdr {}

impl VirtioNetHdr {
    pub fn needs_csum(&self) -> bool {
        self.flags & VIRTIO_NET_HDR_F_NEEDS_CSUM != 0
    }

    pub fn csum_start(&self) -> u16 {
        u16::from(self.csum_start)
    }

    pub fn csum_offset(&self) -> u16 {
        u16::from(self.csum_offset)
    }

    pub fn num_buffers(&self) -> u16 {
        u16::from(self.num_buffers)
    }
}

/// Negotiated feature word 0
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Features(u32);

impl Features {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn csum(&self) -> bool {
        self.0 & VIRTIO_NET_F_CSUM != 0
    }

    pub fn guest_csum(&self) -> bool {
        self.0 & VIRTIO_NET_F_GUEST_CSUM != 0
    }

    pub fn mrg_rxbuf(&self) -> bool {
        self.0 & VIRTIO_NET_F_MRG_RXBUF != 0
    }

    pub fn ring_indirect_desc(&self) -> bool {
        self.0 & VIRTIO_F_RING_INDIRECT_DESC != 0
    }
}

/// Features the switch offers in feature word `word`.
pub fn host_features(word: u32) -> u32 {
    match word {
        0 => {
            let mut f = VIRTIO_NET_F_CSUM
                | VIRTIO_NET_F_GUEST_CSUM
                | VIRTIO_NET_F_MRG_RXBUF
                | VIRTIO_F_RING_INDIRECT_DESC;
            if FULL_SEGMENTATION_OFFLOAD {
                f |= VIRTIO_NET_F_GSO
                    | VIRTIO_NET_F_GUEST_TSO4
                    | VIRTIO_NET_F_GUEST_TSO6
                    | VIRTIO_NET_F_GUEST_ECN
                    | VIRTIO_NET_F_GUEST_UFO
                    | VIRTIO_NET_F_HOST_TSO4
                    | VIRTIO_NET_F_HOST_TSO6
                    | VIRTIO_NET_F_HOST_ECN
                    | VIRTIO_NET_F_HOST_UFO;
            }
            f
        }
        1 => VIRTIO_F_VERSION_1,
        _ => 0,
    }
}

/// Per-port packet counters
#[derive(Debug, Default)]
pub struct PortStats {
    pub tx_packets: AtomicU64,
    pub rx_packets: AtomicU64,
    pub dropped: AtomicU64,
    pub irqs: AtomicU64,
}

/// Point-in-time copy of `PortStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub tx_packets: u64,
    pub rx_packets: u64,
    pub dropped: u64,
    pub irqs: u64,
}

impl PortStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            irqs: self.irqs.load(Ordering::Relaxed),
        }
    }

    pub fn inc_tx(&self) {
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rx(&self) {
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }
}

/// Raises the guest IRQ when a queue's used index advanced.
struct GuestNotifier {
    port: usize,
    irq: Option<Box<dyn Irq>>,
    stats: Arc<PortStats>,
}

impl QueueObserver for GuestNotifier {
    fn notify_queue(&self, queue: &Virtqueue, mem: &GuestMemoryMmap) {
        if queue.no_notify_guest(mem) {
            return;
        }

        let Some(irq) = &self.irq else {
            return;
        };
        match irq.trigger() {
            Ok(()) => {
                self.stats.irqs.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!(port = self.port, error = %e, "failed to trigger guest irq"),
        }
    }
}

/// Device state of one switch port
pub struct VirtioNet {
    id: usize,
    vq_max: u16,
    status: u8,
    guest_features: [u32; 2],
    queue_config: [QueueConfig; NUM_QUEUES],
    queues: [Virtqueue; NUM_QUEUES],
    mem: DriverMem,
    notifier: GuestNotifier,
    host_irq: Option<Arc<dyn Irq>>,
    client: Option<Weak<CapToken>>,
    stats: Arc<PortStats>,
}

impl VirtioNet {
    pub fn new(id: usize, vq_max: u16) -> Self {
        let stats = Arc::new(PortStats::default());
        Self {
            id,
            vq_max,
            status: 0,
            guest_features: [0; 2],
            queue_config: [QueueConfig::default(); NUM_QUEUES],
            queues: [Virtqueue::new(), Virtqueue::new()],
            mem: DriverMem::new(0),
            notifier: GuestNotifier {
                port: id,
                irq: None,
                stats: stats.clone(),
            },
            host_irq: None,
            client: None,
            stats,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// No client is bound to this port.
    pub fn available(&self) -> bool {
        self.client.is_none()
    }

    /// The bound client still holds its capability.
    pub fn client_alive(&self) -> bool {
        self.client.as_ref().is_some_and(|c| c.strong_count() > 0)
    }

    /// `token` is the capability this port was handed out with.
    pub fn owned_by(&self, token: &Arc<CapToken>) -> bool {
        self.client
            .as_ref()
            .is_some_and(|c| std::ptr::eq(c.as_ptr(), Arc::as_ptr(token)))
    }

    /// Bind a freshly connected client.
    pub fn register_client(&mut self, token: &Arc<CapToken>, num_ds: usize, host_irq: Arc<dyn Irq>) {
        self.reset();
        self.mem.reset(num_ds);
        self.host_irq = Some(host_irq);
        self.client = Some(Arc::downgrade(token));
        info!(port = self.id, num_ds, "client registered");
    }

    /// Release everything the client bound and return to defaults.
    pub fn unregister_client(&mut self) {
        self.reset();
        self.mem.reset(0);
        self.notifier.irq = None;
        self.host_irq = None;
        self.client = None;
        info!(port = self.id, "client unregistered");
    }

    /// Device reset: disables both queues and forgets the negotiation.
    pub fn reset(&mut self) {
        for q in &mut self.queues {
            q.disable();
        }
        self.queue_config = [QueueConfig::default(); NUM_QUEUES];
        self.guest_features = [0; 2];
        self.status = 0;
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    /// Driver is up and the device did not fail.
    pub fn running(&self) -> bool {
        self.status & STATUS_DRIVER_OK != 0 && self.status & STATUS_FAILED == 0
    }

    /// Apply a driver status write.
    ///
    /// Returns true if the write reset the device.
    pub fn set_status(&mut self, status: u8) -> bool {
        if status == 0 {
            debug!(port = self.id, "device reset by driver");
            self.reset();
            return true;
        }

        let mut status = status & !STATUS_NEEDS_RESET;
        let new = status & !self.status;

        if new & STATUS_FEATURES_OK != 0 && !self.features_acceptable() {
            status &= !STATUS_FEATURES_OK;
        }

        self.status = status | (self.status & STATUS_NEEDS_RESET);

        if new & STATUS_DRIVER_OK != 0 && self.status & STATUS_FAILED == 0 {
            if self.check_queues() {
                info!(port = self.id, features = self.guest_features[0], "device running");
            } else {
                self.status |= STATUS_FAILED;
            }
        }
        false
    }

    /// The header layout is only known for virtio 1.0 drivers, so a driver
    /// that does not accept `VERSION_1` is refused.
    fn features_acceptable(&self) -> bool {
        if !(0..2u32).all(|w| self.guest_features[w as usize] & !host_features(w) == 0) {
            warn!(port = self.id, "driver enabled features that were never offered");
            return false;
        }
        if self.guest_features[1] & VIRTIO_F_VERSION_1 == 0 {
            warn!(port = self.id, "legacy driver without VIRTIO_F_VERSION_1");
            return false;
        }
        true
    }

    /// Both queues are usable and the negotiation is consistent.
    ///
    /// On failure the device is reset and not serviced further.
    pub fn check_queues(&mut self) -> bool {
        if !self.queues.iter().all(Virtqueue::ready) {
            warn!(port = self.id, "driver ok without both queues set up");
            self.reset();
            return false;
        }

        if !self.features_acceptable() {
            self.reset();
            return false;
        }

        true
    }

    /// Rebuild queue `idx` from its stored configuration.
    pub fn reconfig_queue(&mut self, idx: usize) -> Result<(), PortError> {
        let config = *self
            .queue_config
            .get(idx)
            .ok_or(PortError::QueueIndex(idx as u32))?;

        if self.queues[idx].setup(self.mem.memory(), &config, self.vq_max) {
            debug!(port = self.id, queue = idx, num = config.num, "queue configured");
            Ok(())
        } else {
            warn!(port = self.id, queue = idx, ?config, "queue configuration rejected");
            Err(PortError::InvalidQueue(idx as u32))
        }
    }

    pub fn set_queue(&mut self, idx: usize, config: QueueConfig) -> Result<(), PortError> {
        let slot = self
            .queue_config
            .get_mut(idx)
            .ok_or(PortError::QueueIndex(idx as u32))?;
        *slot = config;
        self.reconfig_queue(idx)
    }

    pub fn set_guest_features(&mut self, word: u32, value: u32) -> Result<(), PortError> {
        let slot = self
            .guest_features
            .get_mut(word as usize)
            .ok_or(PortError::FeatureWord(word))?;
        *slot = value;
        Ok(())
    }

    /// Features the driver enabled, restricted to what we offered.
    pub fn enabled_features(&self) -> Features {
        Features(self.guest_features[0] & host_features(0))
    }

    pub fn set_guest_irq(&mut self, irq: Box<dyn Irq>) {
        self.notifier.irq = Some(irq);
    }

    pub fn host_irq(&self) -> Option<Arc<dyn Irq>> {
        self.host_irq.clone()
    }

    pub fn add_mem_region(&mut self, region: Arc<GuestRegionMmap>) -> Result<(), PortError> {
        self.mem.add_region(region)
    }

    /// A guest protocol error on `queue`.
    ///
    /// Only the faulting queue stops; the device asks the driver for a reset.
    pub fn device_error(&mut self, queue: usize, err: BadDescriptor) {
        error!(port = self.id, queue, error = %err, "bad descriptor, queue disabled");
        self.status |= STATUS_NEEDS_RESET;
        if let Some(q) = self.queues.get_mut(queue) {
            q.disable();
        }
    }

    pub fn stats(&self) -> &Arc<PortStats> {
        &self.stats
    }

    pub fn memory(&self) -> &GuestMemoryMmap {
        self.mem.memory()
    }

    pub fn queue(&self, q: usize) -> &Virtqueue {
        &self.queues[q]
    }

    pub fn queue_ready(&self, q: usize) -> bool {
        self.running() && self.queues[q].ready()
    }

    pub fn desc_avail(&self, q: usize) -> bool {
        self.queue_ready(q) && self.queues[q].desc_avail(self.mem.memory())
    }

    pub fn next_avail(&mut self, q: usize) -> Result<Option<HeadDesc>, BadDescriptor> {
        if !self.queue_ready(q) {
            return Ok(None);
        }
        self.queues[q].next_avail(self.mem.memory())
    }

    pub fn disable_notify(&self, q: usize) {
        if self.queue_ready(q) {
            self.queues[q].disable_notify(self.mem.memory());
        }
    }

    pub fn enable_notify(&self, q: usize) {
        if self.queue_ready(q) {
            self.queues[q].enable_notify(self.mem.memory());
        }
    }

    pub fn consumed_x(&self, q: usize, n: u16, head: &mut Option<HeadDesc>, len: u32) {
        self.queues[q].consumed_x(self.mem.memory(), n, head, len);
    }

    pub fn finish_x(&mut self, q: usize, n: u16) {
        self.queues[q].finish_x(self.mem.memory(), n, &self.notifier);
    }

    pub fn finish(&mut self, q: usize, head: &mut Option<HeadDesc>, len: u32) {
        self.queues[q].finish(self.mem.memory(), head, &self.notifier, len);
    }
}
