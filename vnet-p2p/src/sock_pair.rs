//! The two-port switch
//!
//! `SockPair` owns both ports and both pipes. It hands ports out to clients
//! (`op_create`), routes their transport operations (`port_op`), runs the
//! copy engine when a guest kicks (`kick`) and takes ports back from clients
//! that went away (`reclaim_clients`).

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};

use tracing::{debug, info, trace, warn};
use vm_memory::GuestRegionMmap;

use crate::device::{StatsSnapshot, VirtioNet, host_features};
use crate::error::{CreateError, PortError};
use crate::irq::Irq;
use crate::pipe::Pipe;
use crate::virtqueue::QueueConfig;

/// Number of switch ports
pub const NUM_PORTS: usize = 2;

/// Bounds on the number of memory regions a client may announce
pub const MIN_MEM_REGIONS: i64 = 1;
pub const MAX_MEM_REGIONS: i64 = 80;

/// Argument of a factory call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Int(i64),
    Str(String),
}

/// Liveness token of a bound port.
///
/// The client holds it through its `PortCap`s; the port keeps only a weak
/// reference. When the last strong reference goes, the deletion IRQ fires.
pub struct CapToken {
    port: usize,
    del_irq: Arc<dyn Irq>,
}

impl CapToken {
    pub fn new(port: usize, del_irq: Arc<dyn Irq>) -> Self {
        Self { port, del_irq }
    }

    pub fn port(&self) -> usize {
        self.port
    }
}

impl fmt::Debug for CapToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapToken").field("port", &self.port).finish()
    }
}

impl Drop for CapToken {
    fn drop(&mut self) {
        if let Err(e) = self.del_irq.trigger() {
            warn!(port = self.port, error = %e, "failed to signal capability deletion");
        }
    }
}

/// Capability to one port, returned by `op_create`.
#[derive(Debug, Clone)]
pub struct PortCap {
    port: usize,
    token: Arc<CapToken>,
}

impl PortCap {
    pub fn port(&self) -> usize {
        self.port
    }
}

/// Transport operation on a port
pub enum PortOp {
    /// Share a guest memory region with the switch
    AddMemRegion(Arc<GuestRegionMmap>),
    /// Register the IRQ the switch raises for used buffers
    SetGuestIrq(Box<dyn Irq>),
    /// Read a word of the offered features
    HostFeatures(u32),
    SetGuestFeatures { word: u32, value: u32 },
    SetQueue { index: u32, config: QueueConfig },
    SetStatus(u8),
    Status,
    /// Get the IRQ that kicks the switch
    DeviceNotifyIrq,
    Stats,
}

impl fmt::Debug for PortOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortOp::AddMemRegion(_) => f.write_str("AddMemRegion"),
            PortOp::SetGuestIrq(_) => f.write_str("SetGuestIrq"),
            PortOp::HostFeatures(w) => f.debug_tuple("HostFeatures").field(w).finish(),
            PortOp::SetGuestFeatures { word, value } => f
                .debug_struct("SetGuestFeatures")
                .field("word", word)
                .field("value", value)
                .finish(),
            PortOp::SetQueue { index, config } => f
                .debug_struct("SetQueue")
                .field("index", index)
                .field("config", config)
                .finish(),
            PortOp::SetStatus(s) => f.debug_tuple("SetStatus").field(s).finish(),
            PortOp::Status => f.write_str("Status"),
            PortOp::DeviceNotifyIrq => f.write_str("DeviceNotifyIrq"),
            PortOp::Stats => f.write_str("Stats"),
        }
    }
}

/// Result of a `PortOp`
pub enum PortReply {
    Done,
    Features(u32),
    Status(u8),
    Irq(Arc<dyn Irq>),
    Stats(StatsSnapshot),
}

impl fmt::Debug for PortReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortReply::Done => f.write_str("Done"),
            PortReply::Features(v) => f.debug_tuple("Features").field(v).finish(),
            PortReply::Status(v) => f.debug_tuple("Status").field(v).finish(),
            PortReply::Irq(_) => f.write_str("Irq"),
            PortReply::Stats(s) => f.debug_tuple("Stats").field(s).finish(),
        }
    }
}

/// Two ports linked by two pipes
pub struct SockPair {
    ports: [VirtioNet; NUM_PORTS],
    pipes: [Pipe; NUM_PORTS],
    host_irq: Arc<dyn Irq>,
    del_irq: Arc<dyn Irq>,
}

impl SockPair {
    /// `host_irq` is what guests trigger to kick the switch, `del_irq` fires
    /// whenever a client drops its last port capability.
    pub fn new(vq_max: u16, host_irq: Arc<dyn Irq>, del_irq: Arc<dyn Irq>) -> Self {
        info!(vq_max, "switch created");
        Self {
            ports: [VirtioNet::new(0, vq_max), VirtioNet::new(1, vq_max)],
            pipes: [Pipe::new(0, 1), Pipe::new(1, 0)],
            host_irq,
            del_irq,
        }
    }

    /// Factory entry point: bind a free port to a new client.
    ///
    /// `ty` must be 0 and `args` a single integer, the number of memory
    /// regions the client will share.
    pub fn op_create(&mut self, ty: u64, args: &[Arg]) -> Result<PortCap, CreateError> {
        if ty != 0 {
            return Err(CreateError::UnsupportedType(ty));
        }

        let [Arg::Int(num_ds)] = args else {
            return Err(CreateError::InvalidArgs);
        };
        let num_ds = *num_ds;
        if !(MIN_MEM_REGIONS..=MAX_MEM_REGIONS).contains(&num_ds) {
            return Err(CreateError::InvalidRegionCount(num_ds));
        }

        let id = self
            .ports
            .iter()
            .position(VirtioNet::available)
            .ok_or(CreateError::NoFreePort)?;

        let token = Arc::new(CapToken::new(id, self.del_irq.clone()));
        self.ports[id].register_client(&token, num_ds as usize, self.host_irq.clone());

        Ok(PortCap { port: id, token })
    }

    /// Run one transport operation for the holder of `cap`.
    pub fn port_op(&mut self, cap: &PortCap, op: PortOp) -> Result<PortReply, PortError> {
        let id = cap.port;
        let port = self
            .ports
            .get_mut(id)
            .filter(|p| p.owned_by(&cap.token))
            .ok_or(PortError::InvalidCapability)?;

        debug!(port = id, ?op, "port operation");

        match op {
            PortOp::AddMemRegion(region) => port.add_mem_region(region).map(|_| PortReply::Done),
            PortOp::SetGuestIrq(irq) => {
                port.set_guest_irq(irq);
                Ok(PortReply::Done)
            }
            PortOp::HostFeatures(word) => Ok(PortReply::Features(host_features(word))),
            PortOp::SetGuestFeatures { word, value } => port
                .set_guest_features(word, value)
                .map(|_| PortReply::Done),
            PortOp::SetQueue { index, config } => port
                .set_queue(index as usize, config)
                .map(|_| PortReply::Done),
            PortOp::SetStatus(status) => {
                let was_running = port.running();
                if port.set_status(status) {
                    self.drop_port_state(id);
                } else if !was_running && self.ports[id].running() {
                    // Traffic may have been waiting for this port
                    self.kick();
                }
                Ok(PortReply::Status(self.ports[id].status()))
            }
            PortOp::Status => Ok(PortReply::Status(port.status())),
            PortOp::DeviceNotifyIrq => port
                .host_irq()
                .map(PortReply::Irq)
                .ok_or(PortError::InvalidCapability),
            PortOp::Stats => Ok(PortReply::Stats(port.stats().snapshot())),
        }
    }

    fn drop_port_state(&mut self, id: usize) {
        for pipe in &mut self.pipes {
            pipe.drop_port(&mut self.ports, id);
        }
    }

    /// Forward until neither direction can make progress.
    ///
    /// Guest notifications are off while draining. After turning them back
    /// on, both pipes are checked once more: a descriptor added between the
    /// last drain and the re-enable would otherwise never be kicked for.
    pub fn kick(&mut self) {
        loop {
            for pipe in &self.pipes {
                pipe.disable_notify(&self.ports);
            }

            loop {
                let mut progress = false;
                for pipe in &mut self.pipes {
                    progress |= pipe.copy(&mut self.ports);
                }
                if !progress {
                    break;
                }
            }

            for pipe in &self.pipes {
                pipe.enable_notify(&self.ports);
            }

            // Order the flag writes against the avail index reads below
            fence(Ordering::SeqCst);

            if !self.pipes.iter().any(|p| p.work_pending(&self.ports)) {
                break;
            }
            trace!("work arrived while re-enabling notifications");
        }
    }

    /// Take back ports whose client dropped its capability.
    ///
    /// Returns the number of ports reclaimed.
    pub fn reclaim_clients(&mut self) -> usize {
        let mut reclaimed = 0;
        for id in 0..NUM_PORTS {
            let port = &self.ports[id];
            if port.available() || port.client_alive() {
                continue;
            }

            self.drop_port_state(id);
            self.ports[id].unregister_client();
            info!(port = id, "reclaimed port of disconnected client");
            reclaimed += 1;
        }
        reclaimed
    }

    pub fn port(&self, id: usize) -> Option<&VirtioNet> {
        self.ports.get(id)
    }

    pub fn stats(&self) -> [StatsSnapshot; NUM_PORTS] {
        [
            self.ports[0].stats().snapshot(),
            self.ports[1].stats().snapshot(),
        ]
    }
}
