//! Single-threaded dispatcher
//!
//! All switch state lives on one thread. Clients and IRQ sources talk to it
//! through an event channel; requests carry a reply channel and block the
//! caller until the dispatcher answered.

use std::io;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use tracing::{debug, info, warn};
use vm_memory::GuestRegionMmap;

use crate::device::StatsSnapshot;
use crate::error::{CreateError, PortError};
use crate::irq::Irq;
use crate::sock_pair::{Arg, NUM_PORTS, PortCap, PortOp, PortReply, SockPair};
use crate::virtqueue::QueueConfig;

/// Everything the dispatcher reacts to
pub enum Event {
    Create {
        ty: u64,
        args: Vec<Arg>,
        reply: Sender<Result<PortCap, CreateError>>,
    },
    Port {
        cap: PortCap,
        op: PortOp,
        reply: Sender<Result<PortReply, PortError>>,
    },
    /// A guest kicked one of its queues
    Kick,
    /// A client dropped a port capability
    CapDeleted,
    Stats {
        reply: Sender<[StatsSnapshot; NUM_PORTS]>,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy)]
enum IrqKind {
    Kick,
    CapDeleted,
}

/// IRQ that turns into a dispatcher event
struct EventIrq {
    kind: IrqKind,
    tx: Sender<Event>,
}

impl Irq for EventIrq {
    fn trigger(&self) -> io::Result<()> {
        let event = match self.kind {
            IrqKind::Kick => Event::Kick,
            IrqKind::CapDeleted => Event::CapDeleted,
        };
        self.tx
            .send(event)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "dispatcher gone"))
    }
}

/// Owner of the switch, run on the dispatcher thread
pub struct Server {
    switch: SockPair,
    rx: Receiver<Event>,
}

impl Server {
    /// Create the switch and the handle clients use to reach it.
    pub fn new(vq_max: u16) -> (Self, SwitchHandle) {
        let (tx, rx) = unbounded();
        let host_irq: Arc<dyn Irq> = Arc::new(EventIrq {
            kind: IrqKind::Kick,
            tx: tx.clone(),
        });
        let del_irq: Arc<dyn Irq> = Arc::new(EventIrq {
            kind: IrqKind::CapDeleted,
            tx: tx.clone(),
        });

        let server = Server {
            switch: SockPair::new(vq_max, host_irq, del_irq),
            rx,
        };
        (server, SwitchHandle { tx })
    }

    /// Handle one event. Returns false on shutdown.
    pub fn handle(&mut self, event: Event) -> bool {
        match event {
            Event::Create { ty, args, reply } => {
                let result = self.switch.op_create(ty, &args);
                if let Err(e) = &result {
                    warn!(error = %e, "create failed");
                }
                let _ = reply.send(result);
            }
            Event::Port { cap, op, reply } => {
                let result = self.switch.port_op(&cap, op);
                if let Err(e) = &result {
                    debug!(port = cap.port(), error = %e, "port operation failed");
                }
                let _ = reply.send(result);
            }
            Event::Kick => self.switch.kick(),
            Event::CapDeleted => {
                self.switch.reclaim_clients();
            }
            Event::Stats { reply } => {
                let _ = reply.send(self.switch.stats());
            }
            Event::Shutdown => return false,
        }
        true
    }

    /// Serve events until shutdown or until every sender is gone.
    pub fn run(mut self) {
        info!("dispatcher running");
        while let Ok(event) = self.rx.recv() {
            if !self.handle(event) {
                break;
            }
        }
        info!("dispatcher stopped");
    }
}

/// Client side access to the dispatcher
#[derive(Clone)]
pub struct SwitchHandle {
    tx: Sender<Event>,
}

impl SwitchHandle {
    /// Ask for a port, announcing `num_ds` memory regions.
    pub fn create(&self, num_ds: i64) -> Result<PortClient, CreateError> {
        let (reply, result) = bounded(1);
        self.tx
            .send(Event::Create {
                ty: 0,
                args: vec![Arg::Int(num_ds)],
                reply,
            })
            .map_err(|_| CreateError::Disconnected)?;
        let cap = result.recv().map_err(|_| CreateError::Disconnected)??;

        Ok(PortClient {
            cap,
            tx: self.tx.clone(),
        })
    }

    pub fn stats(&self) -> Option<[StatsSnapshot; NUM_PORTS]> {
        let (reply, result) = bounded(1);
        self.tx.send(Event::Stats { reply }).ok()?;
        result.recv().ok()
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Event::Shutdown);
    }
}

/// A connected port, as seen by its client
pub struct PortClient {
    cap: PortCap,
    tx: Sender<Event>,
}

impl PortClient {
    pub fn port(&self) -> usize {
        self.cap.port()
    }

    pub fn op(&self, op: PortOp) -> Result<PortReply, PortError> {
        let (reply, result) = bounded(1);
        self.tx
            .send(Event::Port {
                cap: self.cap.clone(),
                op,
                reply,
            })
            .map_err(|_| PortError::Disconnected)?;
        result.recv().map_err(|_| PortError::Disconnected)?
    }

    pub fn add_mem_region(&self, region: Arc<GuestRegionMmap>) -> Result<(), PortError> {
        self.op(PortOp::AddMemRegion(region)).map(|_| ())
    }

    pub fn set_guest_irq(&self, irq: Box<dyn Irq>) -> Result<(), PortError> {
        self.op(PortOp::SetGuestIrq(irq)).map(|_| ())
    }

    pub fn host_features(&self, word: u32) -> Result<u32, PortError> {
        match self.op(PortOp::HostFeatures(word))? {
            PortReply::Features(f) => Ok(f),
            _ => Err(PortError::Disconnected),
        }
    }

    pub fn set_guest_features(&self, word: u32, value: u32) -> Result<(), PortError> {
        self.op(PortOp::SetGuestFeatures { word, value }).map(|_| ())
    }

    pub fn set_queue(&self, index: u32, config: QueueConfig) -> Result<(), PortError> {
        self.op(PortOp::SetQueue { index, config }).map(|_| ())
    }

    pub fn set_status(&self, status: u8) -> Result<u8, PortError> {
        match self.op(PortOp::SetStatus(status))? {
            PortReply::Status(s) => Ok(s),
            _ => Err(PortError::Disconnected),
        }
    }

    pub fn status(&self) -> Result<u8, PortError> {
        match self.op(PortOp::Status)? {
            PortReply::Status(s) => Ok(s),
            _ => Err(PortError::Disconnected),
        }
    }

    /// The IRQ to trigger after making buffers available.
    pub fn notify_irq(&self) -> Result<Arc<dyn Irq>, PortError> {
        match self.op(PortOp::DeviceNotifyIrq)? {
            PortReply::Irq(irq) => Ok(irq),
            _ => Err(PortError::Disconnected),
        }
    }

    pub fn stats(&self) -> Result<StatsSnapshot, PortError> {
        match self.op(PortOp::Stats)? {
            PortReply::Stats(s) => Ok(s),
            _ => Err(PortError::Disconnected),
        }
    }
}
