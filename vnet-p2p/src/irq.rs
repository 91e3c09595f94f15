//! Notification primitives
//!
//! The switch talks to its clients through three kinds of edge-triggered
//! notifications: the guest IRQ (used ring advanced), the shared host IRQ
//! (a guest kicked one of its queues) and the capability-deletion IRQ (a
//! client dropped its port capability).

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use vmm_sys_util::eventfd::EventFd;

/// An edge-triggered notification sink.
pub trait Irq: Send + Sync {
    fn trigger(&self) -> io::Result<()>;
}

impl<T: Irq + ?Sized> Irq for Arc<T> {
    fn trigger(&self) -> io::Result<()> {
        (**self).trigger()
    }
}

impl Irq for EventFd {
    fn trigger(&self) -> io::Result<()> {
        self.write(1)
    }
}

/// Irq that only counts how often it fired.
///
/// Useful where nobody waits on the notification, e.g. tests driving the
/// switch synchronously.
#[derive(Debug, Default)]
pub struct CountingIrq {
    count: AtomicU64,
}

impl CountingIrq {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    /// Return the count and reset it to zero.
    pub fn take(&self) -> u64 {
        self.count.swap(0, Ordering::AcqRel)
    }
}

impl Irq for CountingIrq {
    fn trigger(&self) -> io::Result<()> {
        self.count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmm_sys_util::eventfd::EFD_NONBLOCK;

    #[test]
    fn test_eventfd_irq_accumulates() {
        let fd = EventFd::new(EFD_NONBLOCK).expect("eventfd");
        fd.trigger().expect("trigger");
        fd.trigger().expect("trigger");
        assert_eq!(fd.read().expect("read"), 2);
    }

    #[test]
    fn test_counting_irq() {
        let irq = CountingIrq::new();
        irq.trigger().unwrap();
        assert_eq!(irq.count(), 1);
        assert_eq!(irq.take(), 1);
        assert_eq!(irq.count(), 0);
    }
}
