//! Command line configuration

use clap::Parser;

use crate::virtqueue::MAX_QUEUE_SIZE;

/// Default maximum number of descriptors per virtqueue
pub const DEFAULT_QUEUE_SIZE: u16 = 0x100;

#[derive(Parser, Debug, Clone)]
#[command(version, about = "Point-to-point virtio-net link", long_about = None)]
pub struct Args {
    /// Maximum number of descriptors per virtqueue
    #[arg(
        short,
        long,
        default_value_t = DEFAULT_QUEUE_SIZE,
        value_parser = clap::value_parser!(u16).range(1..=MAX_QUEUE_SIZE as i64)
    )]
    pub size: u16,

    /// Log per-port packet counters every N seconds (0 disables)
    #[arg(long, default_value_t = 0)]
    pub stats_interval: u64,
}
