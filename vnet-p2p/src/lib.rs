pub mod checksum;
pub mod config;
pub mod device;
pub mod error;
pub mod irq;
pub mod mem;
pub mod pipe;
pub mod server;
pub mod sock_pair;
pub mod test_util;
pub mod virtqueue;
