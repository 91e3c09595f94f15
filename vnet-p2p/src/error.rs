//! Error types for the forwarding engine and its control surface

use nix::errno::Errno;
use thiserror::Error;

/// A guest handed us a descriptor chain we refuse to walk.
///
/// These are guest protocol errors, never host bugs: they are caught per
/// `Pipe::copy()` call and scoped to the offending port.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BadDescriptor {
    #[error("descriptor range {addr:#x}+{len} is outside the registered memory")]
    BadAddress { addr: u64, len: u32 },

    #[error("descriptor direction does not match the queue")]
    BadRights,

    #[error("invalid descriptor flags")]
    BadFlags,

    #[error("descriptor index {index} out of range or chain loops")]
    BadNext { index: u16 },

    #[error("invalid indirect table size {len}")]
    BadSize { len: u32 },

    #[error("avail index {avail} runs too far ahead of {next}")]
    BadIndex { avail: u16, next: u16 },

    #[error("advanced to the next descriptor with bytes left in the current one")]
    Unconsumed,
}

/// Errors returned by `SockPair::op_create`.
#[derive(Debug, Error)]
pub enum CreateError {
    #[error("unsupported object type {0}")]
    UnsupportedType(u64),

    #[error("expected a single integer argument")]
    InvalidArgs,

    #[error("invalid number of memory regions {0} (must be 1..=80)")]
    InvalidRegionCount(i64),

    #[error("both ports are in use")]
    NoFreePort,

    #[error("switch is not running")]
    Disconnected,
}

impl CreateError {
    /// Negative errno as reported over the factory protocol.
    pub fn errno(&self) -> i32 {
        match self {
            CreateError::NoFreePort => -(Errno::ENOMEM as i32),
            CreateError::Disconnected => -(Errno::EIO as i32),
            _ => -(Errno::EINVAL as i32),
        }
    }
}

/// Errors returned by per-port transport operations.
#[derive(Debug, Error)]
pub enum PortError {
    #[error("capability does not refer to a bound port")]
    InvalidCapability,

    #[error("queue index {0} out of range")]
    QueueIndex(u32),

    #[error("queue {0} configuration rejected")]
    InvalidQueue(u32),

    #[error("feature word {0} out of range")]
    FeatureWord(u32),

    #[error("client registered more memory regions than announced")]
    TooManyRegions,

    #[error("memory region error: {0}")]
    Memory(String),

    #[error("switch is not running")]
    Disconnected,
}

impl PortError {
    pub fn errno(&self) -> i32 {
        let e = match self {
            PortError::InvalidCapability => Errno::EPERM,
            PortError::QueueIndex(_) | PortError::FeatureWord(_) => Errno::ERANGE,
            PortError::TooManyRegions => Errno::ENOMEM,
            PortError::Disconnected => Errno::EIO,
            PortError::InvalidQueue(_) | PortError::Memory(_) => Errno::EINVAL,
        };
        -(e as i32)
    }
}
