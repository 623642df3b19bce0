//! Virtio 1.x: the split virtqueue and the virtio-net driver.

pub mod net;
pub mod queue;
pub mod transport;

use thiserror::Error;

pub use net::{IrqMode, VirtioNet};
pub use queue::{SgElem, Virtqueue};
pub use transport::{MmioTransport, Transport};

// Device-independent feature bits.
pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;

// virtio-net feature bits.
pub const VIRTIO_NET_F_CSUM: u64 = 1 << 0;
pub const VIRTIO_NET_F_MAC: u64 = 1 << 5;
pub const VIRTIO_NET_F_STATUS: u64 = 1 << 16;
pub const VIRTIO_NET_F_CTRL_VQ: u64 = 1 << 17;

/// Device status register bits, written in negotiation order.
pub mod status {
    pub const ACKNOWLEDGE: u8 = 1;
    pub const DRIVER: u8 = 2;
    pub const DRIVER_OK: u8 = 4;
    pub const FEATURES_OK: u8 = 8;
    pub const NEEDS_RESET: u8 = 64;
    pub const FAILED: u8 = 128;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VirtioError {
    #[error("device does not offer VIRTIO_F_VERSION_1")]
    MissingVersion1,
    #[error("device rejected our feature selection")]
    FeaturesRejected,
    #[error("queue size {0} is not a power of two")]
    BadQueueSize(u16),
    #[error("queue {0} unavailable on this device")]
    QueueUnavailable(u16),
    #[error("not a virtio-mmio device")]
    BadMagic,
}
