//! Test doubles shared by unit and integration tests: a device-side
//! virtqueue model, paired in-memory NICs, and raw packet builders.

pub mod channel_nic;
pub mod packets;
pub mod virtio_device;

pub use channel_nic::{ChannelNic, channel_pair};
