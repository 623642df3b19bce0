//! A single-address-space TCP/IPv4 stack over virtio-net.
//!
//! The stack is single-threaded and cooperative: every layer is owned by a
//! per-instance [`stack::Stack`] and driven by `poll(now)` with an explicit
//! monotonic clock. There is no global state; tests run several stacks side
//! by side over in-memory NICs.
//!
//! Layering, bottom up:
//! - [`buffer`]: fixed-size frame pool and the `Frame` ownership model
//! - [`virtio`]: split virtqueues and the virtio-net driver
//! - [`ethernet`] / [`vlan`]: link layer framing and demux
//! - [`arp`]: address resolution with packet buffering
//! - [`ip4`]: IPv4 with bounded fragment reassembly
//! - [`icmp`] / [`udp`] / [`tcp`]: transports; TCP carries the full
//!   RFC 793 state machine, write queue and retransmission engine

pub mod arp;
pub mod buffer;
pub mod config;
pub mod ethernet;
pub mod icmp;
pub mod ip4;
pub mod nic;
pub mod stack;
pub mod tcp;
pub mod test_util;
pub mod timer;
pub mod udp;
pub mod virtio;
pub mod vlan;

pub use buffer::{BufferPool, Frame};
pub use nic::Nic;
pub use stack::{Stack, StackConfig, StackStats};
pub use tcp::{Connection, DisconnectReason, Listener, Socket, State};
