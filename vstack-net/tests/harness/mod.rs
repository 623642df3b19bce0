//! Shared two-stack test network: paired in-memory NICs and a manual
//! clock.
#![allow(dead_code)]

use std::sync::Once;

use smoltcp::time::{Duration, Instant};
use smoltcp::wire::{EthernetAddress, Ipv4Address};

use vstack_net::buffer::{BUFFER_SIZE, BufferPool};
use vstack_net::config::TcpConfig;
use vstack_net::stack::{Stack, StackConfig};
use vstack_net::test_util::{ChannelNic, channel_pair};

static TRACING: Once = Once::new();

/// Route stack tracing into the test output; `RUST_LOG` selects the level.
fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub const MAC_A: EthernetAddress = EthernetAddress([0x52, 0x54, 0, 0, 0, 0x0a]);
pub const MAC_B: EthernetAddress = EthernetAddress([0x52, 0x54, 0, 0, 0, 0x0b]);

pub fn ip_a() -> Ipv4Address {
    Ipv4Address::new(10, 0, 0, 1)
}

pub fn ip_b() -> Ipv4Address {
    Ipv4Address::new(10, 0, 0, 2)
}

pub struct TestNet {
    pub a: Stack<ChannelNic>,
    pub b: Stack<ChannelNic>,
    pub now: Instant,
}

impl TestNet {
    pub fn new() -> Self {
        Self::with_tcp(TcpConfig::default(), TcpConfig::default())
    }

    pub fn with_tcp(tcp_a: TcpConfig, tcp_b: TcpConfig) -> Self {
        init_tracing();
        let (nic_a, nic_b) = channel_pair(MAC_A, MAC_B);
        let a = Stack::new(
            nic_a,
            BufferPool::new(128, BUFFER_SIZE),
            StackConfig::new(ip_a(), 24).tcp(tcp_a.seed(0xa)),
        );
        let b = Stack::new(
            nic_b,
            BufferPool::new(128, BUFFER_SIZE),
            StackConfig::new(ip_b(), 24).tcp(tcp_b.seed(0xb)),
        );
        TestNet { a, b, now: Instant::from_millis(0) }
    }

    /// One scheduling round on both stacks, advancing the clock a
    /// millisecond.
    pub fn tick(&mut self) {
        self.a.poll(self.now);
        self.b.poll(self.now);
        self.now += Duration::from_millis(1);
    }

    /// Enough rounds for any in-flight exchange (and a delayed ACK) to
    /// complete, well short of the first retransmission timeout.
    pub fn settle(&mut self) {
        for _ in 0..64 {
            self.tick();
        }
    }

    /// Walk the clock forward in steps, polling as it goes.
    pub fn run_for(&mut self, total: Duration, step: Duration) {
        let deadline = self.now + total;
        while self.now < deadline {
            self.now += step;
            self.a.poll(self.now);
            self.b.poll(self.now);
            self.a.poll(self.now);
            self.b.poll(self.now);
        }
    }
}
