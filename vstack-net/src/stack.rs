//! The per-stack context: one NIC, one instance of every layer, one timer
//! wheel, no global state. `poll(now)` is the single entry point that
//! drains device RX through the layers, expires timers, flushes pending
//! TCP work and applies transmit backpressure.

use std::collections::VecDeque;

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::time::Instant;
use smoltcp::wire::{IpProtocol, Ipv4Address, Ipv4Cidr};
use tracing::{debug, trace};

use crate::arp::{Arp, ProxyRule};
use crate::buffer::{BufferPool, Frame};
use crate::config::{ArpConfig, TcpConfig};
use crate::ethernet::{EthDispatch, Ethernet, LinkTx};
use crate::icmp::Icmp;
use crate::ip4::{Ip4, IpTx};
use crate::nic::Nic;
use crate::tcp::{Connection, Listener, Socket, Tcp, TcpError};
use crate::timer::{TimerEvent, Timers};
use crate::udp::{Udp, UdpError, UdpSocket};

/// Wire frames queued while the device transmit path is saturated.
const MAX_DEFERRED_TX: usize = 256;

/// Static configuration for one stack instance.
#[derive(Debug, Clone)]
pub struct StackConfig {
    pub addr: Ipv4Cidr,
    pub gateway: Option<Ipv4Address>,
    /// Present the stack as a per-VID virtual interface.
    pub vlan: Option<u16>,
    pub arp: ArpConfig,
    pub tcp: TcpConfig,
}

impl StackConfig {
    pub fn new(addr: Ipv4Address, prefix_len: u8) -> Self {
        StackConfig {
            addr: Ipv4Cidr::new(addr, prefix_len),
            gateway: None,
            vlan: None,
            arp: ArpConfig::default(),
            tcp: TcpConfig::default(),
        }
    }

    pub fn gateway(mut self, gw: Ipv4Address) -> Self {
        self.gateway = Some(gw);
        self
    }

    pub fn vlan(mut self, vid: u16) -> Self {
        self.vlan = Some(vid);
        self
    }

    pub fn tcp(mut self, tcp: TcpConfig) -> Self {
        self.tcp = tcp;
        self
    }

    pub fn arp(mut self, arp: ArpConfig) -> Self {
        self.arp = arp;
        self
    }
}

/// Aggregated per-stack counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct StackStats {
    pub packets_rx: u64,
    pub packets_tx: u64,
    pub packets_dropped: u64,
    pub bytes_sacked: u64,
    pub arp_requests_rx: u64,
    pub arp_requests_tx: u64,
    pub arp_replies_rx: u64,
    pub arp_replies_tx: u64,
}

pub struct Stack<N: Nic> {
    nic: N,
    pool: BufferPool,
    caps: ChecksumCapabilities,
    eth: Ethernet,
    arp: Arp,
    ip4: Ip4,
    icmp: Icmp,
    udp: Udp,
    tcp: Tcp,
    timers: Timers<TimerEvent>,
    deferred_tx: VecDeque<Frame>,
    deferred_dropped: u64,
}

impl<N: Nic> Stack<N> {
    pub fn new(nic: N, pool: BufferPool, cfg: StackConfig) -> Self {
        let mac = nic.mac();
        let addr = cfg.addr.address();
        let eth = match cfg.vlan {
            Some(vid) => Ethernet::with_vlan(mac, vid),
            None => Ethernet::new(mac),
        };
        Stack {
            nic,
            pool,
            caps: ChecksumCapabilities::default(),
            eth,
            arp: Arp::new(cfg.arp, mac, addr),
            ip4: Ip4::new(cfg.addr, cfg.gateway),
            icmp: Icmp::new(),
            udp: Udp::new(),
            tcp: Tcp::new(cfg.tcp, addr),
            timers: Timers::new(),
            deferred_tx: VecDeque::new(),
            deferred_dropped: 0,
        }
    }

    pub fn addr(&self) -> Ipv4Address {
        self.ip4.addr()
    }

    pub fn mac(&self) -> smoltcp::wire::EthernetAddress {
        self.eth.mac()
    }

    /// One cooperative scheduling round: device RX, due timers, pending
    /// transport work, deferred TX.
    pub fn poll(&mut self, now: Instant) {
        while let Some(frame) = self.nic.poll() {
            self.receive_frame(frame, now);
        }

        for event in self.timers.expire(now) {
            self.dispatch_timer(event, now);
        }

        let txs = self.tcp.service(now, &self.pool, &self.caps, &mut self.timers);
        for tx in txs {
            self.transmit_ip(tx, now);
        }

        self.flush_deferred();
    }

    /// When the next timer wants to run; drives the host event loop.
    pub fn poll_at(&mut self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    // ---- user API --------------------------------------------------------

    pub fn tcp_listen(&mut self, port: u16) -> Result<Listener, TcpError> {
        self.tcp.listen(port)
    }

    pub fn tcp_connect(
        &mut self,
        remote: Socket,
        on_connect: impl FnMut(&Connection) + 'static,
    ) -> Result<Connection, TcpError> {
        self.tcp.connect(remote, on_connect)
    }

    pub fn udp_bind(&mut self, port: u16) -> Result<UdpSocket, UdpError> {
        self.udp.bind(port)
    }

    pub fn udp_send(
        &mut self,
        socket: &UdpSocket,
        dst: Socket,
        data: &[u8],
        now: Instant,
    ) -> Result<(), UdpError> {
        let src = Socket::new(self.addr(), socket.port());
        let tx = self.udp.transmit(&self.pool, &self.caps, src, dst, data)?;
        self.transmit_ip(tx, now);
        self.flush_deferred();
        Ok(())
    }

    /// Answer ARP for foreign addresses the rule accepts.
    pub fn set_arp_proxy(&mut self, rule: ProxyRule) {
        self.arp.set_proxy(rule);
    }

    pub fn set_promiscuous(&mut self, enabled: bool) {
        self.eth.set_promiscuous(enabled);
    }

    pub fn stats(&self) -> StackStats {
        let eth = self.eth.counters();
        let arp = self.arp.counters();
        let ip4 = self.ip4.counters();
        let reasm = self.ip4.reassembly_counters();
        let tcp = self.tcp.counters();
        let udp = self.udp.counters();
        let icmp = self.icmp.counters();
        StackStats {
            packets_rx: eth.rx,
            packets_tx: eth.tx,
            packets_dropped: eth.dropped
                + arp.dropped
                + ip4.dropped
                + ip4.no_route
                + reasm.dropped_fragments
                + tcp.dropped
                + udp.dropped
                + icmp.dropped
                + self.deferred_dropped,
            bytes_sacked: tcp.bytes_sacked,
            arp_requests_rx: arp.requests_rx,
            arp_requests_tx: arp.requests_tx,
            arp_replies_rx: arp.replies_rx,
            arp_replies_tx: arp.replies_tx,
        }
    }

    // Layer access for diagnostics and tests.

    pub fn tcp(&mut self) -> &mut Tcp {
        &mut self.tcp
    }

    pub fn arp(&self) -> &Arp {
        &self.arp
    }

    pub fn ip4(&self) -> &Ip4 {
        &self.ip4
    }

    pub fn nic_mut(&mut self) -> &mut N {
        &mut self.nic
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    // ---- internal plumbing ----------------------------------------------

    fn receive_frame(&mut self, frame: Frame, now: Instant) {
        match self.eth.receive(frame) {
            Some(EthDispatch::Arp(frame)) => {
                let out = self.arp.receive(frame, now, &mut self.timers, &self.pool);
                self.send_link(out);
            }
            Some(EthDispatch::Ipv4(frame)) => {
                let Some(delivery) = self.ip4.receive(frame, now, &mut self.timers) else {
                    return;
                };
                match delivery.proto {
                    IpProtocol::Tcp => {
                        let txs = self.tcp.receive(
                            &delivery,
                            now,
                            &self.pool,
                            &self.caps,
                            &mut self.timers,
                        );
                        for tx in txs {
                            self.transmit_ip(tx, now);
                        }
                    }
                    IpProtocol::Udp => self.udp.receive(&delivery, &self.caps),
                    IpProtocol::Icmp => {
                        if let Some(tx) = self.icmp.receive(&delivery, &self.pool, &self.caps) {
                            self.transmit_ip(tx, now);
                        }
                    }
                    proto => {
                        trace!(?proto, "no transport bound for protocol");
                    }
                }
            }
            None => {}
        }
    }

    fn dispatch_timer(&mut self, event: TimerEvent, now: Instant) {
        match event {
            TimerEvent::ArpResolve => {
                let out = self.arp.resolve_tick(now, &mut self.timers, &self.pool);
                self.send_link(out);
            }
            TimerEvent::ArpFlush => self.arp.flush_tick(now, &mut self.timers),
            TimerEvent::ReassemblyExpire => self.ip4.reassembly_tick(now, &mut self.timers),
            TimerEvent::Tcp { flow, kind } => {
                let txs =
                    self.tcp.handle_timer(flow, kind, now, &self.pool, &self.caps, &mut self.timers);
                for tx in txs {
                    self.transmit_ip(tx, now);
                }
            }
        }
    }

    fn transmit_ip(&mut self, tx: IpTx, now: Instant) {
        match self.ip4.transmit(tx, &self.caps) {
            Ok((frame, next_hop)) => {
                let out = self.arp.transmit(frame, next_hop, now, &mut self.timers, &self.pool);
                self.send_link(out);
            }
            Err(err) => debug!(%err, "dropping datagram"),
        }
    }

    fn send_link(&mut self, batch: Vec<LinkTx>) {
        for tx in batch {
            let wire = self.eth.transmit(tx);
            self.enqueue_wire(wire);
        }
    }

    fn enqueue_wire(&mut self, frame: Frame) {
        // Order is preserved: once anything is deferred, everything queues
        // behind it.
        if self.deferred_tx.is_empty() && self.nic.transmit_queue_available() > 0 {
            self.nic.transmit(frame);
        } else if self.deferred_tx.len() < MAX_DEFERRED_TX {
            self.deferred_tx.push_back(frame);
        } else {
            self.deferred_dropped += 1;
        }
    }

    fn flush_deferred(&mut self) {
        while !self.deferred_tx.is_empty() && self.nic.transmit_queue_available() > 0 {
            let frame = self.deferred_tx.pop_front().expect("deferred frame");
            self.nic.transmit(frame);
        }
    }
}
