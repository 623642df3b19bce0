//! IPv4 address resolution with packet buffering.
//!
//! Outbound packets whose next-hop MAC is unknown are parked in a per-target
//! pending entry while a request broadcast goes out. Any incoming ARP packet
//! teaches us its sender pair, and a learned pair immediately rescues every
//! frame queued for that address, in FIFO order, to the learned MAC.
//!
//! The resolver timer re-broadcasts requests once a second until the retry
//! budget runs out, then drops the queued frames. A second, slower timer
//! sweeps expired cache entries.

use std::collections::HashMap;

use smoltcp::time::Instant;
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetProtocol, Ipv4Address,
};
use tracing::{debug, trace};

use crate::buffer::{BufferPool, Frame};
use crate::config::ArpConfig;
use crate::ethernet::LinkTx;
use crate::timer::{TimerEvent, TimerId, Timers};

/// Decides whether we answer requests for addresses other than our own.
pub type ProxyRule = Box<dyn Fn(Ipv4Address) -> bool>;

#[derive(Debug, Default, Clone, Copy)]
pub struct ArpCounters {
    pub requests_rx: u64,
    pub requests_tx: u64,
    pub replies_rx: u64,
    pub replies_tx: u64,
    pub dropped: u64,
}

struct CacheEntry {
    mac: EthernetAddress,
    seen: Instant,
}

struct PendingEntry {
    chain: Frame,
    tries_remaining: u8,
}

/// ARP state for one interface.
pub struct Arp {
    cfg: ArpConfig,
    mac: EthernetAddress,
    ip: Ipv4Address,
    cache: HashMap<Ipv4Address, CacheEntry>,
    pending: HashMap<Ipv4Address, PendingEntry>,
    proxy: Option<ProxyRule>,
    flush_timer: Option<TimerId>,
    resolve_timer: Option<TimerId>,
    counters: ArpCounters,
}

impl Arp {
    pub fn new(cfg: ArpConfig, mac: EthernetAddress, ip: Ipv4Address) -> Self {
        Arp {
            cfg,
            mac,
            ip,
            cache: HashMap::new(),
            pending: HashMap::new(),
            proxy: None,
            flush_timer: None,
            resolve_timer: None,
            counters: ArpCounters::default(),
        }
    }

    /// Answer requests for any address the rule accepts (proxy ARP).
    pub fn set_proxy(&mut self, rule: ProxyRule) {
        self.proxy = Some(rule);
    }

    pub fn counters(&self) -> ArpCounters {
        self.counters
    }

    /// Cached MAC for `ip`, if resolution already happened.
    pub fn lookup(&self, ip: Ipv4Address) -> Option<EthernetAddress> {
        self.cache.get(&ip).map(|e| e.mac)
    }

    /// Frames currently parked awaiting resolution.
    pub fn pending_frames(&self) -> usize {
        self.pending.values().map(|e| e.chain.chain_len()).sum()
    }

    /// Process one received ARP packet. The consumed frame is released;
    /// the result is whatever the packet unblocked or provoked.
    pub fn receive(
        &mut self,
        frame: Frame,
        now: Instant,
        timers: &mut Timers<TimerEvent>,
        pool: &BufferPool,
    ) -> Vec<LinkTx> {
        let repr = match ArpPacket::new_checked(frame.payload()).and_then(|p| ArpRepr::parse(&p)) {
            Ok(repr) => repr,
            Err(_) => {
                self.counters.dropped += 1;
                return Vec::new();
            }
        };
        drop(frame);

        let ArpRepr::EthernetIpv4 {
            operation,
            source_hardware_addr: sender_mac,
            source_protocol_addr: sender_ip,
            target_protocol_addr: target_ip,
            ..
        } = repr
        else {
            self.counters.dropped += 1;
            return Vec::new();
        };

        let mut out = Vec::new();

        // Always learn, and always try to ship waiting packets when someone
        // talks.
        self.learn(sender_ip, sender_mac, now, timers);
        if let Some(entry) = self.pending.remove(&sender_ip) {
            debug!(ip = %sender_ip, mac = %sender_mac, frames = entry.chain.chain_len(),
                   "resolution complete, draining queued frames");
            out.push(LinkTx {
                frame: entry.chain,
                dst: sender_mac,
                ethertype: EthernetProtocol::Ipv4,
            });
            if self.pending.is_empty()
                && let Some(id) = self.resolve_timer.take()
            {
                timers.stop(id);
            }
        }

        match operation {
            ArpOperation::Request => {
                self.counters.requests_rx += 1;
                let ours = target_ip == self.ip;
                let proxied = self.proxy.as_ref().is_some_and(|rule| rule(target_ip));
                if ours || proxied {
                    trace!(requester = %sender_ip, target = %target_ip, "answering request");
                    self.counters.replies_tx += 1;
                    if let Some(frame) = self.build_packet(
                        pool,
                        ArpOperation::Reply,
                        target_ip,
                        sender_mac,
                        sender_ip,
                    ) {
                        out.push(LinkTx {
                            frame,
                            dst: sender_mac,
                            ethertype: EthernetProtocol::Arp,
                        });
                    }
                }
            }
            ArpOperation::Reply => {
                self.counters.replies_rx += 1;
            }
            ArpOperation::Unknown(_) => {
                self.counters.dropped += 1;
            }
        }

        out
    }

    /// Transmit an IPv4 frame (chain) toward `next_hop`, resolving first if
    /// needed. Called by the IP layer with the next-hop already selected.
    pub fn transmit(
        &mut self,
        frame: Frame,
        next_hop: Ipv4Address,
        now: Instant,
        timers: &mut Timers<TimerEvent>,
        pool: &BufferPool,
    ) -> Vec<LinkTx> {
        if next_hop == Ipv4Address::BROADCAST {
            return vec![LinkTx {
                frame,
                dst: EthernetAddress::BROADCAST,
                ethertype: EthernetProtocol::Ipv4,
            }];
        }

        if let Some(entry) = self.cache.get(&next_hop) {
            return vec![LinkTx {
                frame,
                dst: entry.mac,
                ethertype: EthernetProtocol::Ipv4,
            }];
        }

        let mut out = Vec::new();
        match self.pending.get_mut(&next_hop) {
            Some(entry) => {
                trace!(ip = %next_hop, "already resolving, queueing frame");
                entry.chain.chain(frame);
            }
            None => {
                debug!(ip = %next_hop, "no cache entry, resolving");
                self.pending.insert(
                    next_hop,
                    PendingEntry { chain: frame, tries_remaining: self.cfg.request_retries },
                );
                if let Some(req) = self.build_request(pool, next_hop) {
                    out.push(req);
                }
                if self.resolve_timer.is_none() {
                    self.resolve_timer =
                        Some(timers.start(now + self.cfg.resolve_interval, TimerEvent::ArpResolve));
                }
            }
        }
        out
    }

    /// Resolver tick: re-broadcast for entries with retries left, drop the
    /// rest.
    pub fn resolve_tick(
        &mut self,
        now: Instant,
        timers: &mut Timers<TimerEvent>,
        pool: &BufferPool,
    ) -> Vec<LinkTx> {
        self.resolve_timer = None;
        let mut out = Vec::new();
        let mut expired = Vec::new();
        let mut retry = Vec::new();

        for (&ip, entry) in self.pending.iter_mut() {
            if entry.tries_remaining == 0 {
                expired.push(ip);
            } else {
                entry.tries_remaining -= 1;
                retry.push(ip);
            }
        }

        for ip in retry {
            if let Some(req) = self.build_request(pool, ip) {
                out.push(req);
            }
        }

        for ip in expired {
            let entry = self.pending.remove(&ip).expect("pending entry");
            debug!(%ip, frames = entry.chain.chain_len(), "resolution failed, dropping frames");
            self.counters.dropped += entry.chain.chain_len() as u64;
        }

        if !self.pending.is_empty() {
            self.resolve_timer =
                Some(timers.start(now + self.cfg.resolve_interval, TimerEvent::ArpResolve));
        }
        out
    }

    /// Cache sweep: evict entries older than the TTL.
    pub fn flush_tick(&mut self, now: Instant, timers: &mut Timers<TimerEvent>) {
        self.flush_timer = None;
        self.cache.retain(|ip, entry| {
            let keep = now - entry.seen < self.cfg.cache_ttl;
            if !keep {
                trace!(%ip, "cache entry expired");
            }
            keep
        });
        if !self.cache.is_empty() {
            self.flush_timer =
                Some(timers.start(now + self.cfg.cache_ttl, TimerEvent::ArpFlush));
        }
    }

    fn learn(
        &mut self,
        ip: Ipv4Address,
        mac: EthernetAddress,
        now: Instant,
        timers: &mut Timers<TimerEvent>,
    ) {
        self.cache.insert(ip, CacheEntry { mac, seen: now });
        if self.flush_timer.is_none() {
            self.flush_timer = Some(timers.start(now + self.cfg.cache_ttl, TimerEvent::ArpFlush));
        }
    }

    fn build_request(&mut self, pool: &BufferPool, target_ip: Ipv4Address) -> Option<LinkTx> {
        self.counters.requests_tx += 1;
        let frame = self.build_packet(
            pool,
            ArpOperation::Request,
            self.ip,
            EthernetAddress([0; 6]),
            target_ip,
        )?;
        Some(LinkTx {
            frame,
            dst: EthernetAddress::BROADCAST,
            ethertype: EthernetProtocol::Arp,
        })
    }

    fn build_packet(
        &mut self,
        pool: &BufferPool,
        operation: ArpOperation,
        source_ip: Ipv4Address,
        target_mac: EthernetAddress,
        target_ip: Ipv4Address,
    ) -> Option<Frame> {
        let Some(buf) = pool.acquire() else {
            self.counters.dropped += 1;
            return None;
        };
        let mut frame = Frame::new_tx(buf);
        let repr = ArpRepr::EthernetIpv4 {
            operation,
            source_hardware_addr: self.mac,
            source_protocol_addr: source_ip,
            target_hardware_addr: target_mac,
            target_protocol_addr: target_ip,
        };
        let data = frame.append(repr.buffer_len());
        repr.emit(&mut ArpPacket::new_unchecked(data));
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BUFFER_SIZE, BufferPool};
    use smoltcp::time::Duration;

    const OUR_MAC: EthernetAddress = EthernetAddress([0x52, 0x54, 0x00, 0x00, 0x00, 0x01]);
    const PEER_MAC: EthernetAddress = EthernetAddress([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);

    fn our_ip() -> Ipv4Address {
        Ipv4Address::new(10, 0, 0, 1)
    }

    fn peer_ip() -> Ipv4Address {
        Ipv4Address::new(10, 0, 0, 5)
    }

    fn setup() -> (Arp, BufferPool, Timers<TimerEvent>) {
        let arp = Arp::new(ArpConfig::default(), OUR_MAC, our_ip());
        (arp, BufferPool::new(16, BUFFER_SIZE), Timers::new())
    }

    fn arp_frame(
        pool: &BufferPool,
        operation: ArpOperation,
        sender_mac: EthernetAddress,
        sender_ip: Ipv4Address,
        target_ip: Ipv4Address,
    ) -> Frame {
        let mut frame = Frame::new_tx(pool.acquire().unwrap());
        let repr = ArpRepr::EthernetIpv4 {
            operation,
            source_hardware_addr: sender_mac,
            source_protocol_addr: sender_ip,
            target_hardware_addr: EthernetAddress([0; 6]),
            target_protocol_addr: target_ip,
        };
        repr.emit(&mut ArpPacket::new_unchecked(frame.append(repr.buffer_len())));
        frame
    }

    fn ip_frame(pool: &BufferPool, marker: u8) -> Frame {
        let mut frame = Frame::new_tx(pool.acquire().unwrap());
        frame.append(1)[0] = marker;
        frame
    }

    fn parse_arp(tx: &LinkTx) -> ArpRepr {
        ArpRepr::parse(&ArpPacket::new_checked(tx.frame.payload()).unwrap()).unwrap()
    }

    #[test]
    fn test_request_for_us_answered_and_learned() {
        let (mut arp, pool, mut timers) = setup();
        let now = Instant::from_millis(0);

        let frame = arp_frame(&pool, ArpOperation::Request, PEER_MAC, peer_ip(), our_ip());
        let out = arp.receive(frame, now, &mut timers, &pool);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].dst, PEER_MAC);
        assert_eq!(out[0].ethertype, EthernetProtocol::Arp);
        match parse_arp(&out[0]) {
            ArpRepr::EthernetIpv4 {
                operation,
                source_hardware_addr,
                source_protocol_addr,
                target_hardware_addr,
                target_protocol_addr,
            } => {
                assert_eq!(operation, ArpOperation::Reply);
                assert_eq!(source_hardware_addr, OUR_MAC);
                assert_eq!(source_protocol_addr, our_ip());
                assert_eq!(target_hardware_addr, PEER_MAC);
                assert_eq!(target_protocol_addr, peer_ip());
            }
        }

        assert_eq!(arp.lookup(peer_ip()), Some(PEER_MAC));
        assert_eq!(arp.counters().requests_rx, 1);
        assert_eq!(arp.counters().replies_tx, 1);
    }

    #[test]
    fn test_request_for_other_ip_ignored() {
        let (mut arp, pool, mut timers) = setup();
        let other = Ipv4Address::new(10, 0, 0, 99);
        let frame = arp_frame(&pool, ArpOperation::Request, PEER_MAC, peer_ip(), other);
        let out = arp.receive(frame, Instant::from_millis(0), &mut timers, &pool);
        assert!(out.is_empty());
        // Sender was still learned.
        assert_eq!(arp.lookup(peer_ip()), Some(PEER_MAC));
    }

    #[test]
    fn test_proxy_rule_answers_for_routed_ip() {
        let (mut arp, pool, mut timers) = setup();
        arp.set_proxy(Box::new(|ip| ip == Ipv4Address::new(10, 0, 1, 7)));

        let frame = arp_frame(
            &pool,
            ArpOperation::Request,
            PEER_MAC,
            peer_ip(),
            Ipv4Address::new(10, 0, 1, 7),
        );
        let out = arp.receive(frame, Instant::from_millis(0), &mut timers, &pool);
        assert_eq!(out.len(), 1);
        match parse_arp(&out[0]) {
            ArpRepr::EthernetIpv4 { source_protocol_addr, .. } => {
                assert_eq!(source_protocol_addr, Ipv4Address::new(10, 0, 1, 7));
            }
        }
    }

    #[test]
    fn test_unresolved_transmit_queues_and_requests() {
        let (mut arp, pool, mut timers) = setup();
        let now = Instant::from_millis(0);

        let out = arp.transmit(ip_frame(&pool, 1), peer_ip(), now, &mut timers, &pool);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].dst, EthernetAddress::BROADCAST);
        match parse_arp(&out[0]) {
            ArpRepr::EthernetIpv4 { operation, target_protocol_addr, .. } => {
                assert_eq!(operation, ArpOperation::Request);
                assert_eq!(target_protocol_addr, peer_ip());
            }
        }

        // A second transmit to the same target extends the queue silently.
        let out = arp.transmit(ip_frame(&pool, 2), peer_ip(), now, &mut timers, &pool);
        assert!(out.is_empty());
        assert_eq!(arp.pending_frames(), 2);
        assert_eq!(arp.counters().requests_tx, 1);
    }

    #[test]
    fn test_reply_drains_chain_fifo_to_learned_mac() {
        let (mut arp, pool, mut timers) = setup();
        let now = Instant::from_millis(0);

        for marker in 1..=3 {
            arp.transmit(ip_frame(&pool, marker), peer_ip(), now, &mut timers, &pool);
        }

        let reply = arp_frame(&pool, ArpOperation::Reply, PEER_MAC, peer_ip(), our_ip());
        let out = arp.receive(reply, now, &mut timers, &pool);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].dst, PEER_MAC);
        assert_eq!(out[0].ethertype, EthernetProtocol::Ipv4);

        let mut markers = Vec::new();
        let mut frame = out.into_iter().next().unwrap().frame;
        markers.push(frame.payload()[0]);
        while let Some(next) = frame.take_next() {
            markers.push(next.payload()[0]);
            frame = next;
        }
        assert_eq!(markers, vec![1, 2, 3]);
        assert_eq!(arp.pending_frames(), 0);
    }

    #[test]
    fn test_cached_transmit_goes_straight_out() {
        let (mut arp, pool, mut timers) = setup();
        let now = Instant::from_millis(0);

        let reply = arp_frame(&pool, ArpOperation::Reply, PEER_MAC, peer_ip(), our_ip());
        arp.receive(reply, now, &mut timers, &pool);

        let out = arp.transmit(ip_frame(&pool, 9), peer_ip(), now, &mut timers, &pool);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].dst, PEER_MAC);
        assert_eq!(out[0].ethertype, EthernetProtocol::Ipv4);
    }

    #[test]
    fn test_broadcast_destination_never_resolves() {
        let (mut arp, pool, mut timers) = setup();
        let out = arp.transmit(
            ip_frame(&pool, 1),
            Ipv4Address::BROADCAST,
            Instant::from_millis(0),
            &mut timers,
            &pool,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].dst, EthernetAddress::BROADCAST);
        assert_eq!(arp.pending_frames(), 0);
    }

    #[test]
    fn test_retry_budget_then_drop() {
        let (mut arp, pool, mut timers) = setup();
        let mut now = Instant::from_millis(0);

        arp.transmit(ip_frame(&pool, 1), peer_ip(), now, &mut timers, &pool);
        assert_eq!(arp.counters().requests_tx, 1);

        // Each tick with retries left re-broadcasts.
        for _ in 0..ArpConfig::default().request_retries {
            now += Duration::from_secs(1);
            let out = arp.resolve_tick(now, &mut timers, &pool);
            assert_eq!(out.len(), 1);
        }

        // Budget exhausted: the queued frame is dropped.
        now += Duration::from_secs(1);
        let out = arp.resolve_tick(now, &mut timers, &pool);
        assert!(out.is_empty());
        assert_eq!(arp.pending_frames(), 0);
        assert_eq!(arp.counters().dropped, 1);
        assert_eq!(timers.pending(), 0);
    }

    #[test]
    fn test_cache_expires_after_ttl() {
        let (mut arp, pool, mut timers) = setup();
        let now = Instant::from_millis(0);

        let reply = arp_frame(&pool, ArpOperation::Reply, PEER_MAC, peer_ip(), our_ip());
        arp.receive(reply, now, &mut timers, &pool);
        assert!(arp.lookup(peer_ip()).is_some());

        let later = now + ArpConfig::default().cache_ttl + Duration::from_secs(1);
        arp.flush_tick(later, &mut timers);
        assert!(arp.lookup(peer_ip()).is_none());
    }
}
