//! IPv4: header validation, protocol demux, fragment reassembly, and
//! transmit-side header construction with next-hop selection.

pub mod reassembly;

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::time::Instant;
use smoltcp::wire::{IpProtocol, Ipv4Address, Ipv4Cidr, Ipv4Packet, Ipv4Repr};
use thiserror::Error;
use tracing::trace;

use crate::buffer::Frame;
use crate::timer::{TimerEvent, Timers};

use reassembly::{FragKey, Reassembly, ReassemblyCounters};

/// Header size without options; we never emit options.
pub const IPV4_HEADER_LEN: usize = 20;

const DEFAULT_TTL: u8 = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Ip4Error {
    #[error("no route to {0}")]
    NoRoute(Ipv4Address),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Ip4Counters {
    pub rx: u64,
    pub tx: u64,
    pub dropped: u64,
    pub no_route: u64,
}

/// An L4 payload on its way down, before the IPv4 header exists.
pub struct IpTx {
    pub frame: Frame,
    pub src: Ipv4Address,
    pub dst: Ipv4Address,
    pub proto: IpProtocol,
    pub ttl: u8,
}

impl IpTx {
    pub fn new(frame: Frame, src: Ipv4Address, dst: Ipv4Address, proto: IpProtocol) -> Self {
        IpTx { frame, src, dst, proto, ttl: DEFAULT_TTL }
    }
}

enum DeliveryData {
    Frame(Frame),
    Assembled(Vec<u8>),
}

/// A datagram handed up to a transport, either straight out of a frame or
/// freshly reassembled.
pub struct Delivery {
    pub src: Ipv4Address,
    pub dst: Ipv4Address,
    pub proto: IpProtocol,
    data: DeliveryData,
}

impl Delivery {
    pub(crate) fn from_frame(
        src: Ipv4Address,
        dst: Ipv4Address,
        proto: IpProtocol,
        frame: Frame,
    ) -> Self {
        Delivery { src, dst, proto, data: DeliveryData::Frame(frame) }
    }

    pub fn payload(&self) -> &[u8] {
        match &self.data {
            DeliveryData::Frame(frame) => frame.payload(),
            DeliveryData::Assembled(data) => data,
        }
    }
}

/// IPv4 state for one interface.
pub struct Ip4 {
    attached: Vec<Ipv4Cidr>,
    gateway: Option<Ipv4Address>,
    reassembly: Reassembly,
    next_ident: u16,
    counters: Ip4Counters,
}

impl Ip4 {
    pub fn new(addr: Ipv4Cidr, gateway: Option<Ipv4Address>) -> Self {
        Ip4 {
            attached: vec![addr],
            gateway,
            reassembly: Reassembly::new(),
            next_ident: 0,
            counters: Ip4Counters::default(),
        }
    }

    /// Our primary address.
    pub fn addr(&self) -> Ipv4Address {
        self.attached[0].address()
    }

    /// Attach an additional directly-reachable network.
    pub fn add_network(&mut self, cidr: Ipv4Cidr) {
        self.attached.push(cidr);
    }

    pub fn counters(&self) -> Ip4Counters {
        self.counters
    }

    pub fn reassembly_counters(&self) -> ReassemblyCounters {
        self.reassembly.counters()
    }

    /// Validate one received datagram and hand it up, feeding fragments
    /// through the reassembly engine.
    pub fn receive(
        &mut self,
        mut frame: Frame,
        now: Instant,
        timers: &mut Timers<TimerEvent>,
    ) -> Option<Delivery> {
        let Ok(pkt) = Ipv4Packet::new_checked(frame.payload()) else {
            self.counters.dropped += 1;
            return None;
        };
        if pkt.version() != 4 || !pkt.verify_checksum() {
            self.counters.dropped += 1;
            return None;
        }

        let src = pkt.src_addr();
        let dst = pkt.dst_addr();
        if !self.is_local_destination(dst) {
            // Not a router: anything not addressed to us is dropped.
            self.counters.dropped += 1;
            return None;
        }

        let proto = pkt.next_header();
        let header_len = pkt.header_len() as usize;
        let total_len = pkt.total_len() as usize;
        let more_frags = pkt.more_frags();
        let frag_offset = pkt.frag_offset() as usize;
        let ident = pkt.ident();

        // The link layer may have padded the frame; cut back to the
        // datagram, then strip the header.
        frame.truncate(total_len);
        frame.trim_front(header_len);

        self.counters.rx += 1;
        trace!(%src, %dst, ?proto, len = frame.payload_len(), "ip4 rx");

        if more_frags || frag_offset != 0 {
            let key = FragKey { src, dst, proto, ident };
            let assembled = self.reassembly.process(
                key,
                frag_offset,
                more_frags,
                frame.payload(),
                now,
                timers,
            )?;
            return Some(Delivery { src, dst, proto, data: DeliveryData::Assembled(assembled) });
        }

        Some(Delivery { src, dst, proto, data: DeliveryData::Frame(frame) })
    }

    /// Prepend an IPv4 header and pick the next hop for the ARP layer.
    pub fn transmit(
        &mut self,
        tx: IpTx,
        caps: &ChecksumCapabilities,
    ) -> Result<(Frame, Ipv4Address), Ip4Error> {
        let next_hop = self.next_hop(tx.dst).inspect_err(|_| {
            self.counters.no_route += 1;
        })?;

        let IpTx { mut frame, src, dst, proto, ttl } = tx;
        let payload_len = frame.payload_len();

        let repr = Ipv4Repr {
            src_addr: src,
            dst_addr: dst,
            next_header: proto,
            payload_len,
            hop_limit: ttl,
        };
        let buf = frame.prepend(IPV4_HEADER_LEN);
        let mut pkt = Ipv4Packet::new_unchecked(buf);
        repr.emit(&mut pkt, caps);
        // The buffer is recycled, so the fields emit leaves alone must be
        // written explicitly before the checksum is finalized.
        pkt.set_ident(self.next_ident);
        pkt.set_dont_frag(false);
        pkt.set_more_frags(false);
        pkt.set_frag_offset(0);
        pkt.fill_checksum();
        self.next_ident = self.next_ident.wrapping_add(1);

        self.counters.tx += 1;
        trace!(%src, %dst, ?proto, payload_len, %next_hop, "ip4 tx");
        Ok((frame, next_hop))
    }

    /// Reassembly TTL sweep, driven by the stack timer.
    pub fn reassembly_tick(&mut self, now: Instant, timers: &mut Timers<TimerEvent>) {
        self.reassembly.expire_tick(now, timers);
    }

    fn is_local_destination(&self, dst: Ipv4Address) -> bool {
        dst == self.addr()
            || dst == Ipv4Address::BROADCAST
            || dst.is_multicast()
            || self.attached.iter().any(|net| net.broadcast() == Some(dst))
    }

    fn next_hop(&self, dst: Ipv4Address) -> Result<Ipv4Address, Ip4Error> {
        if dst == Ipv4Address::BROADCAST
            || dst.is_multicast()
            || self.attached.iter().any(|net| net.broadcast() == Some(dst))
        {
            return Ok(Ipv4Address::BROADCAST);
        }

        // Longest-prefix match over the attached networks; anything else
        // goes via the default gateway.
        let directly = self
            .attached
            .iter()
            .filter(|net| net.contains_addr(&dst))
            .max_by_key(|net| net.prefix_len());
        if directly.is_some() {
            return Ok(dst);
        }
        self.gateway.ok_or(Ip4Error::NoRoute(dst))
    }
}
