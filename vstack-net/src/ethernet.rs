//! Ethernet II framing: receive-side demux and transmit-side header
//! injection, with optional 802.1Q tagging.

use smoltcp::wire::{EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr};
use tracing::trace;

use crate::buffer::Frame;
use crate::vlan::{ETHERTYPE_VLAN, VLAN_TAG_LEN, VlanTag};

/// Ethernet header size
pub const ETHERNET_HEADER_LEN: usize = 14;

/// A frame chain ready for the link layer, still missing its Ethernet
/// header.
pub struct LinkTx {
    pub frame: Frame,
    pub dst: EthernetAddress,
    pub ethertype: EthernetProtocol,
}

/// Where a received frame goes next. The payload cursor is already past the
/// link-layer headers.
pub enum EthDispatch {
    Arp(Frame),
    Ipv4(Frame),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EthCounters {
    pub rx: u64,
    pub tx: u64,
    pub dropped: u64,
    pub unknown_ethertype: u64,
}

/// Link layer state for one interface.
///
/// When `vlan` is set the interface behaves as a per-VID virtual interface:
/// only frames tagged with that VID are accepted (tag stripped before
/// demux), and every transmitted frame is tagged.
pub struct Ethernet {
    mac: EthernetAddress,
    vlan: Option<VlanTag>,
    promiscuous: bool,
    counters: EthCounters,
}

impl Ethernet {
    pub fn new(mac: EthernetAddress) -> Self {
        Ethernet { mac, vlan: None, promiscuous: false, counters: EthCounters::default() }
    }

    pub fn with_vlan(mac: EthernetAddress, vid: u16) -> Self {
        Ethernet { mac, vlan: Some(VlanTag::new(vid)), promiscuous: false, counters: EthCounters::default() }
    }

    pub fn mac(&self) -> EthernetAddress {
        self.mac
    }

    pub fn set_promiscuous(&mut self, enabled: bool) {
        self.promiscuous = enabled;
    }

    pub fn counters(&self) -> EthCounters {
        self.counters
    }

    /// Size of the header this interface prepends on transmit.
    pub fn header_len(&self) -> usize {
        match self.vlan {
            Some(_) => ETHERNET_HEADER_LEN + VLAN_TAG_LEN,
            None => ETHERNET_HEADER_LEN,
        }
    }

    /// Parse and demux one received frame.
    pub fn receive(&mut self, mut frame: Frame) -> Option<EthDispatch> {
        let Ok(eth) = EthernetFrame::new_checked(frame.payload()) else {
            self.counters.dropped += 1;
            return None;
        };

        let dst = eth.dst_addr();
        if dst != self.mac && !dst.is_broadcast() && !dst.is_multicast() && !self.promiscuous {
            self.counters.dropped += 1;
            return None;
        }

        let src = eth.src_addr();
        let mut ethertype = eth.ethertype();
        frame.trim_front(ETHERNET_HEADER_LEN);

        if ethertype == EthernetProtocol::Unknown(ETHERTYPE_VLAN) {
            let Some(tag) = self.vlan else {
                self.counters.dropped += 1;
                return None;
            };
            let Some((parsed, inner)) = VlanTag::parse(frame.payload()) else {
                self.counters.dropped += 1;
                return None;
            };
            if parsed.vid != tag.vid {
                trace!(vid = parsed.vid, our_vid = tag.vid, "frame for other VID");
                self.counters.dropped += 1;
                return None;
            }
            frame.trim_front(VLAN_TAG_LEN);
            ethertype = EthernetProtocol::from(inner);
        } else if self.vlan.is_some() {
            // A VLAN interface never accepts untagged traffic.
            self.counters.dropped += 1;
            return None;
        }

        self.counters.rx += 1;
        trace!(%src, %dst, ?ethertype, len = frame.payload_len(), "eth rx");

        match ethertype {
            EthernetProtocol::Arp => Some(EthDispatch::Arp(frame)),
            EthernetProtocol::Ipv4 => Some(EthDispatch::Ipv4(frame)),
            _ => {
                self.counters.unknown_ethertype += 1;
                self.counters.dropped += 1;
                None
            }
        }
    }

    /// Prepend link-layer headers to every frame of the chain.
    pub fn transmit(&mut self, tx: LinkTx) -> Frame {
        let LinkTx { mut frame, dst, ethertype } = tx;

        let mut cur = Some(&mut frame);
        while let Some(f) = cur {
            self.emit_header(f, dst, ethertype);
            self.counters.tx += 1;
            cur = f.next_mut();
        }
        frame
    }

    fn emit_header(&self, frame: &mut Frame, dst: EthernetAddress, ethertype: EthernetProtocol) {
        match self.vlan {
            Some(tag) => {
                let buf = frame.prepend(ETHERNET_HEADER_LEN + VLAN_TAG_LEN);
                let repr = EthernetRepr {
                    src_addr: self.mac,
                    dst_addr: dst,
                    ethertype: EthernetProtocol::Unknown(ETHERTYPE_VLAN),
                };
                repr.emit(&mut EthernetFrame::new_unchecked(&mut buf[..]));
                tag.emit(ethertype.into(), &mut buf[ETHERNET_HEADER_LEN..]);
            }
            None => {
                let buf = frame.prepend(ETHERNET_HEADER_LEN);
                let repr = EthernetRepr { src_addr: self.mac, dst_addr: dst, ethertype };
                repr.emit(&mut EthernetFrame::new_unchecked(buf));
            }
        }
    }
}
