//! Raw frame builders for injecting hand-crafted packets into a stack.
//!
//! All builders return a [`Frame`] with the cursor at the Ethernet header,
//! exactly as a NIC would deliver it.

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, IpProtocol, Ipv4Address, Ipv4Packet, Ipv4Repr, UdpPacket, UdpRepr,
};

use crate::buffer::{BufferPool, Frame};
use crate::ethernet::ETHERNET_HEADER_LEN;
use crate::ip4::IPV4_HEADER_LEN;

/// Ethernet frame around an arbitrary payload.
pub fn eth_frame(
    pool: &BufferPool,
    src: EthernetAddress,
    dst: EthernetAddress,
    ethertype: EthernetProtocol,
    payload: &[u8],
) -> Frame {
    let mut frame = Frame::new_tx(pool.acquire().expect("pool"));
    frame.append(payload.len()).copy_from_slice(payload);
    let buf = frame.prepend(ETHERNET_HEADER_LEN);
    let repr = EthernetRepr { src_addr: src, dst_addr: dst, ethertype };
    repr.emit(&mut EthernetFrame::new_unchecked(buf));
    frame
}

/// IPv4-in-Ethernet frame with full control over fragment fields.
#[allow(clippy::too_many_arguments)]
pub fn ipv4_frame(
    pool: &BufferPool,
    src_mac: EthernetAddress,
    dst_mac: EthernetAddress,
    src: Ipv4Address,
    dst: Ipv4Address,
    proto: IpProtocol,
    ident: u16,
    frag_offset: u16,
    more_frags: bool,
    payload: &[u8],
) -> Frame {
    let mut frame = Frame::new_tx(pool.acquire().expect("pool"));
    frame.append(payload.len()).copy_from_slice(payload);

    let buf = frame.prepend(IPV4_HEADER_LEN);
    let mut pkt = Ipv4Packet::new_unchecked(buf);
    let repr = Ipv4Repr {
        src_addr: src,
        dst_addr: dst,
        next_header: proto,
        payload_len: payload.len(),
        hop_limit: 64,
    };
    repr.emit(&mut pkt, &ChecksumCapabilities::default());
    pkt.set_ident(ident);
    pkt.set_dont_frag(false);
    pkt.set_more_frags(more_frags);
    pkt.set_frag_offset(frag_offset);
    pkt.fill_checksum();

    let eth = frame.prepend(ETHERNET_HEADER_LEN);
    let repr = EthernetRepr { src_addr: src_mac, dst_addr: dst_mac, ethertype: EthernetProtocol::Ipv4 };
    repr.emit(&mut EthernetFrame::new_unchecked(eth));
    frame
}

/// A UDP datagram as raw L4 bytes, for use as an IPv4 payload.
pub fn udp_payload(
    src: Ipv4Address,
    dst: Ipv4Address,
    src_port: u16,
    dst_port: u16,
    data: &[u8],
) -> Vec<u8> {
    let repr = UdpRepr { src_port, dst_port };
    let mut bytes = vec![0u8; 8 + data.len()];
    let mut pkt = UdpPacket::new_unchecked(&mut bytes[..]);
    repr.emit(
        &mut pkt,
        &src.into(),
        &dst.into(),
        data.len(),
        |payload| payload.copy_from_slice(data),
        &ChecksumCapabilities::default(),
    );
    bytes
}

/// ARP request or reply wrapped in Ethernet.
pub fn arp_frame(
    pool: &BufferPool,
    operation: ArpOperation,
    sender_mac: EthernetAddress,
    sender_ip: Ipv4Address,
    target_mac: EthernetAddress,
    target_ip: Ipv4Address,
) -> Frame {
    let mut frame = Frame::new_tx(pool.acquire().expect("pool"));
    let repr = ArpRepr::EthernetIpv4 {
        operation,
        source_hardware_addr: sender_mac,
        source_protocol_addr: sender_ip,
        target_hardware_addr: target_mac,
        target_protocol_addr: target_ip,
    };
    repr.emit(&mut ArpPacket::new_unchecked(frame.append(repr.buffer_len())));

    let dst = if operation == ArpOperation::Request {
        EthernetAddress::BROADCAST
    } else {
        target_mac
    };
    let eth = frame.prepend(ETHERNET_HEADER_LEN);
    let repr = EthernetRepr { src_addr: sender_mac, dst_addr: dst, ethertype: EthernetProtocol::Arp };
    repr.emit(&mut EthernetFrame::new_unchecked(eth));
    frame
}
