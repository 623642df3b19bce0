//! The full stack running over the virtio-net driver and an in-process
//! device model.

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::time::Instant;
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, Icmpv4Packet, Icmpv4Repr, IpProtocol, Ipv4Address, Ipv4Packet, Ipv4Repr,
};
use vstack_net::buffer::{BUFFER_SIZE, BufferPool};
use vstack_net::stack::{Stack, StackConfig};
use vstack_net::test_util::virtio_device::FakeTransport;
use vstack_net::virtio::{IrqMode, VirtioNet};

const DEV_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];
const PEER_MAC: EthernetAddress = EthernetAddress([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);

fn our_ip() -> Ipv4Address {
    Ipv4Address::new(192, 168, 1, 10)
}

fn peer_ip() -> Ipv4Address {
    Ipv4Address::new(192, 168, 1, 1)
}

fn virtio_stack() -> Stack<VirtioNet<FakeTransport>> {
    let pool = BufferPool::new(128, BUFFER_SIZE);
    let nic = VirtioNet::new(FakeTransport::new(DEV_MAC), pool.clone(), IrqMode::Legacy).unwrap();
    Stack::new(nic, pool, StackConfig::new(our_ip(), 24))
}

/// An ARP request for our address, as raw wire bytes.
fn arp_request_bytes() -> Vec<u8> {
    let arp = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Request,
        source_hardware_addr: PEER_MAC,
        source_protocol_addr: peer_ip(),
        target_hardware_addr: EthernetAddress([0; 6]),
        target_protocol_addr: our_ip(),
    };
    let eth = EthernetRepr {
        src_addr: PEER_MAC,
        dst_addr: EthernetAddress::BROADCAST,
        ethertype: EthernetProtocol::Arp,
    };
    let mut bytes = vec![0u8; eth.buffer_len() + arp.buffer_len()];
    let mut frame = EthernetFrame::new_unchecked(&mut bytes);
    eth.emit(&mut frame);
    arp.emit(&mut ArpPacket::new_unchecked(frame.payload_mut()));
    bytes
}

/// An ICMP echo request for our address, as raw wire bytes.
fn ping_bytes() -> Vec<u8> {
    let caps = ChecksumCapabilities::default();
    let icmp = Icmpv4Repr::EchoRequest { ident: 11, seq_no: 1, data: b"virtio ping" };
    let ip = Ipv4Repr {
        src_addr: peer_ip(),
        dst_addr: our_ip(),
        next_header: IpProtocol::Icmp,
        payload_len: icmp.buffer_len(),
        hop_limit: 64,
    };
    let eth = EthernetRepr {
        src_addr: PEER_MAC,
        dst_addr: EthernetAddress(DEV_MAC),
        ethertype: EthernetProtocol::Ipv4,
    };

    let mut bytes = vec![0u8; eth.buffer_len() + ip.buffer_len() + icmp.buffer_len()];
    let mut frame = EthernetFrame::new_unchecked(&mut bytes);
    eth.emit(&mut frame);
    let mut ip_pkt = Ipv4Packet::new_unchecked(frame.payload_mut());
    ip.emit(&mut ip_pkt, &caps);
    ip_pkt.fill_checksum();
    icmp.emit(&mut Icmpv4Packet::new_unchecked(ip_pkt.payload_mut()), &caps);
    bytes
}

#[test]
fn stack_answers_arp_through_virtio() {
    let mut stack = virtio_stack();
    stack.nic_mut().transport_mut().push_rx(&arp_request_bytes());
    stack.poll(Instant::from_millis(0));

    let sent = stack.nic_mut().transport_mut().take_sent();
    assert_eq!(sent.len(), 1);

    let eth = EthernetFrame::new_checked(&sent[0][..]).unwrap();
    assert_eq!(eth.dst_addr(), PEER_MAC);
    assert_eq!(eth.src_addr(), EthernetAddress(DEV_MAC));
    assert_eq!(eth.ethertype(), EthernetProtocol::Arp);

    match ArpRepr::parse(&ArpPacket::new_checked(eth.payload()).unwrap()).unwrap() {
        ArpRepr::EthernetIpv4 { operation, source_protocol_addr, target_hardware_addr, .. } => {
            assert_eq!(operation, ArpOperation::Reply);
            assert_eq!(source_protocol_addr, our_ip());
            assert_eq!(target_hardware_addr, PEER_MAC);
        }
        _ => unreachable!(),
    }
}

#[test]
fn stack_answers_ping_through_virtio() {
    let mut stack = virtio_stack();
    // Teach the stack our peer's MAC first so the reply needs no
    // resolution round.
    stack.nic_mut().transport_mut().push_rx(&arp_request_bytes());
    stack.poll(Instant::from_millis(0));
    stack.nic_mut().transport_mut().take_sent();

    stack.nic_mut().transport_mut().push_rx(&ping_bytes());
    stack.poll(Instant::from_millis(1));

    let sent = stack.nic_mut().transport_mut().take_sent();
    assert_eq!(sent.len(), 1);

    let eth = EthernetFrame::new_checked(&sent[0][..]).unwrap();
    assert_eq!(eth.ethertype(), EthernetProtocol::Ipv4);
    let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
    assert_eq!(ip.dst_addr(), peer_ip());
    assert_eq!(ip.next_header(), IpProtocol::Icmp);

    let caps = ChecksumCapabilities::default();
    match Icmpv4Repr::parse(&Icmpv4Packet::new_checked(ip.payload()).unwrap(), &caps).unwrap() {
        Icmpv4Repr::EchoReply { ident, seq_no, data } => {
            assert_eq!(ident, 11);
            assert_eq!(seq_no, 1);
            assert_eq!(data, b"virtio ping");
        }
        other => panic!("expected echo reply, got {other:?}"),
    }
}

#[test]
fn rx_ring_stays_populated_under_load() {
    let mut stack = virtio_stack();
    let before = stack.nic_mut().transport_mut().rx_buffers_available();
    assert!(before > 0);

    for i in 0..64u16 {
        let mut ping = ping_bytes();
        // Vary the ICMP seq so each packet is distinct on the wire.
        let len = ping.len();
        ping[len - 12] = i as u8;
        stack.nic_mut().transport_mut().push_rx(&ping);
        stack.poll(Instant::from_millis(i as i64 + 10));
    }

    // Every buffer the driver consumed was replaced.
    assert_eq!(stack.nic_mut().transport_mut().rx_buffers_available(), before);
}
