//! Connection establishment over the full stack, ARP included.

mod harness;

use std::cell::RefCell;
use std::rc::Rc;

use harness::{TestNet, ip_b};
use vstack_net::tcp::{Socket, State};

#[test]
fn three_way_handshake_establishes_both_sides() {
    let mut net = TestNet::new();

    let listener = net.b.tcp_listen(80).unwrap();
    let accepted = Rc::new(RefCell::new(None));
    let accepted_in = Rc::clone(&accepted);
    listener.on_connect(move |conn| {
        *accepted_in.borrow_mut() = Some(conn.clone());
    });

    let client_connected = Rc::new(RefCell::new(false));
    let connected_in = Rc::clone(&client_connected);
    let client = net
        .a
        .tcp_connect(Socket::new(ip_b(), 80), move |conn| {
            assert!(conn.is_connected());
            *connected_in.borrow_mut() = true;
        })
        .unwrap();

    assert_eq!(client.state(), State::SynSent);
    net.settle();

    // Both endpoints reached ESTABLISHED and both connect callbacks fired;
    // no data moved.
    assert_eq!(client.state(), State::Established);
    assert!(*client_connected.borrow());
    let server = accepted.borrow().clone().expect("server side accepted");
    assert_eq!(server.state(), State::Established);
    assert_eq!(server.remote(), client.local());
    assert_eq!(server.local(), client.remote());

    // The SYN had to resolve B's MAC first.
    assert!(net.a.stats().arp_requests_tx >= 1);
    assert!(net.a.arp().lookup(ip_b()).is_some());
}

#[test]
fn connect_to_dead_port_is_refused() {
    let mut net = TestNet::new();

    let reason = Rc::new(RefCell::new(None));
    let reason_in = Rc::clone(&reason);
    let client = net.a.tcp_connect(Socket::new(ip_b(), 9), |_| {}).unwrap();
    client.on_disconnect(move |_, r| *reason_in.borrow_mut() = Some(r));

    net.settle();

    assert_eq!(client.state(), State::Closed);
    assert!(reason.borrow().is_some());
    assert_eq!(net.a.tcp().connection_count(), 0);
}

#[test]
fn two_connections_same_hosts_get_distinct_ports() {
    let mut net = TestNet::new();
    let listener = net.b.tcp_listen(80).unwrap();
    listener.on_connect(|_| {});

    let c1 = net.a.tcp_connect(Socket::new(ip_b(), 80), |_| {}).unwrap();
    let c2 = net.a.tcp_connect(Socket::new(ip_b(), 80), |_| {}).unwrap();
    net.settle();

    assert_eq!(c1.state(), State::Established);
    assert_eq!(c2.state(), State::Established);
    assert_ne!(c1.local().port, c2.local().port);
    assert_eq!(net.b.tcp().connection_count(), 2);
}
