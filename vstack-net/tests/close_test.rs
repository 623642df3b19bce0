//! Teardown paths: passive close, simultaneous close, TIME_WAIT expiry.

mod harness;

use std::cell::RefCell;
use std::rc::Rc;

use harness::{TestNet, ip_b};
use smoltcp::time::Duration;
use vstack_net::config::TcpConfig;
use vstack_net::tcp::{Connection, Socket, State};

fn establish(net: &mut TestNet) -> (Connection, Connection) {
    let accepted = Rc::new(RefCell::new(None));
    let accepted_in = Rc::clone(&accepted);
    let listener = net.b.tcp_listen(80).unwrap();
    listener.on_connect(move |conn| {
        *accepted_in.borrow_mut() = Some(conn.clone());
    });

    let client = net.a.tcp_connect(Socket::new(ip_b(), 80), |_| {}).unwrap();
    net.settle();
    let server = accepted.borrow().clone().expect("accepted");
    (client, server)
}

#[test]
fn passive_close_walks_close_wait_and_last_ack() {
    let mut net = TestNet::new();
    let (client, server) = establish(&mut net);

    let server_disconnected = Rc::new(RefCell::new(false));
    let flag = Rc::clone(&server_disconnected);
    server.on_disconnect(move |_, _| *flag.borrow_mut() = true);

    // Active close on the client: the server lands in CLOSE_WAIT with no
    // disconnect callback and may still write.
    client.close().unwrap();
    assert_eq!(client.state(), State::FinWait1);
    net.settle();

    assert_eq!(server.state(), State::CloseWait);
    assert!(!*server_disconnected.borrow());
    assert!(server.is_writable());

    // The server finishes: CLOSE_WAIT -> LAST_ACK -> CLOSED, and its
    // registry entry disappears on the final ACK.
    server.close().unwrap();
    assert_eq!(server.state(), State::LastAck);
    net.settle();

    assert_eq!(server.state(), State::Closed);
    assert_eq!(net.b.tcp().connection_count(), 0);
}

#[test]
fn active_closer_lingers_in_time_wait_for_two_msl() {
    let msl = Duration::from_millis(100);
    let mut net = TestNet::with_tcp(
        TcpConfig::default().msl(msl),
        TcpConfig::default(),
    );
    let (client, server) = establish(&mut net);

    let closed = Rc::new(RefCell::new(false));
    let closed_in = Rc::clone(&closed);
    client.on_close(move || *closed_in.borrow_mut() = true);

    client.close().unwrap();
    net.settle();
    server.close().unwrap();
    net.settle();

    assert_eq!(client.state(), State::TimeWait);
    assert!(*closed.borrow());
    assert_eq!(net.a.tcp().connection_count(), 1);

    // Just before 2 MSL the flow is still held; just after, it is gone.
    net.run_for(Duration::from_millis(150), Duration::from_millis(10));
    assert_eq!(net.a.tcp().connection_count(), 1);
    net.run_for(Duration::from_millis(100), Duration::from_millis(10));
    assert_eq!(net.a.tcp().connection_count(), 0);
}

#[test]
fn simultaneous_close_crosses_fins() {
    let mut net = TestNet::with_tcp(
        TcpConfig::default().msl(Duration::from_millis(50)),
        TcpConfig::default().msl(Duration::from_millis(50)),
    );
    let (client, server) = establish(&mut net);

    // Both sides close before either FIN is delivered.
    client.close().unwrap();
    server.close().unwrap();
    assert_eq!(client.state(), State::FinWait1);
    assert_eq!(server.state(), State::FinWait1);

    net.settle();
    assert!(matches!(client.state(), State::TimeWait | State::Closed));
    assert!(matches!(server.state(), State::TimeWait | State::Closed));

    net.run_for(Duration::from_millis(200), Duration::from_millis(10));
    assert_eq!(net.a.tcp().connection_count(), 0);
    assert_eq!(net.b.tcp().connection_count(), 0);
}

#[test]
fn close_flushes_queued_data_before_fin() {
    let mut net = TestNet::new();
    let (client, server) = establish(&mut net);

    let received: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let received_in = Rc::clone(&received);
    server.on_read(8192, move |data| received_in.borrow_mut().extend_from_slice(data));

    // Write and close back to back: every byte must land before the FIN
    // takes effect.
    client.write(vec![0x42; 4000]).unwrap();
    client.close().unwrap();
    net.settle();

    assert_eq!(received.borrow().len(), 4000);
    assert_eq!(server.state(), State::CloseWait);
}

#[test]
fn on_close_fires_after_all_reads_and_writes() {
    let mut net = TestNet::new();
    let (client, server) = establish(&mut net);

    let log: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

    let log_in = Rc::clone(&log);
    client.on_write(move |_| log_in.borrow_mut().push("write"));
    let log_in = Rc::clone(&log);
    client.on_close(move || log_in.borrow_mut().push("close"));

    client.write(b"last words".to_vec()).unwrap();
    client.close().unwrap();
    net.settle();
    server.close().unwrap();
    net.settle();

    assert_eq!(log.borrow().as_slice(), &["write", "close"]);
}
