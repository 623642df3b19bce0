//! Two stacks, one wire: a TCP echo server and client talking over a pair
//! of in-memory NICs. Exercises ARP resolution, the three-way handshake,
//! bidirectional data flow and a graceful close, narrated via tracing.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{Context, bail};
use smoltcp::time::Instant;
use smoltcp::wire::{EthernetAddress, Ipv4Address};
use tracing::info;

use vstack_net::buffer::{BUFFER_SIZE, BufferPool};
use vstack_net::stack::{Stack, StackConfig};
use vstack_net::tcp::Socket;
use vstack_net::test_util::channel_pair;

const SERVER_MAC: EthernetAddress = EthernetAddress([0x52, 0x54, 0x00, 0x00, 0x01, 0x01]);
const CLIENT_MAC: EthernetAddress = EthernetAddress([0x52, 0x54, 0x00, 0x00, 0x01, 0x02]);

const ECHO_PORT: u16 = 7;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let server_ip = Ipv4Address::new(10, 0, 0, 1);
    let client_ip = Ipv4Address::new(10, 0, 0, 2);

    let (server_nic, client_nic) = channel_pair(SERVER_MAC, CLIENT_MAC);
    let mut server = Stack::new(
        server_nic,
        BufferPool::new(64, BUFFER_SIZE),
        StackConfig::new(server_ip, 24),
    );
    let mut client = Stack::new(
        client_nic,
        BufferPool::new(64, BUFFER_SIZE),
        StackConfig::new(client_ip, 24),
    );

    // Echo service: write back whatever arrives, close when the peer does.
    let listener = server.tcp_listen(ECHO_PORT).context("bind echo port")?;
    listener.on_connect(|conn| {
        info!(remote = %conn.remote(), "echo: connection accepted");
        let echo = conn.clone();
        conn.on_read(4096, move |data| {
            info!(len = data.len(), "echo: bouncing bytes");
            let _ = echo.write(data.to_vec());
        });
    });

    // Client: send one message, verify the echo, close.
    let reply: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let done = Rc::new(RefCell::new(false));

    let message = b"hello from a tiny stack".to_vec();
    let expected = message.clone();

    let reply_in = Rc::clone(&reply);
    let done_in = Rc::clone(&done);
    let conn = client
        .tcp_connect(Socket::new(server_ip, ECHO_PORT), move |conn| {
            info!(local = %conn.local(), "client: connected");
        })
        .context("connect")?;
    conn.on_read(4096, move |data| {
        let mut reply = reply_in.borrow_mut();
        reply.extend_from_slice(data);
        if reply.len() >= expected.len() {
            *done_in.borrow_mut() = true;
        }
    });
    conn.on_close(|| info!("client: connection closed"));
    conn.write(message.clone()).context("write")?;

    // Cooperative loop with a simulated millisecond clock; everything
    // settles in a handful of rounds.
    let mut now = Instant::from_millis(0);
    for round in 0..1000 {
        server.poll(now);
        client.poll(now);
        now += smoltcp::time::Duration::from_millis(1);

        if *done.borrow() {
            info!(round, reply = %String::from_utf8_lossy(&reply.borrow()), "echo verified");
            conn.close().context("close")?;
            // A few more rounds to carry the FIN exchange through.
            for _ in 0..16 {
                server.poll(now);
                client.poll(now);
                now += smoltcp::time::Duration::from_millis(1);
            }
            let stats = client.stats();
            info!(
                packets_tx = stats.packets_tx,
                packets_rx = stats.packets_rx,
                arp_requests_tx = stats.arp_requests_tx,
                "client wire totals"
            );
            return Ok(());
        }
    }

    bail!("echo never completed: reply so far {:?}", reply.borrow());
}
