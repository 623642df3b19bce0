//! The TCP engine: connection registry, listeners, ephemeral ports, and the
//! glue that drives per-connection state machines and fires user callbacks.
//!
//! All mutation funnels through [`Tcp::drive`]: a connection is borrowed,
//! processed, and released before any user callback runs, so callbacks can
//! freely call back into the same connection. Work a callback generates
//! (queued writes, a close) lands on the shared service queue and is flushed
//! before the call returns.

mod connection;
pub mod rtt;
pub mod types;
pub mod write_queue;

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::time::Instant;
use smoltcp::wire::{IpProtocol, Ipv4Address, TcpControl, TcpPacket, TcpRepr, TcpSeqNumber};
use tracing::{debug, trace};

use crate::buffer::{BufferPool, Frame};
use crate::config::TcpConfig;
use crate::ip4::{Delivery, IpTx};
use crate::timer::Timers;
use crate::timer::TimerEvent;

pub use connection::{
    CloseCallback, ConnectCallback, Connection, DataCallback, DisconnectCallback, ReadCallback,
    WriteCallback,
};
use connection::{Conn, ConnOutput, DeferredCb, ServiceHandle, TcpCtx};
pub use types::{DisconnectReason, Flow, Port, Socket, State, TcpError, TcpTimer};

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpCounters {
    pub segments_rx: u64,
    pub segments_tx: u64,
    pub dropped: u64,
    pub resets_tx: u64,
    pub bytes_sacked: u64,
    pub active_opens: u64,
    pub passive_opens: u64,
}

struct ListenerInner {
    port: Port,
    on_connect: Option<ConnectCallback>,
    closed: bool,
}

/// Handle to a listening port. Accepted connections surface through
/// `on_connect`.
#[derive(Clone)]
pub struct Listener {
    inner: Rc<RefCell<ListenerInner>>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener").field("port", &self.inner.borrow().port).finish()
    }
}

impl PartialEq for Listener {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Listener {
    fn new(port: Port) -> Self {
        Listener { inner: Rc::new(RefCell::new(ListenerInner { port, on_connect: None, closed: false })) }
    }

    pub fn port(&self) -> Port {
        self.inner.borrow().port
    }

    /// Called with every connection that completes its handshake on this
    /// port.
    pub fn on_connect(&self, cb: impl FnMut(&Connection) + 'static) {
        self.inner.borrow_mut().on_connect = Some(Box::new(cb));
    }

    /// Stop accepting; the engine removes the listener on its next pass.
    pub fn close(&self) {
        self.inner.borrow_mut().closed = true;
    }
}

/// One TCP instance, owned by a stack.
pub struct Tcp {
    cfg: Rc<TcpConfig>,
    local_addr: Ipv4Address,
    conns: HashMap<Flow, Connection>,
    listeners: HashMap<Port, Listener>,
    service_queue: ServiceHandle,
    rng: SmallRng,
    next_ephemeral: Port,
    counters: TcpCounters,
}

impl Tcp {
    pub fn new(cfg: TcpConfig, local_addr: Ipv4Address) -> Self {
        let mut rng = match cfg.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_os_rng(),
        };
        let next_ephemeral = rng.random_range(1024..=65535);
        Tcp {
            cfg: Rc::new(cfg),
            local_addr,
            conns: HashMap::new(),
            listeners: HashMap::new(),
            service_queue: Rc::new(RefCell::new(VecDeque::new())),
            rng,
            next_ephemeral,
            counters: TcpCounters::default(),
        }
    }

    pub fn counters(&self) -> TcpCounters {
        self.counters
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Look up the handle for a flow, if registered.
    pub fn lookup(&self, flow: &Flow) -> Option<Connection> {
        self.conns.get(flow).cloned()
    }

    /// Bind a listener.
    pub fn listen(&mut self, port: Port) -> Result<Listener, TcpError> {
        if self.listeners.contains_key(&port) {
            return Err(TcpError::PortInUse(port));
        }
        let listener = Listener::new(port);
        self.listeners.insert(port, listener.clone());
        debug!(port, "listening");
        Ok(listener)
    }

    /// Active open. The SYN leaves on the next poll.
    pub fn connect(
        &mut self,
        remote: Socket,
        on_connect: impl FnMut(&Connection) + 'static,
    ) -> Result<Connection, TcpError> {
        let port = self.free_port(&remote)?;
        let flow = Flow::new(Socket::new(self.local_addr, port), remote);
        let iss = TcpSeqNumber(self.rng.random());
        let mut conn = Conn::new(flow, Rc::clone(&self.cfg), iss, false);
        conn.open_active();
        conn.on_connect = Some(Box::new(on_connect));

        let handle = Connection::new(conn, Rc::clone(&self.service_queue));
        self.conns.insert(flow, handle.clone());
        self.service_queue.borrow_mut().push_back(flow);
        self.counters.active_opens += 1;
        debug!(%flow, "active open");
        Ok(handle)
    }

    /// Monotonic ephemeral allocation in [1024, 65535], skipping bound
    /// listeners and colliding flows.
    fn free_port(&mut self, remote: &Socket) -> Result<Port, TcpError> {
        for _ in 0..=(65535 - 1024) {
            let port = self.next_ephemeral;
            self.next_ephemeral =
                if self.next_ephemeral >= 65535 { 1024 } else { self.next_ephemeral + 1 };
            if self.listeners.contains_key(&port) {
                continue;
            }
            let flow = Flow::new(Socket::new(self.local_addr, port), *remote);
            if self.conns.contains_key(&flow) {
                continue;
            }
            return Ok(port);
        }
        Err(TcpError::NoPorts)
    }

    // ---- datapath --------------------------------------------------------

    /// One TCP segment up from the IP layer.
    pub(crate) fn receive(
        &mut self,
        delivery: &Delivery,
        now: Instant,
        pool: &BufferPool,
        caps: &ChecksumCapabilities,
        timers: &mut Timers<TimerEvent>,
    ) -> Vec<IpTx> {
        let repr = match TcpPacket::new_checked(delivery.payload())
            .and_then(|pkt| TcpRepr::parse(&pkt, &delivery.src.into(), &delivery.dst.into(), caps))
        {
            Ok(repr) => repr,
            Err(_) => {
                self.counters.dropped += 1;
                return Vec::new();
            }
        };
        self.counters.segments_rx += 1;

        let flow = Flow::new(
            Socket::new(delivery.dst, repr.dst_port),
            Socket::new(delivery.src, repr.src_port),
        );
        trace!(%flow, seq = repr.seq_number.0, len = repr.payload.len(), "tcp rx");

        if let Some(handle) = self.conns.get(&flow).cloned() {
            return self.drive(&handle, now, pool, caps, timers, true, |conn, ctx, out| {
                conn.segment_arrives(&repr, ctx, out)
            });
        }

        // No flow: maybe a listener wants it.
        let listener_open = self
            .listeners
            .get(&flow.local.port)
            .is_some_and(|l| !l.inner.borrow().closed);
        if repr.control == TcpControl::Syn && repr.ack_number.is_none() && listener_open {
            let half_open = self
                .conns
                .values()
                .filter(|c| {
                    c.state() == State::SynRcvd && c.local().port == flow.local.port
                })
                .count();
            if half_open >= self.cfg.max_syn_backlog {
                debug!(%flow, half_open, "SYN backlog full, dropping");
                self.counters.dropped += 1;
                return Vec::new();
            }

            let iss = TcpSeqNumber(self.rng.random());
            let mut conn = Conn::new(flow, Rc::clone(&self.cfg), iss, true);
            conn.open_passive();
            let handle = Connection::new(conn, Rc::clone(&self.service_queue));
            self.conns.insert(flow, handle.clone());
            return self.drive(&handle, now, pool, caps, timers, true, |conn, ctx, out| {
                conn.segment_arrives(&repr, ctx, out)
            });
        }

        // Nobody home: answer with a reset.
        let mut txs = Vec::new();
        if repr.control != TcpControl::Rst
            && let Some(tx) = reset_for(&repr, &flow, pool, caps)
        {
            self.counters.resets_tx += 1;
            self.counters.segments_tx += 1;
            txs.push(tx);
        }
        txs
    }

    /// Flush every connection with pending transmit work.
    pub(crate) fn service(
        &mut self,
        now: Instant,
        pool: &BufferPool,
        caps: &ChecksumCapabilities,
        timers: &mut Timers<TimerEvent>,
    ) -> Vec<IpTx> {
        let mut txs = Vec::new();
        loop {
            let next = self.service_queue.borrow_mut().pop_front();
            let Some(flow) = next else { break };
            let Some(handle) = self.conns.get(&flow).cloned() else { continue };
            txs.extend(self.drive(&handle, now, pool, caps, timers, false, |conn, ctx, out| {
                conn.service(ctx, out)
            }));
        }
        self.listeners.retain(|_, listener| !listener.inner.borrow().closed);
        txs
    }

    /// A per-connection timer fired. Stale flows are ignored.
    pub(crate) fn handle_timer(
        &mut self,
        flow: Flow,
        kind: TcpTimer,
        now: Instant,
        pool: &BufferPool,
        caps: &ChecksumCapabilities,
        timers: &mut Timers<TimerEvent>,
    ) -> Vec<IpTx> {
        let Some(handle) = self.conns.get(&flow).cloned() else {
            return Vec::new();
        };
        self.drive(&handle, now, pool, caps, timers, true, |conn, ctx, out| {
            conn.handle_timer(kind, ctx, out)
        })
    }

    /// Run one operation against a connection, fire the callbacks it
    /// produced, apply deferred closes, then (optionally) run a service
    /// pass to flush whatever the operation and the callbacks left pending.
    fn drive<F>(
        &mut self,
        handle: &Connection,
        now: Instant,
        pool: &BufferPool,
        caps: &ChecksumCapabilities,
        timers: &mut Timers<TimerEvent>,
        post_service: bool,
        op: F,
    ) -> Vec<IpTx>
    where
        F: FnOnce(&mut Conn, &mut TcpCtx<'_>, &mut ConnOutput),
    {
        let mut out = ConnOutput::default();
        let flow = {
            let mut conn = handle.inner.borrow_mut();
            conn.busy = true;
            let mut ctx = TcpCtx { now, pool, caps, timers };
            op(&mut conn, &mut ctx, &mut out);
            conn.flow
        };
        self.counters.bytes_sacked += out.bytes_sacked;
        self.fire_callbacks(handle, out.cbs);

        let deferred = {
            let mut conn = handle.inner.borrow_mut();
            conn.busy = false;
            std::mem::take(&mut conn.deferred_close)
        };
        if deferred {
            let _ = handle.inner.borrow_mut().close_requested();
            // Make sure the resulting FIN is flushed even when this drive
            // skips its own service pass.
            self.service_queue.borrow_mut().push_back(flow);
        }

        let mut txs = out.tx;
        let mut remove = out.remove;
        if post_service && !remove {
            let mut out2 = ConnOutput::default();
            {
                let mut conn = handle.inner.borrow_mut();
                conn.busy = true;
                let mut ctx = TcpCtx { now, pool, caps, timers };
                conn.service(&mut ctx, &mut out2);
                conn.busy = false;
            }
            self.fire_callbacks(handle, out2.cbs);
            txs.extend(out2.tx);
            remove |= out2.remove;
        }

        if remove {
            self.conns.remove(&flow);
            debug!(%flow, "flow removed from registry");
        }
        self.counters.segments_tx += txs.len() as u64;
        txs
    }

    fn fire_callbacks(&mut self, handle: &Connection, cbs: Vec<DeferredCb>) {
        for deferred in cbs {
            match deferred {
                DeferredCb::Connect => {
                    let cb = handle.inner.borrow_mut().on_connect.take();
                    if let Some(mut cb) = cb {
                        cb(handle);
                        let mut conn = handle.inner.borrow_mut();
                        if conn.on_connect.is_none() {
                            conn.on_connect = Some(cb);
                        }
                    }
                }
                DeferredCb::Accept => {
                    self.counters.passive_opens += 1;
                    let port = handle.local().port;
                    let cb = self
                        .listeners
                        .get(&port)
                        .and_then(|l| l.inner.borrow_mut().on_connect.take());
                    if let Some(mut cb) = cb {
                        cb(handle);
                        if let Some(listener) = self.listeners.get(&port) {
                            let mut inner = listener.inner.borrow_mut();
                            if inner.on_connect.is_none() {
                                inner.on_connect = Some(cb);
                            }
                        }
                    }
                }
                DeferredCb::Read(data) => {
                    let cb = handle.inner.borrow_mut().on_read.take();
                    match cb {
                        Some(mut cb) => {
                            let chunk = handle.inner.borrow().read_chunk();
                            if chunk == 0 || data.len() <= chunk {
                                cb(&data);
                            } else {
                                for part in data.chunks(chunk) {
                                    cb(part);
                                }
                            }
                            let mut conn = handle.inner.borrow_mut();
                            if conn.on_read.is_none() {
                                conn.on_read = Some(cb);
                            }
                        }
                        None => {
                            // The callback vanished mid-flight; keep the
                            // bytes readable.
                            handle.inner.borrow_mut().push_read_buffer(data);
                        }
                    }
                }
                DeferredCb::Data => {
                    let cb = handle.inner.borrow_mut().on_data.take();
                    if let Some(mut cb) = cb {
                        cb(handle);
                        let mut conn = handle.inner.borrow_mut();
                        if conn.on_data.is_none() {
                            conn.on_data = Some(cb);
                        }
                    }
                }
                DeferredCb::Write(n) => {
                    let cb = handle.inner.borrow_mut().on_write.take();
                    if let Some(mut cb) = cb {
                        cb(n);
                        let mut conn = handle.inner.borrow_mut();
                        if conn.on_write.is_none() {
                            conn.on_write = Some(cb);
                        }
                    }
                }
                DeferredCb::Disconnect(reason) => {
                    let cb = handle.inner.borrow_mut().on_disconnect.take();
                    if let Some(mut cb) = cb {
                        cb(handle, reason);
                        let mut conn = handle.inner.borrow_mut();
                        if conn.on_disconnect.is_none() {
                            conn.on_disconnect = Some(cb);
                        }
                    }
                }
                DeferredCb::Close => {
                    let cb = handle.inner.borrow_mut().on_close.take();
                    if let Some(mut cb) = cb {
                        cb();
                        let mut conn = handle.inner.borrow_mut();
                        if conn.on_close.is_none() {
                            conn.on_close = Some(cb);
                        }
                    }
                }
            }
        }
    }
}

/// RFC 793 reset generation when no connection exists for a segment.
fn reset_for(
    repr: &TcpRepr<'_>,
    flow: &Flow,
    pool: &BufferPool,
    caps: &ChecksumCapabilities,
) -> Option<IpTx> {
    let buf = pool.acquire()?;
    let mut frame = Frame::new_tx(buf);

    let (seq, ack) = match repr.ack_number {
        Some(ack) => (ack, None),
        None => {
            let len = repr.payload.len() + repr.control.len();
            (TcpSeqNumber(0), Some(repr.seq_number + len))
        }
    };
    let reset = TcpRepr {
        src_port: flow.local.port,
        dst_port: flow.remote.port,
        control: TcpControl::Rst,
        seq_number: seq,
        ack_number: ack,
        window_len: 0,
        window_scale: None,
        max_seg_size: None,
        sack_permitted: false,
        sack_ranges: [None; 3],
        timestamp: None,
        payload: &[],
    };
    let data = frame.append(reset.buffer_len());
    reset.emit(
        &mut TcpPacket::new_unchecked(data),
        &flow.local.addr.into(),
        &flow.remote.addr.into(),
        caps,
    );
    Some(IpTx::new(frame, flow.local.addr, flow.remote.addr, IpProtocol::Tcp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BUFFER_SIZE;
    use smoltcp::time::Duration;

    const A_IP: Ipv4Address = Ipv4Address::new(10, 0, 0, 1);
    const B_IP: Ipv4Address = Ipv4Address::new(10, 0, 0, 2);

    /// Two engines wired back to back; segments are carried as deliveries
    /// without a real IP layer underneath.
    struct Pair {
        a: Tcp,
        b: Tcp,
        timers_a: Timers<TimerEvent>,
        timers_b: Timers<TimerEvent>,
        pool: BufferPool,
        caps: ChecksumCapabilities,
        now: Instant,
        /// Drop the next n segments in the a -> b direction.
        drop_a_to_b: usize,
    }

    impl Pair {
        fn new() -> Self {
            let cfg = TcpConfig::default().seed(42);
            Pair {
                a: Tcp::new(cfg.clone(), A_IP),
                b: Tcp::new(cfg.seed(43), B_IP),
                timers_a: Timers::new(),
                timers_b: Timers::new(),
                pool: BufferPool::new(64, BUFFER_SIZE),
                caps: ChecksumCapabilities::default(),
                now: Instant::from_millis(0),
                drop_a_to_b: 0,
            }
        }

        /// Move segments in both directions, walking the clock a
        /// millisecond per round so delayed ACKs drain; bounded well below
        /// the first retransmission timeout.
        fn pump(&mut self) {
            for _ in 0..128 {
                self.move_frames();
                self.now += Duration::from_millis(1);
                self.fire_timers();
            }
        }

        fn move_frames(&mut self) {
            let txs = self.a.service(self.now, &self.pool, &self.caps, &mut self.timers_a);
            for tx in txs {
                if self.drop_a_to_b > 0 {
                    self.drop_a_to_b -= 1;
                    continue;
                }
                self.deliver_to_b(tx);
            }
            let txs = self.b.service(self.now, &self.pool, &self.caps, &mut self.timers_b);
            for tx in txs {
                self.deliver_to_a(tx);
            }
        }

        fn fire_timers(&mut self) {
            for ev in self.timers_a.expire(self.now) {
                if let TimerEvent::Tcp { flow, kind } = ev {
                    let txs = self.a.handle_timer(
                        flow,
                        kind,
                        self.now,
                        &self.pool,
                        &self.caps,
                        &mut self.timers_a,
                    );
                    for tx in txs {
                        if self.drop_a_to_b > 0 {
                            self.drop_a_to_b -= 1;
                            continue;
                        }
                        self.deliver_to_b(tx);
                    }
                }
            }
            for ev in self.timers_b.expire(self.now) {
                if let TimerEvent::Tcp { flow, kind } = ev {
                    let txs = self.b.handle_timer(
                        flow,
                        kind,
                        self.now,
                        &self.pool,
                        &self.caps,
                        &mut self.timers_b,
                    );
                    for tx in txs {
                        self.deliver_to_a(tx);
                    }
                }
            }
        }

        fn deliver_to_b(&mut self, tx: IpTx) {
            let delivery = Delivery::from_frame(tx.src, tx.dst, tx.proto, tx.frame);
            let replies =
                self.b.receive(&delivery, self.now, &self.pool, &self.caps, &mut self.timers_b);
            for reply in replies {
                self.deliver_to_a(reply);
            }
        }

        fn deliver_to_a(&mut self, tx: IpTx) {
            let delivery = Delivery::from_frame(tx.src, tx.dst, tx.proto, tx.frame);
            let replies =
                self.a.receive(&delivery, self.now, &self.pool, &self.caps, &mut self.timers_a);
            for reply in replies {
                self.deliver_to_b(reply);
            }
        }

        /// Jump time forward, firing due timers, then let the fallout
        /// settle.
        fn advance(&mut self, by: Duration) {
            self.now += by;
            self.fire_timers();
            self.pump();
        }

        /// Handshake a -> b:80 and return both ends.
        fn establish(&mut self) -> (Connection, Rc<RefCell<Option<Connection>>>) {
            let accepted: Rc<RefCell<Option<Connection>>> = Rc::new(RefCell::new(None));
            let listener = self.b.listen(80).unwrap();
            let accepted_in = Rc::clone(&accepted);
            listener.on_connect(move |conn| {
                *accepted_in.borrow_mut() = Some(conn.clone());
            });

            let client = self.a.connect(Socket::new(B_IP, 80), |_| {}).unwrap();
            self.pump();
            assert_eq!(client.state(), State::Established);
            assert!(accepted.borrow().is_some());
            (client, accepted)
        }
    }

    #[test]
    fn test_three_way_handshake() {
        let mut pair = Pair::new();
        let connected = Rc::new(RefCell::new(false));

        let listener = pair.b.listen(80).unwrap();
        let server_seen = Rc::new(RefCell::new(false));
        let server_seen_in = Rc::clone(&server_seen);
        listener.on_connect(move |conn| {
            assert!(conn.is_connected());
            *server_seen_in.borrow_mut() = true;
        });

        let connected_in = Rc::clone(&connected);
        let client = pair
            .a
            .connect(Socket::new(B_IP, 80), move |conn| {
                assert!(conn.is_connected());
                *connected_in.borrow_mut() = true;
            })
            .unwrap();

        assert_eq!(client.state(), State::SynSent);
        pair.pump();

        assert_eq!(client.state(), State::Established);
        assert!(*connected.borrow());
        assert!(*server_seen.borrow());
        assert_eq!(pair.a.connection_count(), 1);
        assert_eq!(pair.b.connection_count(), 1);
        assert_eq!(pair.a.counters().active_opens, 1);
        assert_eq!(pair.b.counters().passive_opens, 1);
    }

    #[test]
    fn test_data_roundtrip_and_on_write() {
        let mut pair = Pair::new();
        let (client, accepted) = pair.establish();

        let received: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        let received_in = Rc::clone(&received);
        accepted.borrow().as_ref().unwrap().on_read(4096, move |data| {
            received_in.borrow_mut().extend_from_slice(data);
        });

        let written: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));
        let written_in = Rc::clone(&written);
        client.on_write(move |n| written_in.borrow_mut().push(n));

        let payload: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        client.write(payload.clone()).unwrap();
        pair.pump();

        assert_eq!(received.borrow().as_slice(), payload.as_slice());
        assert_eq!(written.borrow().as_slice(), &[5000]);
    }

    #[test]
    fn test_write_before_established_is_queued() {
        let mut pair = Pair::new();
        let listener = pair.b.listen(80).unwrap();
        let received: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        let received_in = Rc::clone(&received);
        listener.on_connect(move |conn| {
            let sink = Rc::clone(&received_in);
            conn.on_read(4096, move |data| sink.borrow_mut().extend_from_slice(data));
        });

        let client = pair.a.connect(Socket::new(B_IP, 80), |_| {}).unwrap();
        client.write(b"early".to_vec()).unwrap();
        pair.pump();

        assert_eq!(received.borrow().as_slice(), b"early");
    }

    #[test]
    fn test_syn_to_closed_port_gets_reset() {
        let mut pair = Pair::new();
        let refused = Rc::new(RefCell::new(None));
        let refused_in = Rc::clone(&refused);
        let client = pair.a.connect(Socket::new(B_IP, 81), |_| {}).unwrap();
        client.on_disconnect(move |_, reason| {
            *refused_in.borrow_mut() = Some(reason);
        });
        pair.pump();

        assert_eq!(client.state(), State::Closed);
        assert_eq!(*refused.borrow(), Some(DisconnectReason::Reset));
        assert_eq!(pair.a.connection_count(), 0);
        assert_eq!(pair.b.counters().resets_tx, 1);
    }

    #[test]
    fn test_graceful_close_both_sides() {
        let mut pair = Pair::new();
        let (client, accepted) = pair.establish();
        let server = accepted.borrow().clone().unwrap();

        client.close().unwrap();
        assert_eq!(client.state(), State::FinWait1);
        pair.pump();

        // Passive side sees the FIN, may still write, then closes.
        assert_eq!(server.state(), State::CloseWait);
        assert_eq!(client.state(), State::FinWait2);

        server.close().unwrap();
        assert_eq!(server.state(), State::LastAck);
        pair.pump();

        assert_eq!(server.state(), State::Closed);
        assert_eq!(pair.b.connection_count(), 0);
        assert_eq!(client.state(), State::TimeWait);

        // 2 MSL later the active closer's flow is forgotten.
        assert_eq!(pair.a.connection_count(), 1);
        pair.advance(TcpConfig::default().msl * 2 + Duration::from_millis(1));
        assert_eq!(pair.a.connection_count(), 0);
    }

    #[test]
    fn test_close_wait_can_still_write() {
        let mut pair = Pair::new();
        let (client, accepted) = pair.establish();
        let server = accepted.borrow().clone().unwrap();

        let received: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        let received_in = Rc::clone(&received);
        client.on_read(4096, move |data| {
            received_in.borrow_mut().extend_from_slice(data);
        });

        client.close().unwrap();
        pair.pump();
        assert_eq!(server.state(), State::CloseWait);

        server.write(b"parting words".to_vec()).unwrap();
        pair.pump();
        assert_eq!(received.borrow().as_slice(), b"parting words");
    }

    #[test]
    fn test_abort_sends_reset() {
        let mut pair = Pair::new();
        let (client, accepted) = pair.establish();
        let server = accepted.borrow().clone().unwrap();

        let reset_seen = Rc::new(RefCell::new(None));
        let reset_in = Rc::clone(&reset_seen);
        server.on_disconnect(move |_, reason| {
            *reset_in.borrow_mut() = Some(reason);
        });

        client.abort();
        assert_eq!(client.state(), State::Closed);
        pair.pump();

        assert_eq!(*reset_seen.borrow(), Some(DisconnectReason::Reset));
        assert_eq!(server.state(), State::Closed);
        assert_eq!(pair.a.connection_count(), 0);
        assert_eq!(pair.b.connection_count(), 0);
    }

    #[test]
    fn test_retransmission_recovers_loss() {
        let mut pair = Pair::new();
        let (client, accepted) = pair.establish();

        let received: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        let received_in = Rc::clone(&received);
        accepted.borrow().as_ref().unwrap().on_read(4096, move |data| {
            received_in.borrow_mut().extend_from_slice(data);
        });

        pair.drop_a_to_b = 1;
        client.write(b"lost then found".to_vec()).unwrap();
        pair.pump();
        assert!(received.borrow().is_empty());

        // First RTO is one second.
        pair.advance(Duration::from_millis(1100));
        assert_eq!(received.borrow().as_slice(), b"lost then found");
    }

    #[test]
    fn test_retransmission_budget_timeout() {
        let mut pair = Pair::new();
        let timed_out = Rc::new(RefCell::new(None));
        let timed_out_in = Rc::clone(&timed_out);

        // Connect somewhere that never answers: drop everything a sends.
        let client = pair.a.connect(Socket::new(B_IP, 80), |_| {}).unwrap();
        client.on_disconnect(move |_, reason| {
            *timed_out_in.borrow_mut() = Some(reason);
        });
        pair.drop_a_to_b = usize::MAX;

        // SYN retransmissions back off exponentially, capped at 60s; walk
        // far enough to exhaust the budget of 15.
        pair.pump();
        for _ in 0..(15 * 60) {
            pair.advance(Duration::from_secs(1));
            if timed_out.borrow().is_some() {
                break;
            }
        }

        assert_eq!(*timed_out.borrow(), Some(DisconnectReason::Timeout));
        assert_eq!(client.state(), State::Closed);
        assert_eq!(pair.a.connection_count(), 0);
    }

    #[test]
    fn test_deferred_close_inside_callback() {
        let mut pair = Pair::new();
        let (client, accepted) = pair.establish();
        let server = accepted.borrow().clone().unwrap();

        // Server closes from within its read callback; the close must be
        // deferred, not re-entrant.
        let server_for_cb = server.clone();
        server.on_read(4096, move |_| {
            server_for_cb.close().unwrap();
        });

        client.write(b"trigger".to_vec()).unwrap();
        pair.pump();

        assert!(server.state().is_closing() || server.state().is_closed());
    }

    #[test]
    fn test_listener_close_refuses_new_syn() {
        let mut pair = Pair::new();
        let listener = pair.b.listen(80).unwrap();
        listener.close();
        // The listener map is pruned on the next service pass.
        pair.b.service(pair.now, &pair.pool, &pair.caps, &mut pair.timers_b);
        assert_eq!(pair.b.listener_count(), 0);

        let client = pair.a.connect(Socket::new(B_IP, 80), |_| {}).unwrap();
        pair.pump();
        assert_eq!(client.state(), State::Closed);
    }

    #[test]
    fn test_listen_port_in_use() {
        let mut pair = Pair::new();
        let _l = pair.b.listen(80).unwrap();
        assert_eq!(pair.b.listen(80), Err(TcpError::PortInUse(80)));
    }

    #[test]
    fn test_ephemeral_ports_skip_listeners() {
        let cfg = TcpConfig::default().seed(7);
        let mut tcp = Tcp::new(cfg, A_IP);
        let remote = Socket::new(B_IP, 80);

        // Bind every port the allocator would hand out first.
        let first = tcp.next_ephemeral;
        tcp.listen(first).unwrap();
        let conn = tcp.connect(remote, |_| {}).unwrap();
        assert_ne!(conn.local().port, first);
        assert!(conn.local().port >= 1024);
    }

    #[test]
    fn test_write_in_invalid_state_errors() {
        let mut pair = Pair::new();
        let (client, _accepted) = pair.establish();
        client.close().unwrap();
        pair.pump();
        assert!(matches!(client.write(b"late".to_vec()), Err(TcpError::InvalidState(_))));
    }
}
