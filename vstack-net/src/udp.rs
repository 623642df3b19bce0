//! Minimal UDP: port-bound sockets with a receive callback and a
//! fire-and-forget send path.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{IpProtocol, UdpPacket, UdpRepr};
use thiserror::Error;
use tracing::trace;

use crate::buffer::{BufferPool, Frame};
use crate::ip4::{Delivery, IpTx};
use crate::tcp::{Port, Socket};

/// Datagram receive callback: source endpoint and payload.
pub type UdpReceiveCallback = Box<dyn FnMut(Socket, &[u8])>;

const UDP_HEADER_LEN: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UdpError {
    #[error("port {0} already bound")]
    PortInUse(Port),
    #[error("buffer pool exhausted")]
    NoBuffer,
    #[error("datagram too large for one frame")]
    TooBig,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UdpCounters {
    pub datagrams_rx: u64,
    pub datagrams_tx: u64,
    pub dropped: u64,
}

struct UdpSockInner {
    port: Port,
    on_receive: Option<UdpReceiveCallback>,
    closed: bool,
}

/// Handle to a bound UDP port.
#[derive(Clone)]
pub struct UdpSocket {
    inner: Rc<RefCell<UdpSockInner>>,
}

impl UdpSocket {
    pub fn port(&self) -> Port {
        self.inner.borrow().port
    }

    pub fn on_receive(&self, cb: impl FnMut(Socket, &[u8]) + 'static) {
        self.inner.borrow_mut().on_receive = Some(Box::new(cb));
    }

    pub fn close(&self) {
        self.inner.borrow_mut().closed = true;
    }
}

/// UDP demux for one stack.
pub struct Udp {
    sockets: HashMap<Port, UdpSocket>,
    counters: UdpCounters,
}

impl Udp {
    pub fn new() -> Self {
        Udp { sockets: HashMap::new(), counters: UdpCounters::default() }
    }

    pub fn counters(&self) -> UdpCounters {
        self.counters
    }

    pub fn bind(&mut self, port: Port) -> Result<UdpSocket, UdpError> {
        self.sockets.retain(|_, s| !s.inner.borrow().closed);
        if self.sockets.contains_key(&port) {
            return Err(UdpError::PortInUse(port));
        }
        let socket = UdpSocket {
            inner: Rc::new(RefCell::new(UdpSockInner { port, on_receive: None, closed: false })),
        };
        self.sockets.insert(port, socket.clone());
        Ok(socket)
    }

    /// Deliver one datagram to its bound socket, if any.
    pub fn receive(&mut self, delivery: &Delivery, caps: &ChecksumCapabilities) {
        let parsed = UdpPacket::new_checked(delivery.payload()).and_then(|pkt| {
            UdpRepr::parse(&pkt, &delivery.src.into(), &delivery.dst.into(), caps)
                .map(|repr| (repr, pkt.payload().to_vec()))
        });
        let Ok((repr, payload)) = parsed else {
            self.counters.dropped += 1;
            return;
        };

        let Some(socket) = self.sockets.get(&repr.dst_port).cloned() else {
            trace!(port = repr.dst_port, "no UDP socket bound");
            self.counters.dropped += 1;
            return;
        };
        if socket.inner.borrow().closed {
            self.counters.dropped += 1;
            return;
        }

        self.counters.datagrams_rx += 1;
        let src = Socket::new(delivery.src, repr.src_port);

        // Release the borrow before user code runs.
        let cb = socket.inner.borrow_mut().on_receive.take();
        if let Some(mut cb) = cb {
            cb(src, &payload);
            let mut inner = socket.inner.borrow_mut();
            if inner.on_receive.is_none() {
                inner.on_receive = Some(cb);
            }
        }
    }

    /// Build one outgoing datagram.
    pub fn transmit(
        &mut self,
        pool: &BufferPool,
        caps: &ChecksumCapabilities,
        src: Socket,
        dst: Socket,
        data: &[u8],
    ) -> Result<IpTx, UdpError> {
        let buf = pool.acquire().ok_or(UdpError::NoBuffer)?;
        let mut frame = Frame::new_tx(buf);
        if UDP_HEADER_LEN + data.len() > frame.tailroom() {
            return Err(UdpError::TooBig);
        }

        let repr = UdpRepr { src_port: src.port, dst_port: dst.port };
        let total = UDP_HEADER_LEN + data.len();
        let mut pkt = UdpPacket::new_unchecked(frame.append(total));
        repr.emit(
            &mut pkt,
            &src.addr.into(),
            &dst.addr.into(),
            data.len(),
            |payload| payload.copy_from_slice(data),
            caps,
        );

        self.counters.datagrams_tx += 1;
        Ok(IpTx::new(frame, src.addr, dst.addr, IpProtocol::Udp))
    }
}

impl Default for Udp {
    fn default() -> Self {
        Self::new()
    }
}
