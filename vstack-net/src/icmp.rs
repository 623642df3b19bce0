//! ICMPv4 echo responder. Everything that is not an echo request addressed
//! to us is counted and dropped.

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{Icmpv4Packet, Icmpv4Repr, IpProtocol};
use tracing::trace;

use crate::buffer::{BufferPool, Frame};
use crate::ip4::{Delivery, IpTx};

#[derive(Debug, Default, Clone, Copy)]
pub struct IcmpCounters {
    pub echo_requests_rx: u64,
    pub echo_replies_tx: u64,
    pub dropped: u64,
}

#[derive(Default)]
pub struct Icmp {
    counters: IcmpCounters,
}

impl Icmp {
    pub fn new() -> Self {
        Icmp { counters: IcmpCounters::default() }
    }

    pub fn counters(&self) -> IcmpCounters {
        self.counters
    }

    /// Answer an echo request; `None` for everything else.
    pub fn receive(
        &mut self,
        delivery: &Delivery,
        pool: &BufferPool,
        caps: &ChecksumCapabilities,
    ) -> Option<IpTx> {
        let repr = match Icmpv4Packet::new_checked(delivery.payload())
            .and_then(|pkt| Icmpv4Repr::parse(&pkt, caps))
        {
            Ok(repr) => repr,
            Err(_) => {
                self.counters.dropped += 1;
                return None;
            }
        };

        match repr {
            Icmpv4Repr::EchoRequest { ident, seq_no, data } => {
                self.counters.echo_requests_rx += 1;
                trace!(src = %delivery.src, ident, seq_no, "echo request");

                let Some(buf) = pool.acquire() else {
                    self.counters.dropped += 1;
                    return None;
                };
                let mut frame = Frame::new_tx(buf);
                let reply = Icmpv4Repr::EchoReply { ident, seq_no, data };
                let payload = frame.append(reply.buffer_len());
                reply.emit(&mut Icmpv4Packet::new_unchecked(payload), caps);

                self.counters.echo_replies_tx += 1;
                Some(IpTx::new(frame, delivery.dst, delivery.src, IpProtocol::Icmp))
            }
            _ => {
                self.counters.dropped += 1;
                None
            }
        }
    }
}
