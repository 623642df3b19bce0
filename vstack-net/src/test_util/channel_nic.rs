//! In-memory NIC pairs: what one side transmits, the other polls.
//!
//! Deterministic stand-in for a real device in unit and integration tests.
//! Loss is injected by asking a NIC to drop its next n transmissions.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use smoltcp::wire::EthernetAddress;

use crate::buffer::Frame;
use crate::nic::Nic;

type Wire = Rc<RefCell<VecDeque<Frame>>>;

/// Frames a channel will queue before dropping.
const CHANNEL_CAPACITY: usize = 1024;

pub struct ChannelNic {
    mac: EthernetAddress,
    mtu: u16,
    /// Frames we transmit land here (the peer's receive queue).
    tx: Wire,
    /// Frames the peer transmitted to us.
    rx: Wire,
    drop_next: usize,
    pub tx_frames: u64,
    pub rx_frames: u64,
    pub dropped_frames: u64,
}

/// Two NICs wired back to back.
pub fn channel_pair(mac_a: EthernetAddress, mac_b: EthernetAddress) -> (ChannelNic, ChannelNic) {
    let a_to_b: Wire = Rc::new(RefCell::new(VecDeque::new()));
    let b_to_a: Wire = Rc::new(RefCell::new(VecDeque::new()));
    let a = ChannelNic {
        mac: mac_a,
        mtu: 1500,
        tx: Rc::clone(&a_to_b),
        rx: Rc::clone(&b_to_a),
        drop_next: 0,
        tx_frames: 0,
        rx_frames: 0,
        dropped_frames: 0,
    };
    let b = ChannelNic {
        mac: mac_b,
        mtu: 1500,
        tx: b_to_a,
        rx: a_to_b,
        drop_next: 0,
        tx_frames: 0,
        rx_frames: 0,
        dropped_frames: 0,
    };
    (a, b)
}

impl ChannelNic {
    /// Drop the next `n` frames this NIC would put on the wire.
    pub fn drop_next(&mut self, n: usize) {
        self.drop_next = self.drop_next.saturating_add(n);
    }

    /// Inject a raw frame into this NIC's receive queue, as if it arrived
    /// off the wire.
    pub fn inject(&self, frame: Frame) {
        self.rx.borrow_mut().push_back(frame);
    }

    /// Frames currently in flight toward the peer.
    pub fn pending_tx(&self) -> usize {
        self.tx.borrow().len()
    }
}

impl Nic for ChannelNic {
    fn mac(&self) -> EthernetAddress {
        self.mac
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn transmit(&mut self, frame: Frame) {
        // Chains are delivered frame by frame, in order.
        let mut next = Some(frame);
        while let Some(mut frame) = next {
            next = frame.take_next();
            if self.drop_next > 0 {
                self.drop_next -= 1;
                self.dropped_frames += 1;
                continue;
            }
            let mut wire = self.tx.borrow_mut();
            if wire.len() >= CHANNEL_CAPACITY {
                self.dropped_frames += 1;
                continue;
            }
            wire.push_back(frame);
            self.tx_frames += 1;
        }
    }

    fn poll(&mut self) -> Option<Frame> {
        let frame = self.rx.borrow_mut().pop_front()?;
        self.rx_frames += 1;
        Some(frame)
    }

    fn transmit_queue_available(&self) -> usize {
        CHANNEL_CAPACITY - self.tx.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BUFFER_SIZE, BufferPool};

    fn mac(last: u8) -> EthernetAddress {
        EthernetAddress([2, 0, 0, 0, 0, last])
    }

    #[test]
    fn test_pair_crosses_frames() {
        let pool = BufferPool::new(4, BUFFER_SIZE);
        let (mut a, mut b) = channel_pair(mac(1), mac(2));

        let mut frame = Frame::new_tx(pool.acquire().unwrap());
        frame.append(2).copy_from_slice(b"hi");
        a.transmit(frame);

        assert!(a.poll().is_none());
        assert_eq!(b.poll().unwrap().payload(), b"hi");
        assert!(b.poll().is_none());
    }

    #[test]
    fn test_chain_unchained_in_order() {
        let pool = BufferPool::new(4, BUFFER_SIZE);
        let (mut a, mut b) = channel_pair(mac(1), mac(2));

        let mut chain = Frame::new_tx(pool.acquire().unwrap());
        chain.append(1)[0] = 1;
        let mut two = Frame::new_tx(pool.acquire().unwrap());
        two.append(1)[0] = 2;
        chain.chain(two);

        a.transmit(chain);
        assert_eq!(b.poll().unwrap().payload(), &[1]);
        assert_eq!(b.poll().unwrap().payload(), &[2]);
    }

    #[test]
    fn test_drop_next_loses_frames() {
        let pool = BufferPool::new(4, BUFFER_SIZE);
        let (mut a, mut b) = channel_pair(mac(1), mac(2));
        a.drop_next(1);

        let mut frame = Frame::new_tx(pool.acquire().unwrap());
        frame.append(1)[0] = 9;
        a.transmit(frame);
        assert!(b.poll().is_none());
        assert_eq!(a.dropped_frames, 1);
    }
}
