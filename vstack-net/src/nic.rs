//! The contract between the stack and a network device.

use smoltcp::wire::EthernetAddress;

use crate::buffer::Frame;

/// A link-layer device the stack can drive.
///
/// `transmit` takes ownership of a whole frame chain; the device walks the
/// chain and puts every frame on the wire in order. `poll` yields received
/// frames one at a time with the cursor at the Ethernet header.
pub trait Nic {
    fn mac(&self) -> EthernetAddress;

    fn mtu(&self) -> u16;

    /// Queue a frame chain for transmission. Devices may drop when their
    /// transmit ring is full; callers check `transmit_queue_available` first.
    fn transmit(&mut self, frame: Frame);

    /// Next received frame, if any.
    fn poll(&mut self) -> Option<Frame>;

    /// Number of frames the transmit path can currently accept.
    fn transmit_queue_available(&self) -> usize;
}
