//! virtio-net driver: feature negotiation, RX/TX/control queues, and the
//! [`Nic`] implementation the stack drives.

use smoltcp::wire::EthernetAddress;
use tracing::{debug, trace, warn};

use crate::buffer::{BufferPool, Frame};
use crate::nic::Nic;

use super::queue::{SgElem, Virtqueue};
use super::transport::Transport;
use super::{
    VIRTIO_F_VERSION_1, VIRTIO_NET_F_CSUM, VIRTIO_NET_F_CTRL_VQ, VIRTIO_NET_F_MAC,
    VIRTIO_NET_F_STATUS, VirtioError, status,
};

const RX_QUEUE: u16 = 0;
const TX_QUEUE: u16 = 1;
const CTRL_QUEUE: u16 = 2;

/// Virtio net header size (no mergeable RX buffers).
pub const VIRTIO_NET_HDR_LEN: usize = 12;

/// Largest queue we ask for, regardless of what the device offers.
const MAX_QUEUE_SIZE: u16 = 256;

/// Frames the driver keeps posted on the RX ring. The pool is shared with
/// the whole stack; posting every descriptor would starve the transmit
/// side.
const RX_BUFFER_BUDGET: u16 = 64;

/// Fallback when the device has no VIRTIO_NET_F_MAC.
const DEFAULT_MAC: EthernetAddress = EthernetAddress([0x52, 0x54, 0x00, 0x76, 0x69, 0x6f]);

/// Interrupt routing negotiated at bring-up.
#[derive(Debug, Clone, Copy)]
pub enum IrqMode {
    /// Shared line; the ISR register distinguishes queue from config
    /// events.
    Legacy,
    /// One MSI-X vector per event source.
    Msix { rx_vector: u16, tx_vector: u16, config_vector: u16 },
}

/// What an interrupt meant, for the caller's dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqCause {
    Queue,
    Config,
    Spurious,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct VirtioNetCounters {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
}

pub struct VirtioNet<T: Transport> {
    transport: T,
    rx: Virtqueue,
    tx: Virtqueue,
    /// Negotiated but unused until control commands are needed.
    ctrl: Option<Virtqueue>,
    pool: BufferPool,
    mac: EthernetAddress,
    mtu: u16,
    features: u64,
    irq: IrqMode,
    active: bool,
    rx_posted: u16,
    counters: VirtioNetCounters,
}

impl<T: Transport> VirtioNet<T> {
    /// Bring the device up: reset, negotiate, build queues, pre-fill RX,
    /// announce DRIVER_OK.
    pub fn new(mut transport: T, pool: BufferPool, irq: IrqMode) -> Result<Self, VirtioError> {
        transport.set_device_status(0);
        transport.set_device_status(status::ACKNOWLEDGE);
        transport.set_device_status(status::ACKNOWLEDGE | status::DRIVER);

        let offered = transport.device_features();
        if offered & VIRTIO_F_VERSION_1 == 0 {
            transport.set_device_status(status::FAILED);
            return Err(VirtioError::MissingVersion1);
        }
        let wanted = VIRTIO_F_VERSION_1
            | (offered
                & (VIRTIO_NET_F_CSUM
                    | VIRTIO_NET_F_MAC
                    | VIRTIO_NET_F_STATUS
                    | VIRTIO_NET_F_CTRL_VQ));
        transport.set_driver_features(wanted);
        transport.set_device_status(status::ACKNOWLEDGE | status::DRIVER | status::FEATURES_OK);
        if transport.device_status() & status::FEATURES_OK == 0 {
            transport.set_device_status(status::FAILED);
            return Err(VirtioError::FeaturesRejected);
        }
        debug!(features = format!("{wanted:#x}"), "virtio-net features negotiated");

        let rx = Self::setup_queue(&mut transport, RX_QUEUE)?;
        let tx = Self::setup_queue(&mut transport, TX_QUEUE)?;
        let ctrl = if wanted & VIRTIO_NET_F_CTRL_VQ != 0 {
            Some(Self::setup_queue(&mut transport, CTRL_QUEUE)?)
        } else {
            None
        };

        if let IrqMode::Msix { rx_vector, tx_vector, config_vector } = irq {
            let ok = transport.map_msix_vector(Some(RX_QUEUE), rx_vector)
                && transport.map_msix_vector(Some(TX_QUEUE), tx_vector)
                && transport.map_msix_vector(None, config_vector);
            if !ok {
                warn!("MSI-X unavailable, falling back to legacy interrupts");
            }
        }

        let mac = if wanted & VIRTIO_NET_F_MAC != 0 {
            let mut bytes = [0u8; 6];
            transport.read_config(0, &mut bytes);
            EthernetAddress(bytes)
        } else {
            DEFAULT_MAC
        };

        let mut nic = VirtioNet {
            transport,
            rx,
            tx,
            ctrl,
            pool,
            mac,
            mtu: 1500,
            features: wanted,
            irq,
            active: true,
            rx_posted: 0,
            counters: VirtioNetCounters::default(),
        };
        nic.fill_rx();
        nic.transport.set_device_status(
            status::ACKNOWLEDGE | status::DRIVER | status::FEATURES_OK | status::DRIVER_OK,
        );
        debug!(mac = %nic.mac, "virtio-net up");
        Ok(nic)
    }

    fn setup_queue(transport: &mut T, index: u16) -> Result<Virtqueue, VirtioError> {
        let max = transport.queue_max_size(index);
        if max == 0 {
            return Err(VirtioError::QueueUnavailable(index));
        }
        let size = max.min(MAX_QUEUE_SIZE);
        let vq = Virtqueue::new(size)?;
        transport.setup_queue(index, size, vq.desc_addr(), vq.avail_addr(), vq.used_addr());
        transport.enable_queue(index);
        Ok(vq)
    }

    pub fn features(&self) -> u64 {
        self.features
    }

    pub fn has_ctrl_queue(&self) -> bool {
        self.ctrl.is_some()
    }

    pub fn irq_mode(&self) -> IrqMode {
        self.irq
    }

    pub fn counters(&self) -> VirtioNetCounters {
        self.counters
    }

    /// Direct transport access, for diagnostics and tests.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Classify (and acknowledge) an interrupt on the legacy path. With
    /// MSI-X the vector itself already identifies the source.
    pub fn ack_interrupt(&mut self) -> IrqCause {
        let isr = self.transport.isr_status();
        if isr & 0x1 != 0 {
            IrqCause::Queue
        } else if isr & 0x2 != 0 {
            IrqCause::Config
        } else {
            IrqCause::Spurious
        }
    }

    /// Stop the device and drop every in-flight frame.
    pub fn deactivate(&mut self) {
        self.active = false;
        self.transport.set_device_status(0);
        while self.rx.dequeue().is_some() {}
        while self.tx.dequeue().is_some() {}
        self.rx_posted = 0;
        debug!("virtio-net deactivated");
    }

    /// Keep the RX ring full of device-writable frames: one descriptor for
    /// the virtio-net header, one for the packet.
    fn fill_rx(&mut self) {
        while self.rx_posted < RX_BUFFER_BUDGET && self.rx.free_descriptors() >= 2 {
            let Some(buf) = self.pool.acquire() else {
                break;
            };
            let frame = Frame::new_rx(buf);
            let base = frame.base_addr();
            let capacity = frame.tailroom() as u32;
            let sg = [
                SgElem { addr: base, len: VIRTIO_NET_HDR_LEN as u32, device_writes: true },
                SgElem {
                    addr: base + VIRTIO_NET_HDR_LEN as u64,
                    len: capacity - VIRTIO_NET_HDR_LEN as u32,
                    device_writes: true,
                },
            ];
            if self.rx.enqueue(&sg, frame).is_err() {
                break;
            }
            self.rx_posted += 1;
        }
        if self.rx.kick() {
            self.transport.notify(RX_QUEUE);
        }
    }

    fn reclaim_tx(&mut self) {
        while self.tx.dequeue().is_some() {}
    }
}

impl<T: Transport> Nic for VirtioNet<T> {
    fn mac(&self) -> EthernetAddress {
        self.mac
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn poll(&mut self) -> Option<Frame> {
        if !self.active {
            return None;
        }
        loop {
            let (mut frame, written) = self.rx.dequeue()?;
            self.rx_posted -= 1;
            self.fill_rx();
            let written = written as usize;
            if written <= VIRTIO_NET_HDR_LEN {
                trace!(written, "runt RX completion");
                self.counters.rx_dropped += 1;
                continue;
            }
            // Strip the virtio-net header; the cursor lands on Ethernet.
            frame.set_span(VIRTIO_NET_HDR_LEN, written);
            self.counters.rx_packets += 1;
            return Some(frame);
        }
    }

    fn transmit(&mut self, frame: Frame) {
        if !self.active {
            return;
        }
        self.reclaim_tx();

        let mut next = Some(frame);
        while let Some(mut frame) = next {
            next = frame.take_next();

            // The header shares the frame's buffer, right in front of the
            // packet.
            let hdr = frame.prepend(VIRTIO_NET_HDR_LEN);
            hdr[..VIRTIO_NET_HDR_LEN].fill(0);
            let base = frame.base_addr() + frame.layer_begin() as u64;
            let sg = [
                SgElem { addr: base, len: VIRTIO_NET_HDR_LEN as u32, device_writes: false },
                SgElem {
                    addr: base + VIRTIO_NET_HDR_LEN as u64,
                    len: (frame.payload_len() - VIRTIO_NET_HDR_LEN) as u32,
                    device_writes: false,
                },
            ];
            match self.tx.enqueue(&sg, frame) {
                Ok(_) => self.counters.tx_packets += 1,
                Err(_) => {
                    trace!("TX ring full, dropping frame");
                    self.counters.tx_dropped += 1;
                }
            }
        }
        if self.tx.kick() {
            self.transport.notify(TX_QUEUE);
        }
    }

    fn transmit_queue_available(&self) -> usize {
        // Every packet needs a header descriptor and a payload descriptor.
        self.tx.free_descriptors() as usize / 2
    }
}
