//! Device-side model of a split virtqueue and a fake virtio-net transport.
//!
//! [`DeviceQueue`] plays the role of the device: it pops published
//! available entries, reads and writes the guest buffers they point at,
//! and completes them through the used ring. [`FakeTransport`] wires three
//! device queues behind the [`Transport`] register interface so the real
//! driver can be exercised end to end in-process.

use std::collections::VecDeque;
use std::ptr;

use crate::virtio::queue::{VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE, VIRTQ_USED_F_NO_NOTIFY};
use crate::virtio::transport::Transport;
use crate::virtio::{VIRTIO_F_VERSION_1, VIRTIO_NET_F_MAC, VIRTIO_NET_F_STATUS};

const DESC_SIZE: u64 = 16;

/// One descriptor chain as the device sees it: (addr, len,
/// device_writable) per element.
pub struct DeviceChain {
    pub head: u16,
    pub elems: Vec<(u64, u32, bool)>,
}

/// The device side of one virtqueue, addressed by the ring addresses the
/// driver programmed.
pub struct DeviceQueue {
    desc: u64,
    avail: u64,
    used: u64,
    size: u16,
    last_avail: u16,
}

impl DeviceQueue {
    pub fn attach(desc: u64, avail: u64, used: u64, size: u16) -> Self {
        DeviceQueue { desc, avail, used, size, last_avail: 0 }
    }

    fn read_u16(addr: u64) -> u16 {
        // SAFETY: test-only access to ring memory in this process
        unsafe { ptr::read_volatile(addr as *const u16) }
    }

    fn write_u16(addr: u64, value: u16) {
        // SAFETY: test-only access to ring memory in this process
        unsafe { ptr::write_volatile(addr as *mut u16, value) }
    }

    fn read_u32(addr: u64) -> u32 {
        // SAFETY: test-only access to ring memory in this process
        unsafe { ptr::read_volatile(addr as *const u32) }
    }

    fn write_u32(addr: u64, value: u32) {
        // SAFETY: test-only access to ring memory in this process
        unsafe { ptr::write_volatile(addr as *mut u32, value) }
    }

    fn read_u64(addr: u64) -> u64 {
        // SAFETY: test-only access to ring memory in this process
        unsafe { ptr::read_volatile(addr as *const u64) }
    }

    pub fn avail_flags(&self) -> u16 {
        Self::read_u16(self.avail)
    }

    /// Entries published and not yet consumed by the device.
    pub fn available(&self) -> u16 {
        Self::read_u16(self.avail + 2).wrapping_sub(self.last_avail)
    }

    /// Consume the next published chain, if any.
    pub fn pop_avail(&mut self) -> Option<DeviceChain> {
        if self.available() == 0 {
            return None;
        }
        let slot = (self.last_avail % self.size) as u64;
        let head = Self::read_u16(self.avail + 4 + 2 * slot);
        self.last_avail = self.last_avail.wrapping_add(1);

        let mut elems = Vec::new();
        let mut idx = head;
        loop {
            let base = self.desc + idx as u64 * DESC_SIZE;
            let addr = Self::read_u64(base);
            let len = Self::read_u32(base + 8);
            let flags = Self::read_u16(base + 12);
            elems.push((addr, len, flags & VIRTQ_DESC_F_WRITE != 0));
            if flags & VIRTQ_DESC_F_NEXT == 0 {
                break;
            }
            idx = Self::read_u16(base + 14);
        }
        Some(DeviceChain { head, elems })
    }

    /// Complete a chain through the used ring.
    pub fn push_used(&mut self, head: u16, len: u32) {
        let used_idx = Self::read_u16(self.used + 2);
        let slot = (used_idx % self.size) as u64;
        Self::write_u32(self.used + 4 + 8 * slot, head as u32);
        Self::write_u32(self.used + 4 + 8 * slot + 4, len);
        Self::write_u16(self.used + 2, used_idx.wrapping_add(1));
    }

    pub fn set_no_notify(&mut self, on: bool) {
        Self::write_u16(self.used, if on { VIRTQ_USED_F_NO_NOTIFY } else { 0 });
    }

    /// Read `len` bytes of guest memory at `addr`.
    pub fn read_buf(addr: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        for (i, byte) in out.iter_mut().enumerate() {
            // SAFETY: test-only access to frame memory in this process
            *byte = unsafe { ptr::read_volatile((addr + i as u64) as *const u8) };
        }
        out
    }

    /// Write bytes into guest memory at `addr`.
    pub fn write_buf(addr: u64, data: &[u8]) {
        for (i, &byte) in data.iter().enumerate() {
            // SAFETY: test-only access to frame memory in this process
            unsafe { ptr::write_volatile((addr + i as u64) as *mut u8, byte) };
        }
    }
}

struct QueueSlot {
    max_size: u16,
    device: Option<DeviceQueue>,
}

/// An in-process virtio-net device behind the [`Transport`] interface.
///
/// TX chains are consumed on notify (virtio header stripped, payload
/// recorded in `sent`); RX frames are injected with [`push_rx`].
///
/// [`push_rx`]: FakeTransport::push_rx
pub struct FakeTransport {
    /// Feature set the device offers; adjustable before bring-up.
    pub offered_features: u64,
    driver_features: u64,
    status: u8,
    selected_queue: u16,
    queues: Vec<QueueSlot>,
    notifies: Vec<u32>,
    isr: u8,
    mac: [u8; 6],
    sent: Vec<Vec<u8>>,
    rx_overflow: VecDeque<Vec<u8>>,
}

impl FakeTransport {
    pub fn new(mac: [u8; 6]) -> Self {
        FakeTransport {
            offered_features: VIRTIO_F_VERSION_1 | VIRTIO_NET_F_MAC | VIRTIO_NET_F_STATUS,
            driver_features: 0,
            status: 0,
            selected_queue: 0,
            queues: (0..3).map(|_| QueueSlot { max_size: 256, device: None }).collect(),
            notifies: vec![0; 3],
            isr: 0,
            mac,
            sent: Vec::new(),
            rx_overflow: VecDeque::new(),
        }
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn driver_features(&self) -> u64 {
        self.driver_features
    }

    pub fn notify_count(&self, queue: u16) -> u32 {
        self.notifies[queue as usize]
    }

    /// Packets the device has "put on the wire", virtio header stripped.
    pub fn take_sent(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.sent)
    }

    /// RX buffers the driver has made available to the device.
    pub fn rx_buffers_available(&self) -> u16 {
        self.queues[0].device.as_ref().map_or(0, |q| q.available())
    }

    pub fn raise_isr(&mut self, bits: u8) {
        self.isr |= bits;
    }

    /// Deliver one packet into the driver's RX ring: zeroed virtio-net
    /// header into the first descriptor, payload into the second.
    pub fn push_rx(&mut self, packet: &[u8]) {
        let Some(queue) = self.queues[0].device.as_mut() else {
            self.rx_overflow.push_back(packet.to_vec());
            return;
        };
        let Some(chain) = queue.pop_avail() else {
            self.rx_overflow.push_back(packet.to_vec());
            return;
        };
        assert!(chain.elems.len() == 2, "RX chains carry header + payload");
        let (hdr_addr, hdr_len, hdr_writable) = chain.elems[0];
        let (pkt_addr, pkt_len, pkt_writable) = chain.elems[1];
        assert!(hdr_writable && pkt_writable);
        assert!(packet.len() <= pkt_len as usize);

        DeviceQueue::write_buf(hdr_addr, &vec![0u8; hdr_len as usize]);
        DeviceQueue::write_buf(pkt_addr, packet);
        queue.push_used(chain.head, hdr_len + packet.len() as u32);
    }

    fn drain_tx(&mut self) {
        let Some(queue) = self.queues[1].device.as_mut() else { return };
        while let Some(chain) = queue.pop_avail() {
            let mut bytes = Vec::new();
            for &(addr, len, writable) in &chain.elems {
                assert!(!writable, "TX descriptors are device-readable");
                bytes.extend_from_slice(&DeviceQueue::read_buf(addr, len as usize));
            }
            // Strip the virtio-net header.
            self.sent.push(bytes.split_off(12));
            queue.push_used(chain.head, 0);
        }
    }
}

impl Transport for FakeTransport {
    fn device_features(&mut self) -> u64 {
        self.offered_features
    }

    fn set_driver_features(&mut self, features: u64) {
        self.driver_features = features;
    }

    fn device_status(&mut self) -> u8 {
        self.status
    }

    fn set_device_status(&mut self, status: u8) {
        self.status = status;
        if status == 0 {
            for slot in &mut self.queues {
                slot.device = None;
            }
        }
    }

    fn queue_max_size(&mut self, queue: u16) -> u16 {
        self.queues.get(queue as usize).map_or(0, |q| q.max_size)
    }

    fn setup_queue(&mut self, queue: u16, size: u16, desc: u64, avail: u64, used: u64) {
        self.queues[queue as usize].device = Some(DeviceQueue::attach(desc, avail, used, size));
    }

    fn enable_queue(&mut self, _queue: u16) {}

    fn notify(&mut self, queue: u16) {
        self.notifies[queue as usize] += 1;
        if queue == 1 {
            self.drain_tx();
        } else if queue == 0 {
            while !self.rx_overflow.is_empty() && self.rx_buffers_available() > 0 {
                let pending = self.rx_overflow.pop_front().expect("pending packet");
                self.push_rx(&pending);
            }
        }
    }

    fn isr_status(&mut self) -> u8 {
        std::mem::take(&mut self.isr)
    }

    fn read_config(&mut self, offset: usize, buf: &mut [u8]) {
        let mut config = [0u8; 8];
        config[..6].copy_from_slice(&self.mac);
        config[6..8].copy_from_slice(&[1, 0]); // link up
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = config.get(offset + i).copied().unwrap_or(0);
        }
    }
}
