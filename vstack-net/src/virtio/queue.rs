//! The virtio 1.x split virtqueue, driver side.
//!
//! The three ring regions live in one driver-owned, page-aligned
//! allocation: the descriptor table first, the available ring immediately
//! after it, and the used ring on the next page boundary. All fields are
//! little-endian and accessed volatilely; the device reads and writes the
//! same memory concurrently.
//!
//! Frames handed to `enqueue` are owned by the queue until the device
//! reports them used; `dequeue` returns ownership together with the number
//! of bytes the device wrote.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{Ordering, fence};

use crate::buffer::Frame;

use super::VirtioError;

pub const VIRTQ_DESC_F_NEXT: u16 = 1;
pub const VIRTQ_DESC_F_WRITE: u16 = 2;
pub const VIRTQ_USED_F_NO_NOTIFY: u16 = 1;
pub const VIRTQ_AVAIL_F_NO_INTERRUPT: u16 = 1;

const DESC_SIZE: usize = 16;
const PAGE: usize = 4096;

/// One scatter-gather element for `enqueue`.
#[derive(Debug, Clone, Copy)]
pub struct SgElem {
    pub addr: u64,
    pub len: u32,
    /// Device-writable (RX) rather than device-readable (TX).
    pub device_writes: bool,
}

struct RingMem {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl RingMem {
    fn alloc(bytes: usize) -> Self {
        let layout = Layout::from_size_align(bytes, PAGE).expect("ring layout");
        // SAFETY: non-zero size
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).expect("ring allocation failed");
        RingMem { ptr, layout }
    }

    fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    fn read_u16(&self, offset: usize) -> u16 {
        debug_assert!(offset + 2 <= self.layout.size());
        // SAFETY: offset checked against the allocation size
        unsafe { (self.ptr.as_ptr().add(offset) as *const u16).read_volatile() }
    }

    fn write_u16(&self, offset: usize, value: u16) {
        debug_assert!(offset + 2 <= self.layout.size());
        // SAFETY: offset checked against the allocation size
        unsafe { (self.ptr.as_ptr().add(offset) as *mut u16).write_volatile(value.to_le()) }
    }

    fn read_u32(&self, offset: usize) -> u32 {
        debug_assert!(offset + 4 <= self.layout.size());
        // SAFETY: offset checked against the allocation size
        unsafe { (self.ptr.as_ptr().add(offset) as *const u32).read_volatile() }
    }

    fn write_u32(&self, offset: usize, value: u32) {
        debug_assert!(offset + 4 <= self.layout.size());
        // SAFETY: offset checked against the allocation size
        unsafe { (self.ptr.as_ptr().add(offset) as *mut u32).write_volatile(value.to_le()) }
    }

    fn write_u64(&self, offset: usize, value: u64) {
        debug_assert!(offset + 8 <= self.layout.size());
        // SAFETY: offset checked against the allocation size
        unsafe { (self.ptr.as_ptr().add(offset) as *mut u64).write_volatile(value.to_le()) }
    }
}

impl Drop for RingMem {
    fn drop(&mut self) {
        // SAFETY: allocated with this layout in RingMem::alloc
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

struct InFlight {
    frame: Frame,
    chain_len: u16,
}

pub struct Virtqueue {
    size: u16,
    mem: RingMem,
    avail_off: usize,
    used_off: usize,

    free_head: u16,
    num_free: u16,
    /// Available entries written but not yet published by `kick`.
    num_added: u16,
    /// Shadow of the published avail index.
    avail_shadow: u16,
    /// Our cursor into the used ring.
    last_used: u16,

    slots: Vec<Option<InFlight>>,
}

impl Virtqueue {
    pub fn new(size: u16) -> Result<Self, VirtioError> {
        if size == 0 || !size.is_power_of_two() {
            return Err(VirtioError::BadQueueSize(size));
        }
        let n = size as usize;
        let avail_off = n * DESC_SIZE;
        // flags + idx + ring[n] + used_event
        let avail_bytes = 4 + 2 * n + 2;
        let used_off = (avail_off + avail_bytes).next_multiple_of(PAGE);
        // flags + idx + ring[n]{id,len} + avail_event
        let used_bytes = 4 + 8 * n + 2;
        let total = (used_off + used_bytes).next_multiple_of(PAGE);

        let mem = RingMem::alloc(total);
        let mut vq = Virtqueue {
            size,
            mem,
            avail_off,
            used_off,
            free_head: 0,
            num_free: size,
            num_added: 0,
            avail_shadow: 0,
            last_used: 0,
            slots: (0..n).map(|_| None).collect(),
        };
        // Free descriptors form a chain through their next fields.
        for i in 0..size {
            let next = if i == size - 1 { 0 } else { i + 1 };
            vq.write_desc_next(i, next);
        }
        Ok(vq)
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn free_descriptors(&self) -> u16 {
        self.num_free
    }

    pub fn in_flight(&self) -> u16 {
        self.slots.iter().flatten().map(|s| s.chain_len).sum()
    }

    pub fn desc_addr(&self) -> u64 {
        self.mem.addr()
    }

    pub fn avail_addr(&self) -> u64 {
        self.mem.addr() + self.avail_off as u64
    }

    pub fn used_addr(&self) -> u64 {
        self.mem.addr() + self.used_off as u64
    }

    /// Chain `sg` into descriptors and place the head on the available
    /// ring (unpublished until `kick`). The frame is held until the device
    /// reports the chain used; on ring exhaustion it is handed back.
    pub fn enqueue(&mut self, sg: &[SgElem], frame: Frame) -> Result<u16, Frame> {
        let k = sg.len() as u16;
        if k == 0 || k > self.num_free {
            return Err(frame);
        }

        let head = self.free_head;
        let mut idx = head;
        for (i, elem) in sg.iter().enumerate() {
            let last = i == sg.len() - 1;
            let mut flags = 0;
            if elem.device_writes {
                flags |= VIRTQ_DESC_F_WRITE;
            }
            if !last {
                flags |= VIRTQ_DESC_F_NEXT;
            }
            self.write_desc(idx, elem.addr, elem.len, flags);
            if !last {
                idx = self.desc_next(idx);
            }
        }
        // The last descriptor keeps its next link; the free list resumes
        // there.
        self.free_head = self.desc_next(idx);
        self.num_free -= k;
        self.slots[head as usize] = Some(InFlight { frame, chain_len: k });

        let slot = (self.avail_shadow.wrapping_add(self.num_added) % self.size) as usize;
        self.mem.write_u16(self.avail_off + 4 + 2 * slot, head);
        self.num_added += 1;

        self.debug_check();
        Ok(head)
    }

    /// Publish queued entries. Returns whether the device asked to be
    /// notified; the caller then writes the transport's notify register.
    pub fn kick(&mut self) -> bool {
        if self.num_added == 0 {
            return false;
        }
        fence(Ordering::SeqCst);
        self.avail_shadow = self.avail_shadow.wrapping_add(self.num_added);
        self.mem.write_u16(self.avail_off + 2, self.avail_shadow);
        self.num_added = 0;
        fence(Ordering::SeqCst);
        self.mem.read_u16(self.used_off) & VIRTQ_USED_F_NO_NOTIFY == 0
    }

    /// Pop one completion: the frame and the byte count the device wrote.
    pub fn dequeue(&mut self) -> Option<(Frame, u32)> {
        let used_idx = self.mem.read_u16(self.used_off + 2);
        if used_idx == self.last_used {
            return None;
        }
        fence(Ordering::SeqCst);

        let slot = (self.last_used % self.size) as usize;
        let id = self.mem.read_u32(self.used_off + 4 + 8 * slot);
        let len = self.mem.read_u32(self.used_off + 4 + 8 * slot + 4);
        self.last_used = self.last_used.wrapping_add(1);

        let head = id as u16;
        let in_flight = self.slots[head as usize].take()?;

        // Return the chain to the free list: link its tail to the old
        // free head.
        let mut tail = head;
        for _ in 1..in_flight.chain_len {
            tail = self.desc_next(tail);
        }
        self.write_desc_next(tail, self.free_head);
        self.free_head = head;
        self.num_free += in_flight.chain_len;

        self.debug_check();
        Some((in_flight.frame, len))
    }

    /// Toggle NO_INTERRUPT in the available ring flags.
    pub fn set_interrupts(&mut self, enabled: bool) {
        let flags = if enabled { 0 } else { VIRTQ_AVAIL_F_NO_INTERRUPT };
        self.mem.write_u16(self.avail_off, flags);
    }

    fn write_desc(&mut self, i: u16, addr: u64, len: u32, flags: u16) {
        let off = i as usize * DESC_SIZE;
        self.mem.write_u64(off, addr);
        self.mem.write_u32(off + 8, len);
        // next is preserved: the free-list linkage doubles as the chain
        // linkage.
        self.mem.write_u16(off + 12, flags);
    }

    fn write_desc_next(&mut self, i: u16, next: u16) {
        self.mem.write_u16(i as usize * DESC_SIZE + 14, next);
    }

    fn desc_next(&self, i: u16) -> u16 {
        self.mem.read_u16(i as usize * DESC_SIZE + 14)
    }

    fn debug_check(&self) {
        debug_assert_eq!(self.num_free + self.in_flight(), self.size);
    }
}
