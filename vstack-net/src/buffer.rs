//! Fixed-size frame pool and the frame ownership model.
//!
//! All packet memory comes from a [`BufferPool`] of equally sized, aligned
//! buffers. A [`Frame`] wraps one buffer together with two cursors: as a
//! packet moves down the stack each layer prepends its header in front of
//! `layer_begin`, and on the way up each layer strips its header by advancing
//! it. Frames can be chained into an owned singly-linked list; a chain always
//! travels to the same link-layer destination and is handed off as one unit.
//!
//! A frame is owned by exactly one place at a time (a queue, a pending-ARP
//! entry, or the code currently processing it). Dropping a frame returns its
//! buffer to the pool.

use std::alloc::{self, Layout};
use std::cell::RefCell;
use std::ptr::NonNull;
use std::rc::Rc;

/// Size of every pool buffer: MTU plus all header reserves, rounded up.
pub const BUFFER_SIZE: usize = 2048;

/// Reserved space in front of transmit payloads: virtio-net header,
/// Ethernet (+ optional 802.1Q tag), IPv4 and TCP headers with options.
pub const HEADROOM: usize = 128;

/// Alignment of every buffer, matching the device DMA requirement.
const BUF_ALIGN: usize = 64;

/// One raw aligned allocation. Deallocates on drop.
struct RawBuf {
    ptr: NonNull<u8>,
    size: usize,
}

impl RawBuf {
    fn alloc(size: usize) -> Self {
        let layout = Layout::from_size_align(size, BUF_ALIGN).expect("buffer layout");
        // SAFETY: layout has non-zero size
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).expect("buffer allocation failed");
        RawBuf { ptr, size }
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for size bytes for the lifetime of self
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for size bytes and uniquely borrowed
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }
}

impl Drop for RawBuf {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.size, BUF_ALIGN).expect("buffer layout");
        // SAFETY: allocated with the same layout in RawBuf::alloc
        unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) };
    }
}

struct PoolShared {
    buffer_size: usize,
    free: RefCell<Vec<RawBuf>>,
    capacity: RefCell<usize>,
}

/// Pool of fixed-size, DMA-aligned packet buffers.
///
/// Cloning the handle shares the pool. `acquire` is non-blocking and returns
/// `None` on exhaustion; the caller is expected to apply backpressure and
/// retry later.
#[derive(Clone)]
pub struct BufferPool {
    shared: Rc<PoolShared>,
}

impl BufferPool {
    /// Create a pool with `capacity` buffers of `buffer_size` bytes each.
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        debug_assert!(capacity.is_power_of_two(), "pool capacity not a power of two");
        let free = (0..capacity).map(|_| RawBuf::alloc(buffer_size)).collect();
        BufferPool {
            shared: Rc::new(PoolShared {
                buffer_size,
                free: RefCell::new(free),
                capacity: RefCell::new(capacity),
            }),
        }
    }

    /// Take a buffer from the pool, or `None` when exhausted.
    pub fn acquire(&self) -> Option<PoolBuffer> {
        let buf = self.shared.free.borrow_mut().pop()?;
        Some(PoolBuffer {
            buf: Some(buf),
            shared: Rc::clone(&self.shared),
        })
    }

    /// Seed the pool with `count` additional buffers.
    pub fn donate(&self, count: usize) {
        let mut free = self.shared.free.borrow_mut();
        for _ in 0..count {
            free.push(RawBuf::alloc(self.shared.buffer_size));
        }
        *self.shared.capacity.borrow_mut() += count;
    }

    /// Number of buffers currently available.
    pub fn available(&self) -> usize {
        self.shared.free.borrow().len()
    }

    /// Total number of buffers owned by the pool.
    pub fn capacity(&self) -> usize {
        *self.shared.capacity.borrow()
    }

    /// Size of each buffer in bytes.
    pub fn buffer_size(&self) -> usize {
        self.shared.buffer_size
    }
}

/// A buffer checked out of a [`BufferPool`]. Returns to the pool on drop.
pub struct PoolBuffer {
    buf: Option<RawBuf>,
    shared: Rc<PoolShared>,
}

impl PoolBuffer {
    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_ref().expect("buffer present").as_slice()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buf.as_mut().expect("buffer present").as_mut_slice()
    }

    /// Base address of the buffer, for descriptor programming.
    pub fn base_addr(&self) -> u64 {
        self.buf.as_ref().expect("buffer present").ptr.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.shared.buffer_size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for PoolBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.shared.free.borrow_mut().push(buf);
        }
    }
}

/// One unit of network transmission: a pool buffer plus layer cursors and an
/// optional chain link.
///
/// `layer_begin..data_end` is the payload of the layer currently looking at
/// the frame. Receive processing advances `layer_begin` as headers are
/// stripped; transmit processing retreats it as headers are prepended.
pub struct Frame {
    buf: PoolBuffer,
    layer_begin: usize,
    data_end: usize,
    next: Option<Box<Frame>>,
}

impl Frame {
    /// A fresh transmit frame with full headroom reserved.
    pub fn new_tx(buf: PoolBuffer) -> Self {
        Frame {
            buf,
            layer_begin: HEADROOM,
            data_end: HEADROOM,
            next: None,
        }
    }

    /// A receive frame; the driver sets the span once the device reports the
    /// written length.
    pub fn new_rx(buf: PoolBuffer) -> Self {
        Frame {
            buf,
            layer_begin: 0,
            data_end: 0,
            next: None,
        }
    }

    /// Set both cursors at once (driver use, after DMA completion).
    pub fn set_span(&mut self, layer_begin: usize, data_end: usize) {
        assert!(layer_begin <= data_end && data_end <= self.buf.len());
        self.layer_begin = layer_begin;
        self.data_end = data_end;
    }

    pub fn layer_begin(&self) -> usize {
        self.layer_begin
    }

    pub fn data_end(&self) -> usize {
        self.data_end
    }

    /// Bytes available in front of the current layer.
    pub fn headroom(&self) -> usize {
        self.layer_begin
    }

    /// Bytes available after the current data end.
    pub fn tailroom(&self) -> usize {
        self.buf.len() - self.data_end
    }

    /// Current layer's view of the frame.
    pub fn payload(&self) -> &[u8] {
        &self.buf.as_slice()[self.layer_begin..self.data_end]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let (begin, end) = (self.layer_begin, self.data_end);
        &mut self.buf.as_mut_slice()[begin..end]
    }

    pub fn payload_len(&self) -> usize {
        self.data_end - self.layer_begin
    }

    /// Grow the frame front by `n` header bytes and return the new payload
    /// view (header first).
    pub fn prepend(&mut self, n: usize) -> &mut [u8] {
        assert!(n <= self.layer_begin, "frame headroom exhausted");
        self.layer_begin -= n;
        self.payload_mut()
    }

    /// Strip `n` bytes from the front (header consumed by the current layer).
    pub fn trim_front(&mut self, n: usize) {
        assert!(self.layer_begin + n <= self.data_end);
        self.layer_begin += n;
    }

    /// Extend the frame tail by `n` bytes and return the new tail slice.
    pub fn append(&mut self, n: usize) -> &mut [u8] {
        assert!(self.data_end + n <= self.buf.len(), "frame tailroom exhausted");
        let start = self.data_end;
        self.data_end += n;
        let end = self.data_end;
        &mut self.buf.as_mut_slice()[start..end]
    }

    /// Shrink the payload to `n` bytes.
    pub fn truncate(&mut self, n: usize) {
        assert!(n <= self.payload_len());
        self.data_end = self.layer_begin + n;
    }

    /// Base address of the underlying buffer, for descriptor programming.
    pub fn base_addr(&self) -> u64 {
        self.buf.base_addr()
    }

    /// Append `other` (and anything chained behind it) to the end of this
    /// frame's chain.
    pub fn chain(&mut self, other: Frame) {
        let mut tail = self;
        while tail.next.is_some() {
            tail = tail.next.as_mut().expect("chain tail");
        }
        tail.next = Some(Box::new(other));
    }

    /// Detach and return the rest of the chain.
    pub fn take_next(&mut self) -> Option<Frame> {
        self.next.take().map(|b| *b)
    }

    pub fn next(&self) -> Option<&Frame> {
        self.next.as_deref()
    }

    pub fn next_mut(&mut self) -> Option<&mut Frame> {
        self.next.as_deref_mut()
    }

    /// Number of frames in this chain, including self.
    pub fn chain_len(&self) -> usize {
        let mut n = 1;
        let mut cur = self.next.as_deref();
        while let Some(f) = cur {
            n += 1;
            cur = f.next.as_deref();
        }
        n
    }
}
