//! Pooled packet buffers shared by the USB engines and the network stack.
//!
//! The pool is split into two size classes: a couple of small buffers for
//! ACKs and control responses, and a handful of frame-sized buffers for bulk
//! data. Allocation prefers the smallest class that fits and falls back to
//! the larger one. Both [`PacketPool::allocate`] and release (which happens
//! in [`PacketBox`]'s `Drop`) run inside a critical section and are safe to
//! call from interrupt context.
//!
//! A [`PacketBox`] is the single owner of its slot; handing it to a queue or
//! another layer moves ownership, so a buffer is always in exactly one of
//! free-pool / queue / in-flight. [`PacketBox::slice`] produces a [`Payload`]
//! view with a reserved prefix and suffix belonging to the outer layer; the
//! view still owns the slot, and [`Payload::unslice`] restores the outer
//! buffer infallibly.

use core::cell::{RefCell, UnsafeCell};
use core::fmt;
use core::future::poll_fn;
use core::ops::{Deref, DerefMut};
use core::task::Poll;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::waitqueue::AtomicWaker;
use heapless::Vec;

/// Capacity of the frame-sized buffers. Also the advertised link MTU.
pub const PACKET_SIZE: usize = 768;
/// Number of frame-sized buffers in the pool.
pub const PACKET_COUNT: usize = 4;
/// Capacity of the small buffers used for ACKs and control responses.
pub const SMALL_SIZE: usize = 128;
/// Number of small buffers in the pool.
pub const SMALL_COUNT: usize = 2;

#[repr(transparent)]
struct Storage<const N: usize>(UnsafeCell<[u8; N]>);

// SAFETY: a slot's bytes are only ever reached through the unique `PacketBox`
// holding its index, or through the pool while the slot sits in a free list.
unsafe impl<const N: usize> Sync for Storage<N> {}

impl<const N: usize> Storage<N> {
    #[allow(clippy::declare_interior_mutable_const)]
    const NEW: Self = Self(UnsafeCell::new([0; N]));
}

struct FreeLists {
    initialized: bool,
    small: Vec<u8, SMALL_COUNT>,
    large: Vec<u8, PACKET_COUNT>,
}

impl FreeLists {
    fn init(&mut self) {
        if !self.initialized {
            self.initialized = true;
            for i in (0..SMALL_COUNT).rev() {
                unwrap!(self.small.push(i as u8));
            }
            for i in (0..PACKET_COUNT).rev() {
                unwrap!(self.large.push(i as u8));
            }
        }
    }
}

/// Fixed pool of length-prefixed byte buffers in two size classes.
///
/// Const-constructible so it can live in a `static`.
pub struct PacketPool {
    small: [Storage<SMALL_SIZE>; SMALL_COUNT],
    large: [Storage<PACKET_SIZE>; PACKET_COUNT],
    free: Mutex<CriticalSectionRawMutex, RefCell<FreeLists>>,
    waker: AtomicWaker,
}

impl PacketPool {
    pub const fn new() -> Self {
        Self {
            small: [Storage::NEW; SMALL_COUNT],
            large: [Storage::NEW; PACKET_COUNT],
            free: Mutex::new(RefCell::new(FreeLists {
                initialized: false,
                small: Vec::new(),
                large: Vec::new(),
            })),
            waker: AtomicWaker::new(),
        }
    }

    /// Allocates a buffer with capacity of at least `size` bytes, or `None`
    /// when the pool is exhausted. Safe to call from interrupt context.
    pub fn allocate(&'static self, size: usize) -> Option<PacketBox> {
        let buf = self.try_allocate(size);
        if buf.is_none() {
            warn!("no buffers left, trying to allocate {} bytes", size);
        }
        buf
    }

    /// Like [`allocate`](Self::allocate) but without the exhaustion log.
    fn try_allocate(&'static self, size: usize) -> Option<PacketBox> {
        if size > PACKET_SIZE {
            return None;
        }

        let index = self.free.lock(|cell| {
            let mut free = cell.borrow_mut();
            free.init();

            let mut index = None;
            if size <= SMALL_SIZE {
                index = free.small.pop();
            }
            if index.is_none() {
                index = free.large.pop().map(|i| i + SMALL_COUNT as u8);
            }
            index
        });

        index.map(|index| PacketBox {
            pool: self,
            index,
            len: 0,
        })
    }

    /// Waits until a buffer of the requested size can be allocated.
    ///
    /// This is the inbound back-pressure mechanism: a USB receive engine that
    /// parks here never posts a read, so the bulk OUT endpoint NAKs until a
    /// consumer releases a buffer.
    pub async fn allocate_wait(&'static self, size: usize) -> PacketBox {
        poll_fn(|cx| match self.try_allocate(size) {
            Some(buf) => Poll::Ready(buf),
            None => {
                self.waker.register(cx.waker());
                // Re-check to close the race against a release that happened
                // between the failed attempt and the registration.
                match self.try_allocate(size) {
                    Some(buf) => Poll::Ready(buf),
                    None => Poll::Pending,
                }
            }
        })
        .await
    }

    /// Number of free buffers per class, `(small, large)`.
    pub fn free_count(&'static self) -> (usize, usize) {
        self.free.lock(|cell| {
            let mut free = cell.borrow_mut();
            free.init();
            (free.small.len(), free.large.len())
        })
    }

    fn release(&self, index: u8) {
        self.free.lock(|cell| {
            let mut free = cell.borrow_mut();
            let i = index as usize;
            if i < SMALL_COUNT {
                assert!(!free.small.contains(&index));
                unwrap!(free.small.push(index));
            } else {
                let index = index - SMALL_COUNT as u8;
                assert!(!free.large.contains(&index));
                unwrap!(free.large.push(index));
            }
        });
        self.waker.wake();
    }

    fn capacity_of(&self, index: u8) -> usize {
        if (index as usize) < SMALL_COUNT {
            SMALL_SIZE
        } else {
            PACKET_SIZE
        }
    }

    fn data_ptr(&self, index: u8) -> *mut u8 {
        let i = index as usize;
        if i < SMALL_COUNT {
            self.small[i].0.get() as *mut u8
        } else {
            self.large[i - SMALL_COUNT].0.get() as *mut u8
        }
    }
}

impl Default for PacketPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Owning handle to a pooled buffer.
///
/// Dereferences to the valid data region (`..len()`). Dropping the box
/// returns the slot to its free list and wakes pool waiters.
pub struct PacketBox {
    pool: &'static PacketPool,
    index: u8,
    len: u16,
}

impl PacketBox {
    pub fn capacity(&self) -> usize {
        self.pool.capacity_of(self.index)
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sets the valid data length. Bytes between the old and new length are
    /// whatever the slot last held.
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.capacity());
        self.len = len as u16;
    }

    /// Appends `data` and returns `true`, or leaves the buffer untouched and
    /// returns `false` if it does not fit.
    pub fn append(&mut self, data: &[u8]) -> bool {
        let len = self.len as usize;
        if len + data.len() > self.capacity() {
            return false;
        }
        unsafe {
            core::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.pool.data_ptr(self.index).add(len),
                data.len(),
            );
        }
        self.len = (len + data.len()) as u16;
        true
    }

    /// Turns the buffer into a [`Payload`] view that skips `prefix` bytes at
    /// the front and reserves `suffix` bytes at the back for the outer layer.
    pub fn slice(self, prefix: usize, suffix: usize) -> Payload {
        assert!(prefix + suffix <= self.capacity());
        let len = self.len().saturating_sub(prefix + suffix);
        Payload {
            prefix: prefix as u16,
            suffix: suffix as u16,
            len: len as u16,
            buf: self,
        }
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: this box is the unique owner of the slot.
        unsafe { core::slice::from_raw_parts(self.pool.data_ptr(self.index), self.capacity()) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: this box is the unique owner of the slot.
        unsafe {
            core::slice::from_raw_parts_mut(self.pool.data_ptr(self.index), self.capacity())
        }
    }
}

impl Deref for PacketBox {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes()[..self.len as usize]
    }
}

impl DerefMut for PacketBox {
    fn deref_mut(&mut self) -> &mut [u8] {
        let len = self.len as usize;
        &mut self.bytes_mut()[..len]
    }
}

impl Drop for PacketBox {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

impl fmt::Debug for PacketBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketBox")
            .field("capacity", &self.capacity())
            .field("len", &self.len)
            .finish()
    }
}

/// View into the interior of a pooled buffer, with `prefix` bytes up front
/// (where an outer layer will later stamp its headers) and `suffix` bytes at
/// the back. Owns the underlying [`PacketBox`].
pub struct Payload {
    buf: PacketBox,
    prefix: u16,
    suffix: u16,
    len: u16,
}

impl Payload {
    pub fn capacity(&self) -> usize {
        self.buf.capacity() - self.prefix as usize - self.suffix as usize
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.capacity());
        self.len = len as u16;
    }

    /// Appends `data` and returns `true`, or leaves the view untouched and
    /// returns `false` if it does not fit.
    pub fn append(&mut self, data: &[u8]) -> bool {
        let len = self.len as usize;
        if len + data.len() > self.capacity() {
            return false;
        }
        let start = self.prefix as usize + len;
        self.buf.bytes_mut()[start..start + data.len()].copy_from_slice(data);
        self.len = (len + data.len()) as u16;
        true
    }

    /// `core::fmt::Write` adapter appending to the view.
    pub fn writer(&mut self) -> PayloadWriter<'_> {
        PayloadWriter { payload: self }
    }

    /// Restores the outer buffer. The outer data length covers the prefix,
    /// the view contents and the suffix, mirroring the slice that created it.
    pub fn unslice(mut self) -> PacketBox {
        let len = self.prefix as usize + self.len as usize + self.suffix as usize;
        self.buf.set_len(len);
        self.buf
    }
}

impl Deref for Payload {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        let start = self.prefix as usize;
        &self.buf.bytes()[start..start + self.len as usize]
    }
}

impl DerefMut for Payload {
    fn deref_mut(&mut self) -> &mut [u8] {
        let start = self.prefix as usize;
        let len = self.len as usize;
        &mut self.buf.bytes_mut()[start..start + len]
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("prefix", &self.prefix)
            .field("suffix", &self.suffix)
            .field("len", &self.len)
            .finish()
    }
}

/// Writer returned by [`Payload::writer`]. Formatting that does not fit
/// reports `fmt::Error` and leaves the tail truncated.
pub struct PayloadWriter<'a> {
    payload: &'a mut Payload,
}

impl fmt::Write for PayloadWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if self.payload.append(s.as_bytes()) {
            Ok(())
        } else {
            Err(fmt::Error)
        }
    }
}
