use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering, fence},
};

use crate::QueueError;

/// Length prefix in front of every message.
const HDR: usize = size_of::<u32>();
/// A booking needs room for its own prefix plus the next one, so the
/// reader can always load a length at `tail`.
const HDR2: usize = HDR * 2;

/// Framed single-producer/single-consumer byte ring.
///
/// Messages are contiguous byte runs preceded by a native-endian `u32`
/// length; a length of 0 is a wrap marker telling the reader to restart
/// at offset 0. The producer publishes a message with a Release fence
/// between the payload write and the non-zero length write; the consumer
/// pairs it with an Acquire fence after loading the length.
///
/// The intended use is handing raw Ethernet frames from a driver
/// interrupt/thread to the poller: clone a [`FrameSender`] into the
/// driver, keep the [`FrameReceiver`] on the poll loop. One sender, one
/// receiver; the ring does not police additional handles.
pub struct FrameQueue {
    inner: Arc<Inner>,
}

struct Inner {
    buf: *mut u8,
    size: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
}

unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

impl FrameQueue {
    pub fn with_capacity(size: usize) -> Result<Self, QueueError> {
        if size < HDR2 * 2 {
            return Err(QueueError::TooSmall(HDR2 * 2));
        }
        let buf = vec![0u8; size].into_boxed_slice();
        let buf = Box::into_raw(buf).cast::<u8>();
        Ok(Self {
            inner: Arc::new(Inner {
                buf,
                size,
                head: AtomicUsize::new(0),
                tail: AtomicUsize::new(0),
            }),
        })
    }

    pub fn sender(&self) -> FrameSender {
        FrameSender { inner: Arc::clone(&self.inner) }
    }

    pub fn receiver(&self) -> FrameReceiver {
        FrameReceiver { inner: Arc::clone(&self.inner) }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(core::ptr::slice_from_raw_parts_mut(self.buf, self.size)));
        }
    }
}

impl Inner {
    #[inline]
    unsafe fn write_len(&self, at: usize, len: u32) {
        unsafe { self.buf.add(at).cast::<u32>().write_unaligned(len) };
    }

    #[inline]
    unsafe fn read_len(&self, at: usize) -> u32 {
        unsafe { self.buf.add(at).cast::<u32>().read_unaligned() }
    }
}

/// Producer half of a [`FrameQueue`].
pub struct FrameSender {
    inner: Arc<Inner>,
}

unsafe impl Send for FrameSender {}

impl FrameSender {
    /// Reserves `len` contiguous bytes, wrapping the ring if the space at
    /// the end does not fit. Returns `None` when the ring is full; the
    /// caller drops the frame (and counts it).
    pub fn book(&mut self, len: usize) -> Option<&mut [u8]> {
        let q = &*self.inner;
        let mut head = q.head.load(Ordering::Relaxed);
        let tail = q.tail.load(Ordering::Acquire);
        let mut space = if head >= tail {
            let end = q.size - head;
            if end < len + HDR2 && tail > HDR2 {
                // Wrap: zero marker at head, restart at the front
                unsafe { q.write_len(head, 0) };
                q.head.store(0, Ordering::Release);
                head = 0;
                tail - HDR2
            } else {
                end
            }
        } else {
            tail - head - 1
        };
        space = space.saturating_sub(HDR2);
        if space < len {
            return None;
        }
        Some(unsafe { core::slice::from_raw_parts_mut(q.buf.add(head + HDR), len) })
    }

    /// Publishes the `len` bytes previously booked.
    pub fn commit(&mut self, len: usize) {
        let q = &*self.inner;
        let head = q.head.load(Ordering::Relaxed);
        fence(Ordering::Release);
        unsafe { q.write_len(head, len as u32) };
        q.head.store(head + HDR + len, Ordering::Release);
    }

    /// Book-and-commit in one call. Returns false when the ring is full.
    pub fn send(&mut self, frame: &[u8]) -> bool {
        match self.book(frame.len()) {
            Some(dst) => {
                dst.copy_from_slice(frame);
                self.commit(frame.len());
                true
            }
            None => false,
        }
    }
}

/// Consumer half of a [`FrameQueue`].
pub struct FrameReceiver {
    inner: Arc<Inner>,
}

unsafe impl Send for FrameReceiver {}

impl FrameReceiver {
    /// Next unread message, without consuming it. Transparently skips a
    /// wrap marker.
    pub fn peek(&mut self) -> Option<&[u8]> {
        let q = &*self.inner;
        let mut tail = q.tail.load(Ordering::Relaxed);
        let head = q.head.load(Ordering::Acquire);
        if tail == head {
            return None;
        }
        let mut len = unsafe { q.read_len(tail) };
        fence(Ordering::Acquire);
        if len == 0 {
            // Wrap marker, restart at the front
            q.tail.store(0, Ordering::Release);
            tail = 0;
            if tail == q.head.load(Ordering::Acquire) {
                return None;
            }
            len = unsafe { q.read_len(tail) };
            fence(Ordering::Acquire);
        }
        debug_assert!(tail + HDR + len as usize <= q.size);
        Some(unsafe { core::slice::from_raw_parts(q.buf.add(tail + HDR), len as usize) })
    }

    /// Consumes the message last returned by [`peek`](Self::peek).
    pub fn pop(&mut self) {
        let q = &*self.inner;
        let tail = q.tail.load(Ordering::Relaxed);
        let head = q.head.load(Ordering::Acquire);
        if tail == head {
            return;
        }
        let len = unsafe { q.read_len(tail) };
        if len == 0 {
            // pop() without a peek() that already skipped the marker
            q.tail.store(0, Ordering::Release);
            return self.pop();
        }
        q.tail.store(tail + HDR + len as usize, Ordering::Release);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrip_in_order() {
        let q = FrameQueue::with_capacity(256).unwrap();
        let (mut tx, mut rx) = (q.sender(), q.receiver());
        assert!(tx.send(b"one"));
        assert!(tx.send(b"two"));
        assert_eq!(rx.peek(), Some(&b"one"[..]));
        rx.pop();
        assert_eq!(rx.peek(), Some(&b"two"[..]));
        rx.pop();
        assert_eq!(rx.peek(), None);
    }

    #[test]
    fn wrap_marker_is_invisible() {
        let q = FrameQueue::with_capacity(64).unwrap();
        let (mut tx, mut rx) = (q.sender(), q.receiver());
        // Fill and drain repeatedly so head wraps several times; the
        // consumer must only ever observe user payloads.
        for round in 0..50u8 {
            let msg = [round; 20];
            assert!(tx.send(&msg), "round {round}");
            assert_eq!(rx.peek(), Some(&msg[..]));
            rx.pop();
        }
    }

    #[test]
    fn full_ring_rejects() {
        let q = FrameQueue::with_capacity(32).unwrap();
        let mut tx = q.sender();
        assert!(tx.send(&[1; 10]));
        assert!(!tx.send(&[2; 20]));
    }

    #[test]
    fn book_commit_zero_copy() {
        let q = FrameQueue::with_capacity(128).unwrap();
        let (mut tx, mut rx) = (q.sender(), q.receiver());
        let dst = tx.book(4).unwrap();
        dst.copy_from_slice(&[9, 8, 7, 6]);
        tx.commit(4);
        assert_eq!(rx.peek(), Some(&[9, 8, 7, 6][..]));
    }

    #[test]
    fn cross_thread_order() {
        let q = FrameQueue::with_capacity(1024).unwrap();
        let (mut tx, mut rx) = (q.sender(), q.receiver());
        let n: u32 = 10_000;
        let prod = std::thread::spawn(move || {
            let mut sent = 0u32;
            while sent < n {
                if tx.send(&sent.to_le_bytes()) {
                    sent += 1;
                } else {
                    std::hint::spin_loop();
                }
            }
        });
        let mut expect = 0u32;
        while expect < n {
            if let Some(frame) = rx.peek() {
                assert_eq!(frame, expect.to_le_bytes());
                expect += 1;
                rx.pop();
            } else {
                std::hint::spin_loop();
            }
        }
        prod.join().unwrap();
    }
}
