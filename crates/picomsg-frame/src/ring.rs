//! Fixed-capacity circular byte buffer for one appender and one consumer.
//!
//! `head` and `tail` are monotonically increasing byte counters; the number of
//! unread bytes is always `head - tail` and never exceeds the capacity. The
//! capacity is a power of two, so a counter maps to a storage index with a
//! mask.
//!
//! Access is split into two roles. A [`Producer`] appends (moves `head`), a
//! [`Consumer`] consumes (moves `tail`). Each role sits behind its own
//! [`SpinFlag`], so the two can run concurrently on different threads while
//! two producers (or two consumers) can never overlap.
//!
//! ```text
//!  tail & mask          head & mask
//!       v                    v
//! ------||||||||||||||||||||||--------   used span, one contiguous run
//! ||||||------------------------||||||   used span wraps: two runs
//! ```

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::codec::{encode_header, HEADER_SIZE};
use crate::error::{FrameError, Result};
use crate::spin::{SpinFlag, SpinFlagGuard};

/// Smallest ring: 1 KiB.
pub const MIN_SIZE_BITS: u32 = 10;
/// Largest ring: 1 GiB.
pub const MAX_SIZE_BITS: u32 = 30;
/// Default ring: 1 MiB.
pub const DEFAULT_SIZE_BITS: u32 = 20;

pub struct RingBuffer {
    name: &'static str,
    storage: Box<[UnsafeCell<u8>]>,
    mask: u64,
    head: AtomicU64,
    tail: AtomicU64,
    append_gate: SpinFlag,
    consume_gate: SpinFlag,
}

// SAFETY: the producer only writes bytes in `[head, tail + capacity)` and the
// consumer only reads bytes in `[tail, head)`. The spin flags keep each role to
// one thread, and the counters are published with release/acquire ordering.
unsafe impl Sync for RingBuffer {}
// SAFETY: the buffer owns its storage; nothing is tied to a thread.
unsafe impl Send for RingBuffer {}

impl RingBuffer {
    /// Allocate a ring of `1 << size_bits` bytes.
    pub fn with_size_bits(size_bits: u32, name: &'static str) -> Result<Self> {
        if !(MIN_SIZE_BITS..=MAX_SIZE_BITS).contains(&size_bits) {
            return Err(FrameError::InvalidCapacity {
                bits: size_bits,
                min: MIN_SIZE_BITS,
                max: MAX_SIZE_BITS,
            });
        }
        let capacity = 1usize << size_bits;

        let mut storage = Vec::new();
        storage
            .try_reserve_exact(capacity)
            .map_err(|_| FrameError::AllocationFailed { size: capacity })?;
        storage.resize_with(capacity, || UnsafeCell::new(0u8));

        Ok(Self {
            name,
            storage: storage.into_boxed_slice(),
            mask: (capacity - 1) as u64,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            append_gate: SpinFlag::new(),
            consume_gate: SpinFlag::new(),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Unread bytes.
    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        head.wrapping_sub(tail) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes that can still be appended.
    pub fn free(&self) -> usize {
        self.capacity() - self.len()
    }

    /// Take the appender role if nobody else has it.
    pub fn try_producer(&self) -> Option<Producer<'_>> {
        self.append_gate
            .try_enter()
            .map(|gate| Producer { ring: self, _gate: gate })
    }

    /// Take the appender role, spinning until it is free.
    pub fn producer(&self) -> Producer<'_> {
        Producer {
            ring: self,
            _gate: self.append_gate.enter(),
        }
    }

    /// Take the consumer role if nobody else has it.
    pub fn try_consumer(&self) -> Option<Consumer<'_>> {
        self.consume_gate
            .try_enter()
            .map(|gate| Consumer { ring: self, _gate: gate })
    }

    /// Take the consumer role, spinning until it is free.
    pub fn consumer(&self) -> Consumer<'_> {
        Consumer {
            ring: self,
            _gate: self.consume_gate.enter(),
        }
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.storage.as_ptr())
    }

    #[inline]
    fn index(&self, counter: u64) -> usize {
        (counter & self.mask) as usize
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("name", &self.name)
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

/// The appending side of a [`RingBuffer`].
pub struct Producer<'a> {
    ring: &'a RingBuffer,
    _gate: SpinFlagGuard<'a>,
}

impl Producer<'_> {
    /// Contiguous writable span starting at `head`.
    ///
    /// Bounded by the free space and by the physical end of the storage, so a
    /// wrapped free region is handed out in two calls. Empty when full.
    pub fn ask_unused(&mut self) -> &mut [u8] {
        let ring = self.ring;
        let head = ring.head.load(Ordering::Relaxed);
        let tail = ring.tail.load(Ordering::Acquire);
        let free = ring.capacity() - head.wrapping_sub(tail) as usize;
        let start = ring.index(head);
        let len = free.min(ring.capacity() - start);

        // SAFETY: `[start, start + len)` lies inside the storage and inside the
        // free region, which the consumer never touches.
        unsafe { std::slice::from_raw_parts_mut(ring.base().add(start), len) }
    }

    /// Publish `n` bytes written into the span from [`Self::ask_unused`].
    pub fn gained(&mut self, n: usize) {
        debug_assert!(n <= self.free(), "gained past the free space");
        let head = self.ring.head.load(Ordering::Relaxed);
        self.ring
            .head
            .store(head.wrapping_add(n as u64), Ordering::Release);
    }

    pub fn free(&self) -> usize {
        self.ring.free()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Append a length-prefixed message.
    ///
    /// Returns `false` and leaves the ring untouched when `payload.len() + 4`
    /// bytes are not free. The frame is published in one step, so the
    /// consumer never observes half of it.
    pub fn append_msg(&mut self, payload: &[u8]) -> bool {
        let Ok(len) = u32::try_from(payload.len()) else {
            return false;
        };
        if HEADER_SIZE + payload.len() > self.free() {
            return false;
        }
        self.write_at(0, &encode_header(len));
        self.write_at(HEADER_SIZE, payload);
        self.gained(HEADER_SIZE + payload.len());
        true
    }

    /// Append bytes verbatim, all or nothing.
    pub fn append_raw(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.free() {
            return false;
        }
        self.write_at(0, bytes);
        self.gained(bytes.len());
        true
    }

    /// Copy `src` to `head + offset` without publishing it.
    fn write_at(&mut self, offset: usize, src: &[u8]) {
        let ring = self.ring;
        let mut pos = ring.head.load(Ordering::Relaxed).wrapping_add(offset as u64);
        let mut rest = src;
        while !rest.is_empty() {
            let start = ring.index(pos);
            let run = rest.len().min(ring.capacity() - start);
            // SAFETY: callers checked that `offset + src.len()` fits in the free
            // region, and `run` stops at the physical end of the storage.
            unsafe {
                std::ptr::copy_nonoverlapping(rest.as_ptr(), ring.base().add(start), run);
            }
            rest = &rest[run..];
            pos = pos.wrapping_add(run as u64);
        }
    }
}

/// The consuming side of a [`RingBuffer`].
pub struct Consumer<'a> {
    ring: &'a RingBuffer,
    _gate: SpinFlagGuard<'a>,
}

impl Consumer<'_> {
    /// Contiguous readable span starting at `tail`. Empty when no data.
    pub fn ask_used(&mut self) -> &[u8] {
        let ring = self.ring;
        let tail = ring.tail.load(Ordering::Relaxed);
        let head = ring.head.load(Ordering::Acquire);
        let used = head.wrapping_sub(tail) as usize;
        let start = ring.index(tail);
        let len = used.min(ring.capacity() - start);

        // SAFETY: `[start, start + len)` lies inside the storage and inside the
        // published region, which the producer never writes.
        unsafe { std::slice::from_raw_parts(ring.base().add(start), len) }
    }

    /// Release `n` bytes consumed from the span from [`Self::ask_used`].
    pub fn lost(&mut self, n: usize) {
        debug_assert!(n <= self.len(), "lost past the used region");
        let tail = self.ring.tail.load(Ordering::Relaxed);
        self.ring
            .tail
            .store(tail.wrapping_add(n as u64), Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Move up to `dest.len()` bytes out of the ring. Returns the count copied.
    pub fn get(&mut self, dest: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < dest.len() {
            let span = self.ask_used();
            if span.is_empty() {
                break;
            }
            let n = span.len().min(dest.len() - copied);
            dest[copied..copied + n].copy_from_slice(&span[..n]);
            self.lost(n);
            copied += n;
        }
        copied
    }

    /// Drop up to `n` unread bytes. Returns the count dropped.
    pub fn skip(&mut self, n: usize) -> usize {
        let n = n.min(self.len());
        self.lost(n);
        n
    }

    /// Drop every unread byte.
    pub fn clear(&mut self) -> usize {
        self.skip(usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::codec::decode_header;

    fn small_ring() -> RingBuffer {
        RingBuffer::with_size_bits(MIN_SIZE_BITS, "test").unwrap()
    }

    #[test]
    fn rejects_out_of_range_size() {
        assert!(matches!(
            RingBuffer::with_size_bits(4, "tiny"),
            Err(FrameError::InvalidCapacity { .. })
        ));
        assert!(matches!(
            RingBuffer::with_size_bits(40, "huge"),
            Err(FrameError::InvalidCapacity { .. })
        ));
    }

    #[test]
    fn empty_ring_spans() {
        let ring = small_ring();
        assert!(ring.consumer().ask_used().is_empty());
        assert_eq!(ring.producer().ask_unused().len(), 1024);
        assert!(ring.is_empty());
    }

    #[test]
    fn full_ring_has_no_unused_span() {
        let ring = small_ring();
        let mut producer = ring.producer();
        let span = producer.ask_unused();
        span.fill(7);
        let n = span.len();
        producer.gained(n);
        assert!(producer.ask_unused().is_empty());
        assert_eq!(ring.len(), 1024);
        assert_eq!(ring.free(), 0);
    }

    #[test]
    fn append_msg_writes_prefix_then_payload() {
        let ring = small_ring();
        assert!(ring.producer().append_msg(b"hello"));
        assert_eq!(ring.len(), HEADER_SIZE + 5);

        let mut consumer = ring.consumer();
        let mut header = [0u8; HEADER_SIZE];
        assert_eq!(consumer.get(&mut header), HEADER_SIZE);
        assert_eq!(decode_header(header), 5);

        let mut body = [0u8; 5];
        assert_eq!(consumer.get(&mut body), 5);
        assert_eq!(&body, b"hello");
        assert!(consumer.is_empty());
    }

    #[test]
    fn append_msg_fails_without_mutation_when_full() {
        let ring = small_ring();
        let mut producer = ring.producer();
        assert!(producer.append_msg(&[1u8; 1000]));
        let before = ring.len();

        assert!(!producer.append_msg(&[2u8; 100]));
        assert_eq!(ring.len(), before);

        // Exactly the remaining free space still fits.
        let remaining = producer.free() - HEADER_SIZE;
        assert!(producer.append_msg(&vec![3u8; remaining]));
        assert_eq!(ring.free(), 0);
    }

    #[test]
    fn append_msg_larger_than_capacity_never_fits() {
        let ring = small_ring();
        assert!(!ring.producer().append_msg(&[0u8; 1024]));
        assert!(ring.is_empty());
    }

    #[test]
    fn spans_stop_at_the_wrap_point() {
        let ring = small_ring();
        // Move both cursors to 1000 so the next write wraps.
        assert!(ring.producer().append_raw(&[0u8; 1000]));
        assert_eq!(ring.consumer().skip(1000), 1000);

        let mut producer = ring.producer();
        assert_eq!(producer.ask_unused().len(), 24);
        assert!(producer.append_raw(&(0..100u8).collect::<Vec<_>>()));
        drop(producer);

        let mut consumer = ring.consumer();
        let first = consumer.ask_used().to_vec();
        assert_eq!(first.len(), 24);
        consumer.lost(first.len());
        let second = consumer.ask_used().to_vec();
        assert_eq!(second.len(), 76);
        assert_eq!(first[0], 0);
        assert_eq!(second[0], 24);
        assert_eq!(second[75], 99);
    }

    #[test]
    fn unused_span_bounded_by_wrapped_tail() {
        let ring = small_ring();
        assert!(ring.producer().append_raw(&[1u8; 1024]));
        assert_eq!(ring.consumer().skip(100), 100);

        // Head has wrapped to index 0 and tail sits at 100.
        let mut producer = ring.producer();
        assert_eq!(producer.ask_unused().len(), 100);
    }

    #[test]
    fn get_across_wrap() {
        let ring = small_ring();
        assert!(ring.producer().append_raw(&[0u8; 1022]));
        assert_eq!(ring.consumer().skip(1022), 1022);
        assert!(ring.producer().append_raw(b"wxyz"));

        let mut buf = [0u8; 4];
        assert_eq!(ring.consumer().get(&mut buf), 4);
        assert_eq!(&buf, b"wxyz");
        assert!(ring.is_empty());
    }

    #[test]
    fn roles_are_exclusive() {
        let ring = small_ring();
        let producer = ring.try_producer();
        assert!(producer.is_some());
        assert!(ring.try_producer().is_none());
        // The other role is independent.
        assert!(ring.try_consumer().is_some());
    }

    #[test]
    fn many_wrap_cycles_preserve_bytes() {
        let ring = small_ring();
        let mut next_in = 0u8;
        let mut next_out = 0u8;
        let mut total = 0usize;
        let mut size = 1usize;

        while total < 64 * ring.capacity() {
            size = (size * 7 + 3) % 700 + 1;
            let chunk: Vec<u8> = (0..size)
                .map(|_| {
                    next_in = next_in.wrapping_add(1);
                    next_in
                })
                .collect();
            assert!(ring.producer().append_raw(&chunk));

            let mut out = vec![0u8; size];
            let mut consumer = ring.consumer();
            assert_eq!(consumer.get(&mut out), size);
            for byte in out {
                next_out = next_out.wrapping_add(1);
                assert_eq!(byte, next_out);
            }
            assert!(consumer.is_empty());
            total += size;
        }
    }

    #[test]
    fn interleaved_messages_come_out_in_order() {
        let ring = small_ring();
        let mut expected = std::collections::VecDeque::new();

        for round in 0..500usize {
            let len = round % 97 + 1;
            let payload = vec![(round % 251) as u8; len];
            if ring.producer().append_msg(&payload) {
                expected.push_back(payload);
            }

            if round % 3 == 0 {
                while let Some(want) = expected.pop_front() {
                    let mut consumer = ring.consumer();
                    let mut header = [0u8; HEADER_SIZE];
                    assert_eq!(consumer.get(&mut header), HEADER_SIZE);
                    let mut got = vec![0u8; decode_header(header) as usize];
                    assert_eq!(consumer.get(&mut got), got.len());
                    assert_eq!(got, want);
                }
            }
        }
    }

    #[test]
    fn concurrent_producer_and_consumer() {
        let ring = Arc::new(RingBuffer::with_size_bits(12, "spsc").unwrap());
        const TOTAL: usize = 1 << 20;

        let writer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let mut sent = 0usize;
                while sent < TOTAL {
                    let mut producer = ring.producer();
                    let span = producer.ask_unused();
                    let n = span.len().min(TOTAL - sent).min(333);
                    for (i, byte) in span[..n].iter_mut().enumerate() {
                        *byte = ((sent + i) % 256) as u8;
                    }
                    producer.gained(n);
                    drop(producer);
                    if n == 0 {
                        thread::yield_now();
                    }
                    sent += n;
                }
            })
        };

        let mut received = 0usize;
        while received < TOTAL {
            let mut consumer = ring.consumer();
            let span = consumer.ask_used();
            let n = span.len();
            for (i, byte) in span.iter().enumerate() {
                assert_eq!(*byte, ((received + i) % 256) as u8);
            }
            consumer.lost(n);
            drop(consumer);
            if n == 0 {
                thread::yield_now();
            }
            received += n;
        }

        writer.join().unwrap();
        assert!(ring.is_empty());
    }
}
