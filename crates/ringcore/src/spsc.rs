use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, Ordering};

/// Bounded single-producer single-consumer ring buffer.
///
/// `head` is written only by the consumer, `tail` only by the producer. Both
/// are free-running u32 counters; the buffer index is `counter & mask`, so
/// `tail.wrapping_sub(head)` is the occupancy even across wrap-around. The
/// producer's Release store on `tail` publishes the slot bytes to a consumer
/// that observes the new value with Acquire, and symmetrically for `head`.
///
/// Push fails when `tail − head ≥ capacity`; pop fails when `head == tail`.
///
/// The element slots are plain `UnsafeCell`s with no per-slot
/// synchronization, which is what makes this ring cheap, and why [`push`]
/// and [`pop`] are `unsafe`: the memory protocol is only sound while at most
/// one thread produces and at most one thread consumes at any instant.
/// Callers that cannot guarantee the discipline structurally must serialize
/// each endpoint externally.
///
/// [`push`]: SpscRing::push
/// [`pop`]: SpscRing::pop
pub struct SpscRing<T> {
    /// Consumer index (written by consumer, read by producer).
    head: CachePadded<AtomicU32>,
    /// Producer index (written by producer, read by consumer).
    tail: CachePadded<AtomicU32>,
    mask: u32,
    buf: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// SAFETY: the head/tail protocol hands each initialized slot from exactly one
// thread to exactly one other; T only needs to be sendable across that edge.
unsafe impl<T: Send> Send for SpscRing<T> {}
unsafe impl<T: Send> Sync for SpscRing<T> {}

impl<T: Copy> SpscRing<T> {
    /// Creates a ring with the given capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or not a power of two.
    pub fn with_capacity(capacity: u32) -> Self {
        assert!(
            capacity > 0 && capacity.is_power_of_two(),
            "SpscRing capacity must be a nonzero power of two, got {capacity}"
        );

        let mut buf = Vec::with_capacity(capacity as usize);
        buf.resize_with(capacity as usize, || UnsafeCell::new(MaybeUninit::uninit()));

        Self {
            head: CachePadded::new(AtomicU32::new(0)),
            tail: CachePadded::new(AtomicU32::new(0)),
            mask: capacity - 1,
            buf: buf.into_boxed_slice(),
        }
    }

    /// Returns the ring capacity.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.mask + 1
    }

    /// Returns the current number of elements in the ring.
    #[inline]
    pub fn len(&self) -> u32 {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    /// Returns true if the ring is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if the ring is full.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    /// Appends an element. Returns `false` if the ring is full.
    ///
    /// # Safety
    ///
    /// At most one thread may be executing `push` on this ring at a time
    /// (single producer). Concurrent producers would claim the same slot.
    #[inline]
    pub unsafe fn push(&self, item: T) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);

        if tail.wrapping_sub(head) >= self.capacity() {
            return false;
        }

        let idx = (tail & self.mask) as usize;
        // SAFETY: the slot at `tail` is outside [head, tail), so the consumer
        // does not touch it until the Release store below publishes it.
        unsafe { (*self.buf[idx].get()).write(item) };

        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    /// Removes and returns the oldest element, or `None` if empty.
    ///
    /// # Safety
    ///
    /// At most one thread may be executing `pop` on this ring at a time
    /// (single consumer).
    #[inline]
    pub unsafe fn pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);

        if head == tail {
            return None;
        }

        let idx = (head & self.mask) as usize;
        // SAFETY: head < tail, so this slot was fully written before the
        // producer's Release store on tail, which our Acquire load observed.
        let item = unsafe { (*self.buf[idx].get()).assume_init() };

        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn push_pop_roundtrip() {
        let ring = SpscRing::<u64>::with_capacity(8);

        for i in 0..5u64 {
            assert!(unsafe { ring.push(i * 10) });
        }
        assert_eq!(ring.len(), 5);

        for i in 0..5u64 {
            assert_eq!(unsafe { ring.pop() }, Some(i * 10));
        }
        assert!(ring.is_empty());
        assert_eq!(unsafe { ring.pop() }, None);
    }

    #[test]
    fn push_fails_when_full() {
        let ring = SpscRing::<u32>::with_capacity(4);

        for i in 0..4 {
            assert!(unsafe { ring.push(i) });
        }
        assert!(ring.is_full());
        assert!(!unsafe { ring.push(99) });

        // Freeing one slot lets a push through again.
        assert_eq!(unsafe { ring.pop() }, Some(0));
        assert!(unsafe { ring.push(99) });
    }

    #[test]
    fn wraps_around_index_space() {
        let ring = SpscRing::<u32>::with_capacity(2);

        for i in 0..1000 {
            assert!(unsafe { ring.push(i) });
            assert_eq!(unsafe { ring.pop() }, Some(i));
        }
        assert!(ring.is_empty());
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn rejects_non_power_of_two() {
        let _ = SpscRing::<u32>::with_capacity(3);
    }

    #[test]
    fn cross_thread_fifo() {
        const N: u64 = 100_000;
        let ring = Arc::new(SpscRing::<u64>::with_capacity(1024));

        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let mut i = 0;
                while i < N {
                    // SAFETY: this thread is the only producer.
                    if unsafe { ring.push(i) } {
                        i += 1;
                    } else {
                        thread::yield_now();
                    }
                }
            })
        };

        let mut expected = 0;
        while expected < N {
            // SAFETY: this thread is the only consumer.
            if let Some(v) = unsafe { ring.pop() } {
                assert_eq!(v, expected, "values must arrive in FIFO order");
                expected += 1;
            } else {
                thread::yield_now();
            }
        }

        producer.join().unwrap();
        assert!(ring.is_empty());
    }
}
