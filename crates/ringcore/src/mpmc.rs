use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, Ordering};

// =============================================================================
// SYNCHRONIZATION PROTOCOL (Vyukov bounded MPMC queue)
// =============================================================================
//
// Every slot carries its own sequence number. For a ring of capacity C:
//
// - Slot i starts with seq = i.
// - A producer loads `tail`, inspects slot[tail & mask].seq:
//     seq − tail == 0  → slot is free; CAS tail → tail+1 to claim it
//     seq − tail  < 0  → the ring is full
//     seq − tail  > 0  → another producer advanced tail; reload and retry
//   After writing the element it publishes with seq = tail + 1 (Release).
// - A consumer mirrors the protocol against `head`, expecting
//   seq == head + 1, and on release stores seq = head + C (Release), handing
//   the slot to the producer that will next wrap around to it.
//
// The per-slot sequence is what prevents ABA: a slow thread that wakes up
// holding a stale index finds the slot's seq has moved on and retries. All
// seq stores are Release and all seq loads Acquire, so the element bytes are
// visible to whichever side observes the published sequence value.
//
// =============================================================================

struct Slot<T> {
    seq: AtomicU32,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Bounded multi-producer multi-consumer ring buffer.
///
/// Lock-free under any number of concurrent producers and consumers; elements
/// are copied in and out by value. Capacity must be a power of two.
pub struct MpmcRing<T> {
    head: CachePadded<AtomicU32>,
    tail: CachePadded<AtomicU32>,
    mask: u32,
    slots: Box<[Slot<T>]>,
}

// SAFETY: slot handoff is mediated by the per-slot sequence protocol above;
// each initialized value is read by exactly one consumer.
unsafe impl<T: Send> Send for MpmcRing<T> {}
unsafe impl<T: Send> Sync for MpmcRing<T> {}

impl<T: Copy> MpmcRing<T> {
    /// Creates a ring with the given capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or not a power of two.
    pub fn with_capacity(capacity: u32) -> Self {
        assert!(
            capacity > 0 && capacity.is_power_of_two(),
            "MpmcRing capacity must be a nonzero power of two, got {capacity}"
        );

        let slots = (0..capacity)
            .map(|i| Slot {
                seq: AtomicU32::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            head: CachePadded::new(AtomicU32::new(0)),
            tail: CachePadded::new(AtomicU32::new(0)),
            mask: capacity - 1,
            slots,
        }
    }

    /// Returns the ring capacity.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.mask + 1
    }

    /// Returns the current number of elements in the ring.
    ///
    /// Under concurrent access this is a point-in-time estimate.
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

    /// Appends an element. Returns `false` if the ring is full.
    pub fn push(&self, item: T) -> bool {
        let mut tail = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[(tail & self.mask) as usize];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(tail) as i32;

            if diff == 0 {
                // Slot is free at this position; claim it.
                match self.tail.compare_exchange_weak(
                    tail,
                    tail.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the CAS made this thread the unique owner
                        // of the slot until the seq store below publishes it.
                        unsafe { (*slot.value.get()).write(item) };
                        slot.seq.store(tail.wrapping_add(1), Ordering::Release);
                        return true;
                    }
                    Err(actual) => tail = actual,
                }
            } else if diff < 0 {
                return false;
            } else {
                tail = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Removes and returns the oldest element, or `None` if empty.
    pub fn pop(&self) -> Option<T> {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[(head & self.mask) as usize];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(head.wrapping_add(1)) as i32;

            if diff == 0 {
                // Slot holds data for this position; claim it.
                match self.head.compare_exchange_weak(
                    head,
                    head.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the CAS made this thread the unique reader
                        // of the slot; the Acquire seq load saw the
                        // producer's Release publish of the value.
                        let item = unsafe { (*slot.value.get()).assume_init() };
                        slot.seq
                            .store(head.wrapping_add(self.capacity()), Ordering::Release);
                        return Some(item);
                    }
                    Err(actual) => head = actual,
                }
            } else if diff < 0 {
                return None;
            } else {
                head = self.head.load(Ordering::Relaxed);
            }
        }
    }
}
