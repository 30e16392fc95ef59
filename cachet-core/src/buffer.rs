//! # Access Recorder
//!
//! Striped, fixed-capacity ring buffers that carry read/write/remove events
//! from the hot path to the maintenance task. Producers CAS-reserve a write
//! sequence and publish through an atomic slot; a single consumer drains all
//! stripes.
//!
//! Overflow is lossy on purpose: a full stripe drops the event and flags the
//! drain as required. Dropped events only reduce recency/frequency accuracy.
//!
//! ## Memory ordering
//!
//! Producers publish a slot with `Release` after winning the sequence CAS;
//! the consumer takes slots with `Acquire`, so the event payload is fully
//! visible before the consumer touches it. The read sequence is only ever
//! written by the consumer, and the capacity check against it is
//! conservative: producers may see a stale (smaller) read sequence and drop
//! an event that would have fit, never the reverse.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::entry::CacheEntry;

/// What happened to the recorded key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AccessKind {
    /// The key was read and a value returned.
    Read,
    /// The key was inserted or its value replaced.
    Write,
    /// The key was removed explicitly.
    Remove,
}

/// One recorded access, produced on the hot path and consumed by the drain.
pub(crate) struct AccessEvent<K, V> {
    /// Event kind.
    pub kind: AccessKind,
    /// Entry handle; valid only while the entry's state says so.
    pub entry: Arc<CacheEntry<K, V>>,
}

/// Consumer coordination states for [`StripedBuffer::drain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum DrainStatus {
    /// Nothing pending.
    Idle = 0,
    /// A consumer currently owns the drain.
    Processing = 1,
    /// A producer hit a full stripe; draining is overdue.
    Required = 2,
}

struct Stripe<K, V> {
    write: AtomicUsize,
    read: AtomicUsize,
    slots: Box<[AtomicPtr<AccessEvent<K, V>>]>,
    slot_mask: usize,
    // Slots hold owned events behind raw pointers, so the auto traits must
    // see the event type.
    _owns: PhantomData<AccessEvent<K, V>>,
}

impl<K, V> Stripe<K, V> {
    fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(AtomicPtr::new(std::ptr::null_mut()));
        }
        Stripe {
            write: AtomicUsize::new(0),
            read: AtomicUsize::new(0),
            slots: slots.into_boxed_slice(),
            slot_mask: capacity - 1,
            _owns: PhantomData,
        }
    }

    fn offer(&self, event: AccessEvent<K, V>) -> bool {
        let head = self.read.load(Ordering::Acquire);
        let tail = self.write.load(Ordering::Relaxed);
        if tail.wrapping_sub(head) >= self.slots.len() {
            return false;
        }
        if self
            .write
            .compare_exchange(tail, tail.wrapping_add(1), Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            // Lost the slot race; drop rather than spin on the hot path.
            return false;
        }

        let ptr = Box::into_raw(Box::new(event));
        let slot = &self.slots[tail & self.slot_mask];
        // A slot can still hold an event the consumer skipped while its
        // producer was mid-publish; overwriting it loses that one event,
        // which the lossy contract allows.
        let old = slot.swap(ptr, Ordering::AcqRel);
        if !old.is_null() {
            // SAFETY: a non-null pointer in a slot was produced by
            // `Box::into_raw` in this function and never freed elsewhere,
            // and the swap above made this thread its only owner.
            unsafe { drop(Box::from_raw(old)) };
        }
        true
    }

    fn drain<F>(&self, visitor: &mut F)
    where
        F: FnMut(AccessEvent<K, V>),
    {
        let head = self.read.load(Ordering::Relaxed);
        let tail = self.write.load(Ordering::Acquire);
        for seq in head..tail {
            let slot = &self.slots[seq & self.slot_mask];
            let ptr = slot.swap(std::ptr::null_mut(), Ordering::AcqRel);
            if ptr.is_null() {
                // The producer that reserved this sequence has not published
                // yet; later sequences may still be visible, so keep going.
                continue;
            }
            // SAFETY: the pointer came from `Box::into_raw` in `offer` and
            // was atomically taken out of the slot, so this is the only
            // owner.
            let event = unsafe { *Box::from_raw(ptr) };
            visitor(event);
        }
        self.read.store(tail, Ordering::Release);
    }
}

impl<K, V> Drop for Stripe<K, V> {
    fn drop(&mut self) {
        for slot in self.slots.iter() {
            let ptr = slot.swap(std::ptr::null_mut(), Ordering::AcqRel);
            if !ptr.is_null() {
                // SAFETY: sole owner during drop; see `drain`.
                unsafe { drop(Box::from_raw(ptr)) };
            }
        }
    }
}

/// Striped ring buffer shared by all producers, drained by one consumer.
pub(crate) struct StripedBuffer<K, V> {
    stripes: Box<[Stripe<K, V>]>,
    stripe_mask: usize,
    drain_status: AtomicU8,
}

impl<K, V> StripedBuffer<K, V> {
    /// Builds stripes sized from the machine's parallelism.
    pub(crate) fn new() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1);
        Self::with_geometry(
            (cores * 4).max(4).next_power_of_two(),
            (cores * 32).max(64).next_power_of_two(),
        )
    }

    /// Builds an explicit geometry; both values must be powers of two.
    pub(crate) fn with_geometry(stripe_count: usize, stripe_capacity: usize) -> Self {
        debug_assert!(stripe_count.is_power_of_two());
        debug_assert!(stripe_capacity.is_power_of_two());

        let mut stripes = Vec::with_capacity(stripe_count);
        for _ in 0..stripe_count {
            stripes.push(Stripe::new(stripe_capacity));
        }
        StripedBuffer {
            stripes: stripes.into_boxed_slice(),
            stripe_mask: stripe_count - 1,
            drain_status: AtomicU8::new(DrainStatus::Idle as u8),
        }
    }

    /// Records an event on the calling thread's stripe.
    ///
    /// Returns false when the event was dropped; the drain status is then
    /// already flagged `Required`.
    pub(crate) fn offer(&self, event: AccessEvent<K, V>) -> bool {
        let stripe = &self.stripes[thread_stripe() & self.stripe_mask];
        if stripe.offer(event) {
            true
        } else {
            self.drain_status
                .store(DrainStatus::Required as u8, Ordering::Release);
            false
        }
    }

    /// True when a producer hit a full stripe since the last drain.
    pub(crate) fn is_drain_required(&self) -> bool {
        self.drain_status.load(Ordering::Acquire) == DrainStatus::Required as u8
    }

    /// Attempts to become the single drain consumer.
    ///
    /// Succeeds from `Idle` or `Required`; fails while another consumer is
    /// `Processing`.
    pub(crate) fn try_begin_drain(&self) -> bool {
        let current = self.drain_status.load(Ordering::Acquire);
        if current == DrainStatus::Processing as u8 {
            return false;
        }
        self.drain_status
            .compare_exchange(
                current,
                DrainStatus::Processing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Drains every stripe into `visitor` and returns to `Idle`.
    ///
    /// Must only be called after a successful [`Self::try_begin_drain`].
    pub(crate) fn drain<F>(&self, mut visitor: F)
    where
        F: FnMut(AccessEvent<K, V>),
    {
        for stripe in self.stripes.iter() {
            stripe.drain(&mut visitor);
        }
        self.drain_status
            .store(DrainStatus::Idle as u8, Ordering::Release);
    }
}

/// Per-thread stripe index.
///
/// Each thread draws a probe once from a global counter; multiplying by a
/// large odd constant spreads consecutive thread indices across stripes.
fn thread_stripe() -> usize {
    use std::cell::Cell;

    static NEXT_THREAD: AtomicUsize = AtomicUsize::new(0);
    thread_local! {
        static PROBE: Cell<usize> = Cell::new(usize::MAX);
    }

    PROBE.with(|probe| {
        let mut value = probe.get();
        if value == usize::MAX {
            value = NEXT_THREAD
                .fetch_add(1, Ordering::Relaxed)
                .wrapping_mul(0x9e37_79b9_7f4a_7c15_usize);
            probe.set(value);
        }
        value
    })
}
