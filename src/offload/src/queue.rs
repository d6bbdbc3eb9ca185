//! The shared job ring: a fixed-capacity, lock-free multi-producer
//! multi-consumer queue of job ids.
//!
//! Each slot carries a sequence number that encodes whether it is ready for a
//! producer or a consumer of a given lap. Producers and consumers claim slots
//! with a single CAS on `head`/`tail`; a lost race is reported as
//! [`Dequeue::Contended`] so callers can distinguish "no work" from "try
//! again now".

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;

use offload_api::JobId;

/// Outcome of a single dequeue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dequeue {
    Ok(JobId),
    /// The ring is empty; back off.
    Empty,
    /// Lost a race against another worker; retry immediately.
    Contended,
}

struct Slot {
    seq: AtomicUsize,
    value: UnsafeCell<JobId>,
}

pub struct JobRing {
    buf: Box<[Slot]>,
    mask: usize,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

// Safety: slot values are only written by the producer that claimed the slot
// via CAS on `tail` and only read by the consumer that claimed it via CAS on
// `head`; the per-slot sequence number orders the two.
unsafe impl Send for JobRing {}
unsafe impl Sync for JobRing {}

impl JobRing {
    /// Creates a ring with at least `capacity` slots (rounded up to a power
    /// of two).
    pub fn with_capacity(capacity: usize) -> Self {
        let cap = capacity.max(2).next_power_of_two();
        let buf = (0..cap)
            .map(|i| Slot {
                seq: AtomicUsize::new(i),
                value: UnsafeCell::new(JobId(0)),
            })
            .collect();
        JobRing {
            buf,
            mask: cap - 1,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Enqueues a job id. Returns `false` only when the ring is full.
    pub fn enqueue(&self, id: JobId) -> bool {
        let mut tail = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.buf[tail & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);

            if seq == tail {
                match self.tail.compare_exchange_weak(
                    tail,
                    tail.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe { *slot.value.get() = id };
                        slot.seq.store(tail.wrapping_add(1), Ordering::Release);
                        return true;
                    }
                    Err(t) => tail = t,
                }
            } else if (seq as isize).wrapping_sub(tail as isize) < 0 {
                // the slot has not been consumed for a full lap: ring is full
                return false;
            } else {
                tail = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Attempts to dequeue one job id.
    pub fn dequeue(&self) -> Dequeue {
        let head = self.head.load(Ordering::Relaxed);
        let slot = &self.buf[head & self.mask];
        let seq = slot.seq.load(Ordering::Acquire);

        if seq == head.wrapping_add(1) {
            match self.head.compare_exchange(
                head,
                head.wrapping_add(1),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    let id = unsafe { *slot.value.get() };
                    slot.seq
                        .store(head.wrapping_add(self.mask + 1), Ordering::Release);
                    Dequeue::Ok(id)
                }
                Err(_) => Dequeue::Contended,
            }
        } else if self.tail.load(Ordering::Relaxed) == head {
            Dequeue::Empty
        } else {
            // a producer claimed the slot but has not published it yet, or a
            // consumer raced us past this head
            Dequeue::Contended
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_and_drain() {
        let ring = JobRing::with_capacity(8);
        for i in 0..ring.capacity() {
            assert!(ring.enqueue(JobId(i as u32)));
        }
        assert!(!ring.enqueue(JobId(99)));
        for i in 0..ring.capacity() {
            assert_eq!(ring.dequeue(), Dequeue::Ok(JobId(i as u32)));
        }
        assert_eq!(ring.dequeue(), Dequeue::Empty);
    }

    #[test]
    fn empty_after_wraparound() {
        let ring = JobRing::with_capacity(4);
        for lap in 0..10 {
            assert!(ring.enqueue(JobId(lap)));
            assert_eq!(ring.dequeue(), Dequeue::Ok(JobId(lap)));
            assert_eq!(ring.dequeue(), Dequeue::Empty);
        }
    }

    #[test]
    fn capacity_rounds_up() {
        let ring = JobRing::with_capacity(5);
        assert_eq!(ring.capacity(), 8);
    }
}
