//! The host-managed pool of job descriptors.
//!
//! Descriptors live in preallocated storage with stable addresses: the
//! shared ring carries indices into this pool, and workers fetch/write back
//! slots with block transfers against the raw slot address.

use std::cell::UnsafeCell;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use offload_api::{JobDescriptor, JobId};

mod sa {
    use super::*;
    use static_assertions::const_assert_eq;

    const_assert_eq!(mem::size_of::<JobDescriptor>() % 8, 0);
}

/// Slot ownership states. Transitions: Free -> Host (obtain), Host -> Queued
/// (submit), Queued -> Host (completion), Host -> Free (release).
const STATE_FREE: u8 = 0;
const STATE_HOST: u8 = 1;
const STATE_QUEUED: u8 = 2;

struct JobSlot {
    desc: UnsafeCell<JobDescriptor>,
    state: AtomicU8,
    done: AtomicBool,
}

pub struct JobPool {
    slots: Box<[JobSlot]>,
    free: spin::Mutex<Vec<u32>>,
}

// Safety: a slot's descriptor is accessed by the host only while the slot is
// in Host state and by exactly one worker (via block transfers) while
// Queued; the state transitions at submit and completion are the hand-off
// points.
unsafe impl Send for JobPool {}
unsafe impl Sync for JobPool {}

impl JobPool {
    pub fn new(cap: usize) -> Self {
        let slots = (0..cap)
            .map(|_| JobSlot {
                desc: UnsafeCell::new(JobDescriptor::new()),
                state: AtomicU8::new(STATE_FREE),
                done: AtomicBool::new(false),
            })
            .collect();
        // descriptors are handed out from the back
        let free = (0..cap as u32).rev().collect();
        JobPool {
            slots,
            free: spin::Mutex::new(free),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Obtains a free descriptor, reset to its initial state.
    pub fn obtain(&self) -> Option<JobId> {
        let index = self.free.lock().pop()?;
        let slot = &self.slots[index as usize];
        debug_assert_eq!(slot.state.load(Ordering::Relaxed), STATE_FREE);
        // SAFETY: the slot left the free list just now, nothing else refers
        // to it.
        unsafe { (*slot.desc.get()).reset() };
        slot.done.store(false, Ordering::Relaxed);
        slot.state.store(STATE_HOST, Ordering::Relaxed);
        Some(JobId(index))
    }

    /// Returns a descriptor to the free list.
    ///
    /// Panics if the job is still in flight: freeing an unreturned
    /// descriptor is a contract violation, not a runtime condition.
    pub fn release(&self, id: JobId) {
        let slot = self.slot(id);
        let state = slot.state.swap(STATE_FREE, Ordering::Relaxed);
        assert_eq!(
            state, STATE_HOST,
            "released job descriptor {id:?} while it is in flight"
        );
        self.free.lock().push(id.0);
    }

    /// Marks a descriptor as entering the pipeline. Clears the done latch.
    pub fn mark_submitted(&self, id: JobId) {
        let slot = self.slot(id);
        let prev = slot.state.swap(STATE_QUEUED, Ordering::Relaxed);
        assert_eq!(prev, STATE_HOST, "submitted job descriptor {id:?} twice");
        slot.done.store(false, Ordering::Relaxed);
    }

    /// Rolls back a submission whose enqueue failed; the descriptor never
    /// entered the pipeline.
    pub fn unmark_submitted(&self, id: JobId) {
        let slot = self.slot(id);
        let prev = slot.state.swap(STATE_HOST, Ordering::Relaxed);
        debug_assert_eq!(prev, STATE_QUEUED);
    }

    /// Called by the host-side collector when a completion record names this
    /// job: ownership returns to the host and waiters may observe it.
    pub fn finish(&self, id: JobId) {
        let slot = self.slot(id);
        let prev = slot.state.swap(STATE_HOST, Ordering::Relaxed);
        debug_assert_eq!(prev, STATE_QUEUED, "completion for a job not in flight");
        slot.done.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_done(&self, id: JobId) -> bool {
        self.slot(id).done.load(Ordering::Acquire)
    }

    /// Raw address of the descriptor storage, for block transfers.
    #[inline]
    pub fn desc_addr(&self, id: JobId) -> usize {
        self.slot(id).desc.get() as usize
    }

    /// Host-side view of a descriptor.
    ///
    /// # Safety
    ///
    /// The caller must own the slot (Host state) or know the job has
    /// completed; the returned reference must not outlive a subsequent
    /// submission.
    #[inline]
    pub unsafe fn desc(&self, id: JobId) -> *mut JobDescriptor {
        self.slot(id).desc.get()
    }

    #[inline]
    fn slot(&self, id: JobId) -> &JobSlot {
        &self.slots[id.0 as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn obtain_release_cycle() {
        let pool = JobPool::new(4);
        let mut ids = Vec::new();
        while let Some(id) = pool.obtain() {
            ids.push(id);
        }
        assert_eq!(ids.len(), 4);
        for id in ids {
            pool.release(id);
        }
        assert!(pool.obtain().is_some());
    }

    #[test]
    #[should_panic(expected = "in flight")]
    fn release_in_flight_panics() {
        let pool = JobPool::new(2);
        let id = pool.obtain().unwrap();
        pool.mark_submitted(id);
        pool.release(id);
    }

    #[test]
    fn finish_latches_done() {
        let pool = JobPool::new(2);
        let id = pool.obtain().unwrap();
        pool.mark_submitted(id);
        assert!(!pool.is_done(id));
        pool.finish(id);
        assert!(pool.is_done(id));
        pool.release(id);
    }
}
