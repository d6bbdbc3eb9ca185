//! Batched completion reporting.
//!
//! Each worker appends finished job ids to a local batch and periodically
//! transfers the whole record to one of two host-visible slots, then posts a
//! single mailbox notification. Double buffering lets the worker keep
//! filling one slot while the host drains the other.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};

use offload_api::JobId;

/// Finished job ids per completion record. A full batch forces a flush.
pub const COMPLETION_CAPACITY: usize = 64;

/// The flat record transferred from worker to host.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BatchData {
    pub count: u32,
    pub ids: [u32; COMPLETION_CAPACITY],
}

impl BatchData {
    pub const fn new() -> Self {
        BatchData {
            count: 0,
            ids: [0; COMPLETION_CAPACITY],
        }
    }
}

/// One host-visible completion slot.
///
/// Lifecycle: `EMPTY -> FILLING (worker transfer in progress) -> FLUSHING
/// (in_use set, awaiting host drain) -> EMPTY`. The worker may not reuse the
/// slot until the host clears `in_use`.
pub struct CompletionRecord {
    in_use: AtomicBool,
    data: UnsafeCell<BatchData>,
}

// Safety: the worker writes `data` (via block transfer) only while `in_use`
// is clear and the host reads it only after observing `in_use` set; the flag
// with acquire/release ordering is the hand-off.
unsafe impl Sync for CompletionRecord {}

impl CompletionRecord {
    pub const fn new() -> Self {
        CompletionRecord {
            in_use: AtomicBool::new(false),
            data: UnsafeCell::new(BatchData::new()),
        }
    }

    #[inline]
    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    /// Worker side: publishes the slot to the host after its transfer
    /// completed.
    #[inline]
    pub fn publish(&self) {
        self.in_use.store(true, Ordering::Release);
    }

    /// Host side: releases the slot back to the worker after draining it.
    #[inline]
    pub fn clear(&self) {
        self.in_use.store(false, Ordering::Release);
    }

    /// Raw address of the record storage, for the worker's block transfer.
    #[inline]
    pub fn data_addr(&self) -> usize {
        self.data.get() as usize
    }

    /// Host-side read of the drained record.
    ///
    /// # Safety
    ///
    /// Only call between observing [`is_in_use`](Self::is_in_use) and
    /// [`clear`](Self::clear); the worker does not write the slot in that
    /// window.
    #[inline]
    pub unsafe fn read(&self) -> BatchData {
        *self.data.get()
    }
}

impl Default for CompletionRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// The pair of host-visible slots belonging to one worker.
pub struct WorkerCompletion {
    pub records: [CompletionRecord; 2],
}

impl WorkerCompletion {
    pub const fn new() -> Self {
        WorkerCompletion {
            records: [CompletionRecord::new(), CompletionRecord::new()],
        }
    }
}

/// The worker-local batch currently being filled, plus the transfer tag
/// groups that must drain before the batch may be reported.
pub struct CompletionBatch {
    data: BatchData,
    tag_mask: u32,
}

impl CompletionBatch {
    pub const fn new() -> Self {
        CompletionBatch {
            data: BatchData::new(),
            tag_mask: 0,
        }
    }

    #[inline]
    pub fn push(&mut self, id: JobId) {
        debug_assert!(!self.is_full());
        self.data.ids[self.data.count as usize] = id.0;
        self.data.count += 1;
    }

    /// Records a tag group whose transfers belong to a job in this batch.
    #[inline]
    pub fn add_tag(&mut self, tag: usize) {
        self.tag_mask |= 1 << tag;
    }

    #[inline]
    pub fn tag_mask(&self) -> u32 {
        self.tag_mask
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.count as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.count == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.data.count as usize == COMPLETION_CAPACITY
    }

    /// Raw address of the batch record, source of the flush transfer.
    #[inline]
    pub fn data_addr(&self) -> usize {
        &self.data as *const BatchData as usize
    }

    #[inline]
    pub fn record_len(&self) -> usize {
        std::mem::size_of::<BatchData>()
    }

    #[inline]
    pub fn reset(&mut self) {
        self.data.count = 0;
        self.tag_mask = 0;
    }
}
