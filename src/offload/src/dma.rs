//! The block-transfer engine.
//!
//! Workers never touch host memory directly: every movement between host
//! memory and a worker's private scratch is described as a batch of
//! [`CopyOp`]s and issued asynchronously under one of a small set of per-
//! worker tag groups. A shared engine thread drains the request channel,
//! performs the copies, and retires the tag; workers wait on tag groups by
//! polling the outstanding counters. Requests from one channel are performed
//! in issue order.

use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::utils::Backoff;

/// Tag group for the batched GET scatter transfer of a job's arguments.
pub const TAG_GET: usize = 0;
/// Tag groups for the two PUT scratch buffers.
pub const TAG_PUT0: usize = 1;
pub const TAG_PUT1: usize = 2;
/// Tag group for descriptor fetch and writeback transfers.
pub const TAG_DESC: usize = 3;
/// Tag group for completion-record transfers.
pub const TAG_COMP: usize = 4;

pub const NUM_TAGS: usize = 5;

/// A single contiguous copy. Addresses are raw `usize`s so the op stays
/// `Send`; the issuer is responsible for their validity until the tag group
/// retires.
#[derive(Debug, Clone, Copy)]
pub struct CopyOp {
    pub src: usize,
    pub dst: usize,
    pub len: usize,
}

impl CopyOp {
    /// Performs the copy.
    ///
    /// # Safety
    ///
    /// `src` must be valid for reading and `dst` valid for writing `len`
    /// bytes, and the two ranges must not overlap.
    #[inline]
    pub unsafe fn apply(&self) {
        ptr::copy_nonoverlapping(self.src as *const u8, self.dst as *mut u8, self.len);
    }
}

struct TagTable {
    outstanding: [AtomicUsize; NUM_TAGS],
}

impl TagTable {
    fn new() -> Self {
        TagTable {
            outstanding: std::array::from_fn(|_| AtomicUsize::new(0)),
        }
    }
}

struct Request {
    ops: Vec<CopyOp>,
    tags: Arc<TagTable>,
    tag: usize,
}

// Safety: the raw addresses inside `ops` are only dereferenced by the engine
// thread, under the issue/retire protocol documented on `DmaChannel::issue`.
unsafe impl Send for Request {}

/// The engine half: owns the worker thread draining the request channel.
pub struct DmaEngine {
    tx: Sender<Request>,
    handle: Option<JoinHandle<()>>,
}

impl DmaEngine {
    pub fn start() -> Self {
        let (tx, rx) = channel::unbounded();
        let handle = std::thread::Builder::new()
            .name("offload-dma".to_string())
            .spawn(move || Self::mainloop(rx))
            .expect("failed to spawn transfer engine thread");
        DmaEngine {
            tx,
            handle: Some(handle),
        }
    }

    fn mainloop(rx: Receiver<Request>) {
        tracing::debug!("transfer engine started");
        let mut transferred = 0u64;
        for req in rx.iter() {
            for op in &req.ops {
                // SAFETY: the issuer guarantees both ranges stay valid and
                // disjoint until the tag group retires; see `DmaChannel::issue`.
                unsafe { op.apply() };
                transferred += op.len as u64;
            }
            req.tags.outstanding[req.tag].fetch_sub(1, Ordering::Release);
        }
        tracing::debug!(transferred, "transfer engine exiting");
    }

    /// Opens a new tag-group channel for one worker.
    pub fn open_channel(&self) -> DmaChannel {
        DmaChannel {
            tx: self.tx.clone(),
            tags: Arc::new(TagTable::new()),
        }
    }

    /// Drops the sender side and joins the engine thread. Called by the
    /// manager after all workers have exited.
    pub fn shutdown(mut self) {
        drop(self.tx);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// A worker's handle to the transfer engine, with its private tag groups.
pub struct DmaChannel {
    tx: Sender<Request>,
    tags: Arc<TagTable>,
}

impl DmaChannel {
    /// Issues a batch of copies under `tag`.
    ///
    /// The issuer must keep every source range readable and every destination
    /// range writable, with no concurrent access to the destinations, until
    /// the tag group is observed drained through [`wait`](Self::wait) or
    /// [`done`](Self::done).
    pub fn issue(&self, tag: usize, ops: Vec<CopyOp>) {
        debug_assert!(tag < NUM_TAGS);
        if ops.is_empty() {
            return;
        }
        self.tags.outstanding[tag].fetch_add(1, Ordering::Relaxed);
        self.tx
            .send(Request {
                ops,
                tags: Arc::clone(&self.tags),
                tag,
            })
            .expect("transfer engine terminated while workers are active");
    }

    /// Returns whether the tag group has no outstanding transfer.
    #[inline]
    pub fn done(&self, tag: usize) -> bool {
        self.tags.outstanding[tag].load(Ordering::Acquire) == 0
    }

    /// Blocks until the tag group drains.
    pub fn wait(&self, tag: usize) {
        let backoff = Backoff::new();
        while !self.done(tag) {
            backoff.snooze();
        }
    }

    /// Blocks until every tag group named in `mask` (bit `1 << tag`) drains.
    pub fn wait_mask(&self, mask: u32) {
        for tag in 0..NUM_TAGS {
            if mask & (1 << tag) != 0 {
                self.wait(tag);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_and_wait() {
        let engine = DmaEngine::start();
        let chan = engine.open_channel();

        let src = vec![7u8; 1024];
        let mut dst = vec![0u8; 1024];
        chan.issue(
            TAG_GET,
            vec![CopyOp {
                src: src.as_ptr() as usize,
                dst: dst.as_mut_ptr() as usize,
                len: 1024,
            }],
        );
        chan.wait(TAG_GET);
        assert!(dst.iter().all(|&b| b == 7));
        engine.shutdown();
    }

    #[test]
    fn empty_issue_is_noop() {
        let engine = DmaEngine::start();
        let chan = engine.open_channel();
        chan.issue(TAG_COMP, Vec::new());
        assert!(chan.done(TAG_COMP));
        chan.wait_mask((1 << TAG_COMP) | (1 << TAG_GET));
        engine.shutdown();
    }
}
