//! The per-core worker loop: dequeue, marshal, invoke, report.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::mem;
use std::ptr;
use std::sync::{Arc, Barrier};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, TryRecvError};
use crossbeam::utils::Backoff;

use offload_api::cmd::{WorkerControl, WorkerNotify};
use offload_api::{EaDirection, JobDescriptor, JobId, JobStatus};

use crate::completion::{CompletionBatch, WorkerCompletion};
use crate::config::BackoffConfig;
use crate::dma::{CopyOp, DmaChannel, TAG_COMP, TAG_DESC, TAG_GET, TAG_PUT0};
use crate::marshal::{put_ops, BudgetExceeded, ScratchArena, CACHE_LINE};
use crate::pool::JobPool;
use crate::proc::{LocalRegion, ProcFn, ProcTable};
use crate::queue::{Dequeue, JobRing};

/// A raw cache-line-aligned allocation backing one scratch buffer. Kept as a
/// raw pointer so transfer sources/destinations never alias a Rust
/// reference.
struct AlignedBuf {
    ptr: *mut u8,
    layout: Layout,
}

impl AlignedBuf {
    fn new(len: usize) -> Self {
        let layout = Layout::from_size_align(len.max(CACHE_LINE), CACHE_LINE)
            .expect("invalid scratch buffer layout");
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "scratch buffer allocation failed");
        AlignedBuf { ptr, layout }
    }

    #[inline]
    fn addr(&self) -> usize {
        self.ptr as usize
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        // SAFETY: allocated with this layout in `new`.
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

pub(crate) struct WorkerParams {
    pub id: usize,
    pub ring: Arc<JobRing>,
    pub pool: Arc<JobPool>,
    pub table: Arc<ProcTable>,
    pub dma: DmaChannel,
    pub completions: Arc<WorkerCompletion>,
    pub ctrl_rx: Receiver<WorkerControl>,
    pub notify_tx: Sender<WorkerNotify>,
    pub scratch_size: usize,
    pub put_buffer_size: usize,
    pub backoff: BackoffConfig,
    pub barrier: Option<Arc<Barrier>>,
}

/// Spawns one worker thread. Scratch memory is allocated on the worker's own
/// thread.
pub(crate) fn spawn(params: WorkerParams) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("offload-worker-{}", params.id))
        .spawn(move || {
            if let Some(barrier) = &params.barrier {
                barrier.wait();
            }
            Worker::new(params).mainloop();
        })
}

struct Worker {
    id: usize,
    ring: Arc<JobRing>,
    pool: Arc<JobPool>,
    table: Arc<ProcTable>,
    dma: DmaChannel,

    get_buf: AlignedBuf,
    put_bufs: [AlignedBuf; 2],
    /// Staging slot for descriptor fetch and writeback transfers.
    desc_stage: AlignedBuf,
    scratch_size: usize,
    put_buffer_size: usize,

    /// Index of the PUT buffer the next job with PUT arguments will fill.
    put_index: usize,
    /// Bitmask of PUT buffers with an outstanding transfer.
    put_inflight: u32,

    batch: CompletionBatch,
    completions: Arc<WorkerCompletion>,
    /// Completion slot the next flush will target.
    slot_index: usize,

    ctrl_rx: Receiver<WorkerControl>,
    notify_tx: Sender<WorkerNotify>,

    backoff: BackoffConfig,
    jobs: u64,
}

impl Worker {
    fn new(params: WorkerParams) -> Self {
        Worker {
            id: params.id,
            ring: params.ring,
            pool: params.pool,
            table: params.table,
            dma: params.dma,
            get_buf: AlignedBuf::new(params.scratch_size),
            put_bufs: [
                AlignedBuf::new(params.put_buffer_size),
                AlignedBuf::new(params.put_buffer_size),
            ],
            desc_stage: AlignedBuf::new(mem::size_of::<JobDescriptor>()),
            scratch_size: params.scratch_size,
            put_buffer_size: params.put_buffer_size,
            put_index: 0,
            put_inflight: 0,
            batch: CompletionBatch::new(),
            completions: params.completions,
            slot_index: 0,
            ctrl_rx: params.ctrl_rx,
            notify_tx: params.notify_tx,
            backoff: params.backoff,
            jobs: 0,
        }
    }

    fn mainloop(&mut self) {
        tracing::debug!(worker = self.id, "worker started");
        let mut delay = self.backoff.floor();
        loop {
            match self.ring.dequeue() {
                Dequeue::Ok(id) => {
                    self.process_job(id);
                    delay = self.backoff.floor();
                }
                // lost a race, not out of work: poll again right away
                Dequeue::Contended => {}
                Dequeue::Empty => delay = self.idle(delay),
            }

            match self.ctrl_rx.try_recv() {
                Ok(WorkerControl::Exit) => break,
                Ok(WorkerControl::QueryScratchSize) => {
                    let _ = self.notify_tx.send(WorkerNotify::ScratchSize {
                        bytes: self.scratch_size,
                    });
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => break,
            }

            self.flush_completions(false);
        }
        self.flush_completions(true);
        tracing::debug!(worker = self.id, jobs = self.jobs, "worker exiting");
    }

    /// Sleeps out one idle round and returns the next delay: doubled, capped,
    /// with multiplicative jitter applied to this round.
    fn idle(&self, delay: Duration) -> Duration {
        let jitter = 1.0 + self.backoff.jitter_frac * (2.0 * fastrand::f64() - 1.0);
        thread::sleep(delay.mul_f64(jitter.max(0.0)));
        (delay * 2).min(self.backoff.cap())
    }

    fn process_job(&mut self, id: JobId) {
        let stage = self.desc_stage.addr();
        let host_addr = self.pool.desc_addr(id);
        let len = mem::size_of::<JobDescriptor>();

        // Fetch the descriptor. Waiting on TAG_DESC also drains the previous
        // job's writeback, which the engine orders before this fetch, so the
        // single staging slot is never overwritten while still being read.
        self.dma.issue(
            TAG_DESC,
            vec![CopyOp {
                src: host_addr,
                dst: stage,
                len,
            }],
        );
        self.dma.wait(TAG_DESC);
        // SAFETY: the fetch completed and the staging slot is worker-private.
        let mut desc = unsafe { ptr::read(stage as *const JobDescriptor) };

        desc.status = JobStatus::Ok;
        match self.table.get(desc.proc_id).map(|entry| entry.func) {
            None => desc.status = JobStatus::UnknownProc,
            Some(func) => {
                if desc.n_ea == 0 {
                    let input = desc.input;
                    func(&input, &mut desc.output, &mut []);
                } else if self.marshal_and_invoke(&mut desc, func).is_err() {
                    desc.status = JobStatus::ArgsTooLong;
                }
            }
        }

        tracing::trace!(worker = self.id, job = ?id, status = %desc.status, "job processed");

        // Write the descriptor back and report. The writeback stays
        // asynchronous; the completion flush waits on TAG_DESC before the
        // batch becomes visible to the host.
        // SAFETY: TAG_DESC drained above, so no transfer is reading the slot.
        unsafe { ptr::write(stage as *mut JobDescriptor, desc) };
        self.dma.issue(
            TAG_DESC,
            vec![CopyOp {
                src: stage,
                dst: host_addr,
                len,
            }],
        );
        self.batch.add_tag(TAG_DESC);
        self.batch.push(id);
        self.jobs += 1;

        if self.batch.is_full() {
            self.flush_completions(true);
        }
    }

    /// Stages every remote argument, runs the GET scatter transfer, invokes
    /// the procedure, and issues the PUT transfers. An `Err` means the
    /// scratch budget was exceeded before anything was transferred.
    fn marshal_and_invoke(
        &mut self,
        desc: &mut JobDescriptor,
        func: ProcFn,
    ) -> Result<(), BudgetExceeded> {
        let n_ea = desc.n_ea as usize;
        let mut get_arena = ScratchArena::new(self.get_buf.addr(), self.scratch_size);
        let mut put_arena: Option<ScratchArena> = None;
        let mut sgl: Vec<CopyOp> = Vec::with_capacity(n_ea);
        let mut regions: Vec<LocalRegion> = Vec::with_capacity(n_ea);
        let mut puts: Vec<(usize, usize, usize)> = Vec::new();

        for arg in desc.ea[..n_ea].iter_mut() {
            let ea_addr = arg.ea_addr as usize;
            let size = arg.size as usize;
            match arg.direction {
                EaDirection::Get => {
                    let local = get_arena.stage_get(&mut sgl, ea_addr, size)?;
                    arg.local_addr = local as u64;
                    regions.push(LocalRegion::new(local, size, EaDirection::Get));
                }
                EaDirection::Put => {
                    if put_arena.is_none() {
                        // reuse of this buffer must not overlap its previous
                        // job's outbound transfer
                        self.claim_put_buffer();
                        put_arena = Some(ScratchArena::new(
                            self.put_bufs[self.put_index].addr(),
                            self.put_buffer_size,
                        ));
                    }
                    let local = put_arena.as_mut().unwrap().stage_put(ea_addr, size)?;
                    arg.local_addr = local as u64;
                    puts.push((local, ea_addr, size));
                    regions.push(LocalRegion::new(local, size, EaDirection::Put));
                }
            }
        }

        // One batched transfer covers all GET windows; this is the only
        // synchronous wait before invocation.
        self.dma.issue(TAG_GET, sgl);
        self.dma.wait(TAG_GET);

        func(&desc.input, &mut desc.output, &mut regions);

        if !puts.is_empty() {
            let mut ops = Vec::new();
            for (local, ea_addr, size) in puts {
                put_ops(&mut ops, local, ea_addr, size);
            }
            let tag = TAG_PUT0 + self.put_index;
            self.dma.issue(tag, ops);
            self.put_inflight |= 1 << self.put_index;
            self.batch.add_tag(tag);
            self.put_index ^= 1;
        }
        Ok(())
    }

    /// Ensures the currently indexed PUT buffer has no outstanding transfer.
    fn claim_put_buffer(&mut self) {
        if self.put_inflight & (1 << self.put_index) != 0 {
            self.dma.wait(TAG_PUT0 + self.put_index);
            self.put_inflight &= !(1 << self.put_index);
        }
    }

    /// Reports the current batch to the host. With `force` unset this is the
    /// opportunistic path: it gives up when the batch is empty or the
    /// mailbox is full.
    fn flush_completions(&mut self, force: bool) {
        if self.batch.is_empty() {
            return;
        }
        if !force && self.notify_tx.is_full() {
            return;
        }

        let record = &self.completions.records[self.slot_index];
        // the slot being reused from two cycles ago must have been drained
        let backoff = Backoff::new();
        while record.is_in_use() {
            backoff.snooze();
        }

        self.dma.issue(
            TAG_COMP,
            vec![CopyOp {
                src: self.batch.data_addr(),
                dst: record.data_addr(),
                len: self.batch.record_len(),
            }],
        );
        // A done notification must never be visible before its data has
        // landed: wait for the record transfer plus every outstanding
        // writeback and PUT transfer belonging to jobs in this batch.
        self.dma.wait_mask(self.batch.tag_mask() | (1 << TAG_COMP));
        for buf in 0..2 {
            if self.batch.tag_mask() & (1 << (TAG_PUT0 + buf)) != 0 {
                self.put_inflight &= !(1 << buf);
            }
        }

        record.publish();
        self.notify_tx
            .send(WorkerNotify::JobsDone {
                buffer: self.slot_index,
            })
            .expect("notification mailbox disconnected");

        tracing::trace!(
            worker = self.id,
            count = self.batch.len(),
            buffer = self.slot_index,
            "flushed completion batch"
        );
        self.slot_index ^= 1;
        self.batch.reset();
    }
}
