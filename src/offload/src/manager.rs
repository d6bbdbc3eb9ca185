//! The host-side job manager: descriptor allocation, submission, blocking
//! waits, and the completion collector that drains worker mailboxes.

use std::ops::Deref;
use std::sync::{Arc, Barrier, Condvar, Mutex, Weak};
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Select, Sender};
use lazy_static::lazy_static;

use offload_api::cmd::{WorkerControl, WorkerNotify};
use offload_api::{Error, JobDescriptor, JobId, JobStatus, ProcId};

use crate::completion::WorkerCompletion;
use crate::config::Config;
use crate::dma::DmaEngine;
use crate::pool::JobPool;
use crate::proc::ProcTable;
use crate::queue::JobRing;
use crate::worker::{self, WorkerParams};

/// Completion policy for [`ManagerCore::wait_jobs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Block until every named job is done.
    All,
    /// Return as soon as any subset is done.
    Any,
}

/// A host-owned handle to one pooled job descriptor.
///
/// The handle is the host's exclusive view while the job is not in flight;
/// between `submit_job` and the completion wait the descriptor is lent to a
/// worker and must not be touched.
pub struct JobDesc {
    id: JobId,
    pool: Arc<JobPool>,
}

impl JobDesc {
    #[inline]
    pub fn id(&self) -> JobId {
        self.id
    }

    #[inline]
    pub fn desc(&self) -> &JobDescriptor {
        // SAFETY: host ownership outside the submit..complete window is the
        // handle's contract; the pool asserts it on release.
        unsafe { &*self.pool.desc(self.id) }
    }

    #[inline]
    pub fn desc_mut(&mut self) -> &mut JobDescriptor {
        // SAFETY: as above, plus `&mut self` for host-side exclusivity.
        unsafe { &mut *self.pool.desc(self.id) }
    }

    #[inline]
    pub fn status(&self) -> JobStatus {
        self.desc().status
    }
}

// Safety: the handle is a (pool, index) pair; descriptor access follows the
// ownership hand-off documented above.
unsafe impl Send for JobDesc {}

struct ReplySlot {
    value: Mutex<Option<usize>>,
    cv: Condvar,
}

impl ReplySlot {
    fn new() -> Self {
        ReplySlot {
            value: Mutex::new(None),
            cv: Condvar::new(),
        }
    }
}

/// Shared manager state; all query/submit/wait operations live here so both
/// the owning [`JobManager`] and the process-wide [`ManagerRef`] expose them.
pub struct ManagerCore {
    cfg: Config,
    worker_count: usize,
    table: Arc<ProcTable>,
    pool: Arc<JobPool>,
    ring: Arc<JobRing>,
    ctrl_tx: Vec<Sender<WorkerControl>>,
    scratch_replies: Vec<ReplySlot>,
    wait_lock: Mutex<()>,
    wait_cv: Condvar,
}

impl ManagerCore {
    /// Resolves a procedure name to its id. Fails with
    /// [`Error::UnknownProcedure`] for unregistered names.
    pub fn lookup_proc(&self, name: &str) -> Result<ProcId, Error> {
        self.table.lookup(name)
    }

    /// Allocates a job descriptor from the pool, reset and ready to fill.
    pub fn alloc_job_desc(&self) -> Result<JobDesc, Error> {
        let id = self.pool.obtain().ok_or(Error::PoolExhausted)?;
        Ok(JobDesc {
            id,
            pool: Arc::clone(&self.pool),
        })
    }

    /// Returns a descriptor to the pool. Panics if the job is still in
    /// flight.
    pub fn free_job_desc(&self, jd: JobDesc) {
        self.pool.release(jd.id);
    }

    /// Pushes a filled descriptor into the shared ring. Returns `false` when
    /// the ring is full: the descriptor never entered the pipeline, its
    /// status is left untouched, and retrying is the caller's concern.
    pub fn submit_job(&self, jd: &JobDesc) -> bool {
        let desc = self.pool.desc_addr(jd.id) as *mut JobDescriptor;
        // stamp Pending while the host still owns the slot
        // SAFETY: Host-state slot; no worker references it yet.
        let prev_status = unsafe {
            let prev = (*desc).status;
            (*desc).status = JobStatus::Pending;
            prev
        };
        self.pool.mark_submitted(jd.id);
        if self.ring.enqueue(jd.id) {
            tracing::trace!(job = ?jd.id, "job submitted");
            true
        } else {
            self.pool.unmark_submitted(jd.id);
            // SAFETY: enqueue failed, the slot never left host ownership.
            unsafe { (*desc).status = prev_status };
            false
        }
    }

    /// Blocks until the job's status is no longer `Pending`.
    pub fn wait_job(&self, jd: &JobDesc) {
        let mut guard = self.wait_lock.lock().unwrap();
        while !self.pool.is_done(jd.id) {
            guard = self.wait_cv.wait(guard).unwrap();
        }
    }

    /// Blocks on a set of jobs. `done[i]` is set for each completed job;
    /// returns the number completed. `All` waits for every job irrespective
    /// of completion order, `Any` returns as soon as at least one is done.
    pub fn wait_jobs(&self, jds: &[&JobDesc], done: &mut [bool], mode: WaitMode) -> usize {
        assert_eq!(jds.len(), done.len());
        let mut guard = self.wait_lock.lock().unwrap();
        loop {
            let mut count = 0;
            for (jd, flag) in jds.iter().zip(done.iter_mut()) {
                *flag = self.pool.is_done(jd.id);
                count += *flag as usize;
            }
            let satisfied = match mode {
                WaitMode::All => count == jds.len(),
                WaitMode::Any => count > 0,
            };
            if satisfied || jds.is_empty() {
                return count;
            }
            guard = self.wait_cv.wait(guard).unwrap();
        }
    }

    /// The maximum aggregate remote-argument byte count a single job may
    /// request. Cache-line windowing of misaligned regions counts against
    /// this budget; staying under it with aligned regions never yields
    /// `ArgsTooLong`.
    pub fn ea_args_maxsize(&self) -> usize {
        self.cfg.scratch_size.min(self.cfg.put_buffer_size)
    }

    #[inline]
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Round-trips a scratch-capacity query through a worker's control
    /// channel and mailbox.
    pub fn worker_scratch_size(&self, worker: usize) -> usize {
        let slot = &self.scratch_replies[worker];
        *slot.value.lock().unwrap() = None;
        self.ctrl_tx[worker]
            .send(WorkerControl::QueryScratchSize)
            .expect("worker terminated");
        let mut guard = slot.value.lock().unwrap();
        while guard.is_none() {
            guard = slot.cv.wait(guard).unwrap();
        }
        guard.unwrap()
    }
}

/// The owning handle: shuts the runtime down on drop.
pub struct JobManager {
    core: Arc<ManagerCore>,
    workers: Vec<JoinHandle<()>>,
    collector: Option<JoinHandle<()>>,
    dma: Option<DmaEngine>,
}

impl Deref for JobManager {
    type Target = ManagerCore;

    fn deref(&self) -> &ManagerCore {
        &self.core
    }
}

/// A non-owning handle obtained from the process-wide default; exposes the
/// same operations, does not keep the runtime alive.
pub struct ManagerRef {
    core: Arc<ManagerCore>,
}

impl Deref for ManagerRef {
    type Target = ManagerCore;

    fn deref(&self) -> &ManagerCore {
        &self.core
    }
}

lazy_static! {
    static ref DEFAULT_MANAGER: spin::Mutex<Option<Weak<ManagerCore>>> = spin::Mutex::new(None);
}

impl JobManager {
    /// Creates a manager with `worker_count` workers (`0` means one per
    /// available CPU) and the externally supplied procedure table.
    pub fn new(
        worker_count: usize,
        gang_schedule: bool,
        table: ProcTable,
    ) -> Result<JobManager, Error> {
        let cfg = Config {
            worker_count,
            gang_schedule,
            ..Config::default()
        };
        Self::with_config(cfg, table)
    }

    pub fn with_config(cfg: Config, table: ProcTable) -> Result<JobManager, Error> {
        crate::logging::init_log(&cfg);
        let worker_count = if cfg.worker_count == 0 {
            num_cpus::get()
        } else {
            cfg.worker_count
        };

        let table = Arc::new(table);
        let pool = Arc::new(JobPool::new(cfg.pool_size));
        let ring = Arc::new(JobRing::with_capacity(cfg.queue_depth));
        let dma = DmaEngine::start();

        let barrier = cfg
            .gang_schedule
            .then(|| Arc::new(Barrier::new(worker_count)));

        let mut ctrl_tx = Vec::with_capacity(worker_count);
        let mut notify_rx = Vec::with_capacity(worker_count);
        let mut completions = Vec::with_capacity(worker_count);
        let mut scratch_replies = Vec::with_capacity(worker_count);
        let mut pending_spawns = Vec::with_capacity(worker_count);

        for id in 0..worker_count {
            let (c_tx, c_rx) = channel::bounded(4);
            // the notification mailbox is a single-slot channel
            let (n_tx, n_rx) = channel::bounded(1);
            let comp = Arc::new(WorkerCompletion::new());

            ctrl_tx.push(c_tx);
            notify_rx.push(n_rx);
            completions.push(Arc::clone(&comp));
            scratch_replies.push(ReplySlot::new());

            pending_spawns.push(WorkerParams {
                id,
                ring: Arc::clone(&ring),
                pool: Arc::clone(&pool),
                table: Arc::clone(&table),
                dma: dma.open_channel(),
                completions: comp,
                ctrl_rx: c_rx,
                notify_tx: n_tx,
                scratch_size: cfg.scratch_size,
                put_buffer_size: cfg.put_buffer_size,
                backoff: cfg.backoff,
                barrier: barrier.clone(),
            });
        }

        let core = Arc::new(ManagerCore {
            cfg,
            worker_count,
            table,
            pool,
            ring,
            ctrl_tx,
            scratch_replies,
            wait_lock: Mutex::new(()),
            wait_cv: Condvar::new(),
        });

        let collector = {
            let core = Arc::clone(&core);
            let completions = completions.clone();
            std::thread::Builder::new()
                .name("offload-collector".to_string())
                .spawn(move || collector_loop(core, completions, notify_rx))
                .map_err(|e| Error::Generic(e.to_string()))?
        };

        let mut workers = Vec::with_capacity(worker_count);
        for params in pending_spawns {
            workers.push(worker::spawn(params).map_err(|e| Error::Generic(e.to_string()))?);
        }

        tracing::info!(
            workers = worker_count,
            queue_depth = core.ring.capacity(),
            "job manager created"
        );

        Ok(JobManager {
            core,
            workers,
            collector: Some(collector),
            dma: Some(dma),
        })
    }

    /// Publishes this manager as the process-wide default.
    pub fn set_default(&self) {
        *DEFAULT_MANAGER.lock() = Some(Arc::downgrade(&self.core));
    }

    /// Clears the process-wide default.
    pub fn clear_default() {
        *DEFAULT_MANAGER.lock() = None;
    }

    /// Fetches a handle to the process-wide default manager. Fails with a
    /// typed error if none was set or the owning handle has been released.
    pub fn default_handle() -> Result<ManagerRef, Error> {
        match &*DEFAULT_MANAGER.lock() {
            None => Err(Error::DefaultManagerUnset),
            Some(weak) => weak
                .upgrade()
                .map(|core| ManagerRef { core })
                .ok_or(Error::DefaultManagerReleased),
        }
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        for tx in &self.core.ctrl_tx {
            let _ = tx.send(WorkerControl::Exit);
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        if let Some(collector) = self.collector.take() {
            let _ = collector.join();
        }
        if let Some(dma) = self.dma.take() {
            dma.shutdown();
        }
        tracing::debug!("job manager shut down");
    }
}

/// Drains worker mailboxes: latches finished jobs, releases completion
/// slots, and wakes blocked waiters. Exits when every worker has hung up.
fn collector_loop(
    core: Arc<ManagerCore>,
    completions: Vec<Arc<WorkerCompletion>>,
    notify_rx: Vec<Receiver<WorkerNotify>>,
) {
    let mut sel = Select::new();
    for rx in &notify_rx {
        sel.recv(rx);
    }
    let mut live = notify_rx.len();

    while live > 0 {
        let oper = sel.select();
        let index = oper.index();
        match oper.recv(&notify_rx[index]) {
            Ok(WorkerNotify::JobsDone { buffer }) => {
                let record = &completions[index].records[buffer];
                debug_assert!(record.is_in_use());
                // SAFETY: the worker published this slot and will not write
                // it again until it is cleared below.
                let data = unsafe { record.read() };
                for &id in &data.ids[..data.count as usize] {
                    core.pool.finish(JobId(id));
                }
                record.clear();
                tracing::trace!(worker = index, count = data.count, "drained completion record");

                let _guard = core.wait_lock.lock().unwrap();
                core.wait_cv.notify_all();
            }
            Ok(WorkerNotify::ScratchSize { bytes }) => {
                let slot = &core.scratch_replies[index];
                *slot.value.lock().unwrap() = Some(bytes);
                slot.cv.notify_all();
            }
            Err(_) => {
                sel.remove(index);
                live -= 1;
            }
        }
    }
    tracing::debug!("completion collector exiting");
}
