//! A heterogeneous job-dispatch runtime.
//!
//! A host-side [`JobManager`] submits short procedure-invocation requests to
//! a pool of worker cores. Each worker owns a small private scratch memory
//! and reaches host memory only through asynchronous block transfers; jobs
//! flow through a shared lock-free ring, results flow back through
//! double-buffered completion records and a per-worker mailbox.

pub mod completion;
pub mod config;
pub mod dma;
pub mod logging;
pub mod manager;
pub mod marshal;
pub mod pool;
pub mod proc;
pub mod queue;

pub(crate) mod worker;

pub use offload_api::{
    EaArg, EaDirection, Error, JobDescriptor, JobId, JobStatus, ProcId, ScalarArgs, MAX_EA_ARGS,
    MAX_SCALAR_ARGS,
};

pub use config::{BackoffConfig, Config};
pub use manager::{JobDesc, JobManager, ManagerRef, WaitMode};
pub use proc::{LocalRegion, ProcEntry, ProcFn, ProcTable};
