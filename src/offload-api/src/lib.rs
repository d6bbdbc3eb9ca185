//! Data model shared between the host-side job manager and the worker
//! runtime: job descriptors, completion records, mailbox messages, and the
//! public error taxonomy.

pub mod cmd;
pub mod error;
pub mod job;

pub use error::Error;
pub use job::{
    EaArg, EaDirection, JobDescriptor, JobId, JobStatus, ProcId, ScalarArgs, MAX_EA_ARGS,
    MAX_SCALAR_ARGS,
};
