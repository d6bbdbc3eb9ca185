use std::fmt;

use serde::{Deserialize, Serialize};

/// Ceiling on the number of remote-memory arguments a single job may carry.
/// Exceeding it is caller misuse and panics at `add_ea_arg`.
pub const MAX_EA_ARGS: usize = 8;

/// Number of scalar slots in the direct input/output argument blocks.
pub const MAX_SCALAR_ARGS: usize = 8;

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcId(pub u32);

impl ProcId {
    pub const INVALID: ProcId = ProcId(u32::MAX);
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub u32);

/// Terminal outcome of a job, written back by the worker that ran it.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending = 0,
    Ok = 1,
    UnknownProc = 2,
    ArgsTooLong = 3,
}

/// Direction of a remote-memory argument, seen from the worker.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EaDirection {
    /// Transferred from host memory into worker scratch before invocation.
    Get = 0,
    /// Allocated in worker scratch and transferred back out after invocation.
    Put = 1,
}

/// One remote-memory argument entry. `local_addr` is populated by the worker
/// during marshaling; the host fills the other three fields.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EaArg {
    pub ea_addr: u64,
    pub local_addr: u64,
    pub size: u32,
    pub direction: EaDirection,
}

impl EaArg {
    const EMPTY: EaArg = EaArg {
        ea_addr: 0,
        local_addr: 0,
        size: 0,
        direction: EaDirection::Get,
    };
}

/// Fixed-shape block of scalar values passed to (or produced by) a procedure.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ScalarArgs {
    pub arg: [u64; MAX_SCALAR_ARGS],
    pub nargs: u32,
}

impl ScalarArgs {
    pub const fn new() -> Self {
        ScalarArgs {
            arg: [0; MAX_SCALAR_ARGS],
            nargs: 0,
        }
    }

    /// Appends a scalar value. Panics when all slots are taken.
    pub fn push(&mut self, value: u64) {
        assert!(
            (self.nargs as usize) < MAX_SCALAR_ARGS,
            "scalar argument block full"
        );
        self.arg[self.nargs as usize] = value;
        self.nargs += 1;
    }
}

impl Default for ScalarArgs {
    fn default() -> Self {
        Self::new()
    }
}

/// A request record naming a procedure plus its scalar and remote-memory
/// arguments, carrying an outcome status.
///
/// The descriptor is a flat POD record: workers fetch and write it back with
/// block transfers, so it must not own heap storage.
///
/// Ownership: exclusively the host's while `Pending` (unsubmitted) or after
/// completion; logically lent to exactly one worker in between.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct JobDescriptor {
    pub input: ScalarArgs,
    pub output: ScalarArgs,
    pub ea: [EaArg; MAX_EA_ARGS],
    pub n_ea: u32,
    pub proc_id: ProcId,
    pub status: JobStatus,
}

impl JobDescriptor {
    pub const fn new() -> Self {
        JobDescriptor {
            input: ScalarArgs::new(),
            output: ScalarArgs::new(),
            ea: [EaArg::EMPTY; MAX_EA_ARGS],
            n_ea: 0,
            proc_id: ProcId::INVALID,
            status: JobStatus::Pending,
        }
    }

    /// Clears the descriptor back to its freshly-allocated state so it can be
    /// refilled and resubmitted.
    pub fn reset(&mut self) {
        *self = JobDescriptor::new();
    }

    /// Appends a remote-memory argument. Panics past `MAX_EA_ARGS`; the
    /// ceiling is a static contract, not a runtime condition.
    pub fn add_ea_arg(&mut self, ea_addr: u64, size: u32, direction: EaDirection) {
        assert!(
            (self.n_ea as usize) < MAX_EA_ARGS,
            "remote-argument list full ({} entries)",
            MAX_EA_ARGS
        );
        self.ea[self.n_ea as usize] = EaArg {
            ea_addr,
            local_addr: 0,
            size,
            direction,
        };
        self.n_ea += 1;
    }

    #[inline]
    pub fn ea_args(&self) -> &[EaArg] {
        &self.ea[..self.n_ea as usize]
    }
}

impl Default for JobDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Ok => "OK",
            JobStatus::UnknownProc => "UNKNOWN_PROC",
            JobStatus::ArgsTooLong => "ARGS_TOO_LONG",
        };
        f.pad(s)
    }
}
