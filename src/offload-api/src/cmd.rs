//! Messages exchanged over the host<->worker mailboxes.

use serde::{Deserialize, Serialize};

/// Host -> worker control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerControl {
    /// Flush all pending completions and terminate the worker loop.
    Exit,
    /// Reply with the worker's local scratch capacity.
    QueryScratchSize,
}

/// Worker -> host notifications. The mailbox is a single-slot channel; a
/// worker defers opportunistic completion flushes while it is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerNotify {
    /// The completion record in `buffer` (0 or 1) has been filled and is
    /// ready for the host to drain.
    JobsDone { buffer: usize },
    /// Reply to [`WorkerControl::QueryScratchSize`].
    ScratchSize { bytes: usize },
}
