//! Error type shared by every verb of the model.

use std::io;

use nix::errno::Errno;
use thiserror::Error;

use crate::graph::{Blocker, ResourceKind};

/// Errors reported synchronously by the verbs of the model.
///
/// Data-path failures (missing access rights, receive buffers that are too short) are not
/// reported here; they surface as a [`WcStatus`](crate::WcStatus) on the resulting
/// [`WorkCompletion`](crate::WorkCompletion), just like on real hardware.
#[derive(Debug, Error)]
pub enum Error {
    /// A bad enum or range value was passed. Nothing was created or modified.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A destroy was attempted while something still depends on the resource. The resource
    /// stays alive and the destroy can be retried once the blocker is gone.
    #[error("cannot destroy {target}: {blocker}")]
    ResourceBusy {
        /// The kind of resource whose destruction was refused.
        target: ResourceKind,
        /// What keeps it alive.
        blocker: Blocker,
    },

    /// Posting the list would exceed the configured work queue depth. No request of the list
    /// was posted.
    #[error("work queue overflow: {requested} requests posted with room for {available}")]
    QueueOverflow {
        /// Number of requests in the rejected list.
        requested: usize,
        /// Number of free slots in the work queue.
        available: usize,
    },

    /// The `next` chain of a work request list loops. No request of the list was posted.
    #[error("work request list loops back to request #{bad_wr}")]
    CycleDetected {
        /// Index of the first request that was visited twice.
        bad_wr: usize,
    },

    /// There is no device (or no usable device) to open.
    #[error("no RDMA device available")]
    NoDevice,

    /// The device context has been closed.
    #[error("device context is closed")]
    ContextClosed,

    /// The handle was already destroyed, or belongs to another context.
    #[error("stale or foreign {0} handle")]
    StaleHandle(ResourceKind),

    /// No completion event is pending and the wait policy does not allow waiting.
    #[error("no completion event pending")]
    WouldBlock,

    /// No completion event arrived before the timeout expired.
    #[error("timed out waiting for a completion event")]
    TimedOut,

    /// More completions were produced than the completion queue can hold.
    #[error("completion queue overrun")]
    CompletionQueueOverrun,

    /// A system call (or a remote agent relaying one) failed with this errno.
    #[error("system call failed: {0}")]
    Sys(#[from] Errno),

    /// An I/O error from the host.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// The errno a verbs implementation reports for this error.
    ///
    /// Errnos coming from the host or from a remote agent are passed through unchanged.
    pub fn errno(&self) -> Errno {
        match self {
            Error::InvalidArgument(_) | Error::CycleDetected { .. } | Error::StaleHandle(_) => {
                Errno::EINVAL
            }
            Error::ResourceBusy { .. } => Errno::EBUSY,
            Error::QueueOverflow { .. } => Errno::ENOMEM,
            Error::NoDevice | Error::ContextClosed => Errno::ENODEV,
            Error::WouldBlock => Errno::EAGAIN,
            Error::TimedOut => Errno::ETIMEDOUT,
            Error::CompletionQueueOverrun => Errno::EOVERFLOW,
            Error::Sys(errno) => *errno,
            Error::Io(e) => e.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO),
        }
    }

    /// Returns `true` for the "destroyed out of dependency order" outcome.
    pub fn is_busy(&self) -> bool {
        matches!(self, Error::ResourceBusy { .. })
    }
}

/// Result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
