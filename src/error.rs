//! Error types for the fiber I/O layer.
//!
//! Every fallible public API returns [`FiberError`]. Failures that the event
//! loop cannot recover from (multiplexer creation, stack allocation for the
//! event-loop fiber) surface here when the host initializes the runtime
//! explicitly, and abort the process when they happen lazily inside a fiber.

use std::io;
use std::os::fd::RawFd;

use crate::fiber::FiberId;

/// Unified error type for the fiber runtime.
#[derive(Debug, thiserror::Error)]
pub enum FiberError {
    /// The OS refused to map a stack for a new fiber.
    #[error("failed to allocate a {size}-byte fiber stack")]
    StackAllocation {
        size: usize,
        #[source]
        source: io::Error,
    },

    /// The readiness multiplexer could not be created.
    #[error("failed to create the readiness multiplexer")]
    Multiplexer(#[source] io::Error),

    /// The handle is negative or beyond the readiness table capacity.
    #[error("handle {fd} is outside the readiness table (capacity {capacity})")]
    HandleOutOfRange { fd: RawFd, capacity: usize },

    /// Another fiber is already blocked on this handle.
    #[error("handle {fd} already has a waiting fiber ({waiter})")]
    HandleBusy { fd: RawFd, waiter: FiberId },

    /// Blocking waits are reserved for user fibers.
    #[error("system fiber {0} cannot block on I/O")]
    SystemFiber(FiberId),

    /// The fiber has exited or never existed in this runtime.
    #[error("unknown fiber: {0}")]
    UnknownFiber(FiberId),

    /// `reset_timer` was called on a fiber not created by `create_timer`.
    #[error("fiber {0} is not a timer fiber")]
    NotATimer(FiberId),

    /// A runtime is already driving fibers on this thread.
    #[error("a fiber runtime is already running on this thread")]
    AlreadyRunning,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FiberError>;
