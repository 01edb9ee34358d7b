//! Error taxonomy for the synchronization subsystem.
//!
//! Every operation returns a defined outcome: misuse is detected and
//! reported synchronously, never retried by the library, and never allowed
//! to corrupt state. Benign interruptions of the kernel block are retried
//! internally and have no variant here.

use core::fmt;

/// Result alias used across the crate.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced by mutex, condition-variable and lazy-init operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    /// Bad attributes, a deadline on the wrong clock, or a condition
    /// variable already bound to a different mutex.
    InvalidArgument,
    /// `try_lock` on a held mutex, destroy of a busy object, or recursion
    /// count saturation.
    WouldBlock,
    /// Ownership violation: error-checking relock/unlock by the wrong
    /// thread, or waiting on a condition variable without holding the mutex.
    NotOwner,
    /// A timed wait reached its deadline. The mutex was reacquired before
    /// this was returned.
    Timeout,
    /// Operation on a destroyed object. Destruction is terminal.
    Destroyed,
    /// Lazy initialization failed to allocate.
    OutOfMemory,
    /// Process-shared objects requested on a backend without a shared
    /// wait/wake facility. Never silently downgraded.
    Unsupported,
    /// A cooperative cancellation was taken while blocked in a wait. The
    /// mutex was reacquired before this was returned.
    Cancelled,
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SyncError::InvalidArgument => write!(f, "Invalid argument"),
            SyncError::WouldBlock => write!(f, "Operation would block"),
            SyncError::NotOwner => write!(f, "Caller does not own the object"),
            SyncError::Timeout => write!(f, "Deadline elapsed"),
            SyncError::Destroyed => write!(f, "Object has been destroyed"),
            SyncError::OutOfMemory => write!(f, "Out of memory"),
            SyncError::Unsupported => write!(f, "Unsupported configuration"),
            SyncError::Cancelled => write!(f, "Cancelled while waiting"),
        }
    }
}

impl std::error::Error for SyncError {}
