//! # exo_sync: user-space thread synchronization
//!
//! Futex-style mutexes and condition variables with cooperative
//! cancellation, layered over a narrow kernel wait/wake contract
//! ([`park::WaitWake`]).
//!
//! - The mutex fast path is a single CAS with no kernel transition;
//!   contended lockers mark the state word and block on it, and unlock
//!   wakes exactly one marked waiter.
//! - Condition-variable waits fully release the caller's mutex before
//!   blocking and always reacquire it, to the recorded recursion depth,
//!   before any outcome is surfaced (signal, timeout or cancellation).
//! - `Mutex::new()` and `Condvar::new()` are `const`: statically declared
//!   objects start as sentinels and are promoted race-free on first use.
//!   Destruction is terminal.
//! - Cancellation is cooperative: [`cancel::CancelHandle::cancel`] unblocks
//!   a cancellable wait, which returns [`SyncError::Cancelled`] with the
//!   mutex held.
//!
//! ```
//! use exo_sync::{Condvar, Mutex};
//!
//! static M: Mutex = Mutex::new();
//! static CV: Condvar = Condvar::new();
//!
//! M.lock().unwrap();
//! CV.signal().unwrap();
//! M.unlock().unwrap();
//! ```

pub mod cancel;
pub mod error;
mod lazy;
pub mod park;
pub mod sync;
pub mod time;

pub use error::{SyncError, SyncResult};
pub use sync::{CondAttrs, Condvar, Mutex, MutexAttrs, MutexKind};
pub use time::{ClockId, Deadline};
