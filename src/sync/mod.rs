//! Synchronization primitives built on the kernel wait/wake primitive.

pub mod condvar;
pub mod mutex;

pub use condvar::{CondAttrs, Condvar};
pub use mutex::{Mutex, MutexAttrs, MutexKind};
