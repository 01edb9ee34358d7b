//! Kernel wait/wake primitive abstraction.
//!
//! The cores block through this two-operation interface so they can run
//! against an in-process simulated backend in tests and a real kernel
//! facility per target. Spurious wakes may happen at any time; callers
//! always re-validate after `wait` returns.

mod sim;

pub use sim::SimWaitWake;

use core::sync::atomic::AtomicU32;
use std::time::Duration;

use spin::Once;

/// Why a `wait` call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Woken by `wake`, or the word no longer held the expected value.
    /// May be spurious.
    Woken,
    /// The relative timeout elapsed.
    TimedOut,
    /// Interrupted by an asynchronous signal. Callers retry the block.
    Interrupted,
}

/// Two-operation block/wake contract consumed by the cores.
pub trait WaitWake: Send + Sync {
    /// Block while `*word == expected`, up to `timeout` if given.
    ///
    /// Returns immediately with [`WaitOutcome::Woken`] when the word does
    /// not hold `expected` at the time of the check.
    fn wait(&self, word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> WaitOutcome;

    /// Wake up to `count` threads blocked on the word at `addr`.
    /// Returns the number of threads woken.
    fn wake(&self, addr: usize, count: u32) -> u32;

    /// Whether this backend can service process-shared objects.
    fn supports_process_shared(&self) -> bool;
}

/// Address identity of a wait word.
#[inline]
pub fn word_addr(word: &AtomicU32) -> usize {
    word as *const AtomicU32 as usize
}

static DEFAULT: Once<SimWaitWake> = Once::new();

/// Process-default backend, created on first use.
pub fn default_backend() -> &'static dyn WaitWake {
    DEFAULT.call_once(SimWaitWake::new)
}
