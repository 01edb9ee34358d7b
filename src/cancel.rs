//! Cooperative cancellation and thread identity.
//!
//! A blocked condition-variable waiter arms its per-thread record
//! immediately before the kernel block and disarms it immediately after.
//! Delivery while armed wakes the recorded wait word; the mutex-reacquire
//! cleanup runs exactly once on every exit path through [`ReacquireGuard`].

use core::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use spin::Mutex as SpinMutex;

use crate::park::WaitWake;
use crate::sync::mutex::MutexInner;

bitflags! {
    /// Packed per-thread cancellation bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct CancelFlags: u8 {
        /// A cancellation request has been delivered and not yet taken.
        const PENDING = 1 << 0;
        /// Cancellation is disabled for this thread.
        const DISABLED = 1 << 1;
    }
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// Per-thread cancellation record.
pub(crate) struct CancelState {
    id: u64,
    flags: AtomicU8,
    /// Wait-word address while armed, 0 otherwise. Cleared at the
    /// armed -> disarmed transition so a request landing exactly at that
    /// boundary cannot double-run cleanup.
    armed_word: AtomicUsize,
    /// Backend the armed waiter blocks through. Each object carries its
    /// own backend, so delivery must wake through the waiter's, not the
    /// process default. Written before `armed_word` is set and cleared
    /// after it is zeroed.
    armed_backend: SpinMutex<Option<&'static dyn WaitWake>>,
}

impl CancelState {
    fn new() -> Self {
        Self {
            id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            flags: AtomicU8::new(0),
            armed_word: AtomicUsize::new(0),
            armed_backend: SpinMutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn flags(&self) -> CancelFlags {
        CancelFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    /// Pending and not disabled.
    pub(crate) fn cancel_pending(&self) -> bool {
        let f = self.flags();
        f.contains(CancelFlags::PENDING) && !f.contains(CancelFlags::DISABLED)
    }

    /// Whether this thread currently takes cancellation at all. A disabled
    /// thread must not arm: an armed waiter that ignores the pending flag
    /// would leave the canceller waking it forever.
    pub(crate) fn cancel_enabled(&self) -> bool {
        !self.flags().contains(CancelFlags::DISABLED)
    }

    // SeqCst on arm/disarm and on the pending bit: the waiter stores
    // armed_word then loads PENDING, the canceller stores PENDING then
    // loads armed_word. Store-load ordering both ways is required so at
    // least one side observes the other.
    pub(crate) fn arm(&self, word_addr: usize, backend: &'static dyn WaitWake) {
        *self.armed_backend.lock() = Some(backend);
        self.armed_word.store(word_addr, Ordering::SeqCst);
    }

    pub(crate) fn disarm(&self) {
        self.armed_word.store(0, Ordering::SeqCst);
        *self.armed_backend.lock() = None;
    }
}

thread_local! {
    static CURRENT: Arc<CancelState> = Arc::new(CancelState::new());
}

pub(crate) fn current_state() -> Arc<CancelState> {
    CURRENT.with(Arc::clone)
}

/// Identity of the calling thread, used for mutex ownership bookkeeping.
/// Never zero.
pub(crate) fn current_thread_id() -> u64 {
    CURRENT.with(|s| s.id())
}

/// Sendable handle to a thread's cancellation state.
#[derive(Clone)]
pub struct CancelHandle(Arc<CancelState>);

/// Handle for cancelling the calling thread from elsewhere.
pub fn current() -> CancelHandle {
    CancelHandle(current_state())
}

impl CancelHandle {
    /// Deliver a cooperative cancellation request.
    ///
    /// If the target is blocked in a cancellable wait its wait word is
    /// woken. Waking repeats until the target leaves its armed blocking
    /// region, so a request landing between the target's pending check and
    /// its kernel block cannot be missed. Extra wakes on the shared word
    /// surface as benign spurious wakeups for other waiters.
    pub fn cancel(&self) {
        self.0
            .flags
            .fetch_or(CancelFlags::PENDING.bits(), Ordering::SeqCst);
        loop {
            let addr = self.0.armed_word.load(Ordering::SeqCst);
            if addr == 0 {
                break;
            }
            // The backend slot is cleared only after the armed word is
            // zeroed, so a None here means the target is disarming; the
            // next iteration observes the zeroed word and exits.
            let backend = *self.0.armed_backend.lock();
            if let Some(backend) = backend {
                log::trace!("cancel delivered to thread {} while armed", self.0.id);
                backend.wake(addr, u32::MAX);
            }
            std::thread::yield_now();
        }
    }

    /// Whether a request has been delivered (taken or not).
    pub fn is_cancel_requested(&self) -> bool {
        self.0.flags().contains(CancelFlags::PENDING)
    }
}

/// Enable or disable cancellation for the calling thread; returns the
/// previous setting. Internal runtime callers disable this around waits
/// that must not become cancellation points.
pub fn set_cancel_enabled(enabled: bool) -> bool {
    CURRENT.with(|s| {
        let prev = !s.flags().contains(CancelFlags::DISABLED);
        if enabled {
            s.flags
                .fetch_and(!CancelFlags::DISABLED.bits(), Ordering::SeqCst);
        } else {
            s.flags
                .fetch_or(CancelFlags::DISABLED.bits(), Ordering::SeqCst);
        }
        prev
    })
}

/// Transient record of a mutex released for a condition-variable wait.
///
/// Teardown reacquires the mutex to the recorded recursion depth exactly
/// once, on every exit path including panic unwind.
pub(crate) struct ReacquireGuard<'a> {
    mutex: &'a MutexInner,
    depth: u32,
    done: bool,
}

impl<'a> ReacquireGuard<'a> {
    pub(crate) fn new(mutex: &'a MutexInner, depth: u32) -> Self {
        Self {
            mutex,
            depth,
            done: false,
        }
    }

    /// Reacquire on the normal, timeout or cancellation return path.
    pub(crate) fn finish(mut self) {
        self.relock();
    }

    fn relock(&mut self) {
        if !self.done {
            self.done = true;
            self.mutex.relock(self.depth);
        }
    }
}

impl Drop for ReacquireGuard<'_> {
    fn drop(&mut self) {
        self.relock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_roundtrip() {
        let f = CancelFlags::PENDING | CancelFlags::DISABLED;
        assert_eq!(CancelFlags::from_bits_truncate(f.bits()), f);
        assert!(!CancelFlags::from_bits_truncate(0).contains(CancelFlags::PENDING));
    }

    #[test]
    fn disabled_masks_pending() {
        let state = CancelState::new();
        state
            .flags
            .fetch_or(CancelFlags::PENDING.bits(), Ordering::SeqCst);
        assert!(state.cancel_pending());
        state
            .flags
            .fetch_or(CancelFlags::DISABLED.bits(), Ordering::SeqCst);
        assert!(!state.cancel_pending());
    }

    #[test]
    fn set_cancel_enabled_reports_previous() {
        assert!(set_cancel_enabled(false));
        assert!(!set_cancel_enabled(true));
        assert!(set_cancel_enabled(true));
    }

    #[test]
    fn handle_observes_request() {
        let handle = CancelHandle(Arc::new(CancelState::new()));
        assert!(!handle.is_cancel_requested());
        handle.cancel();
        assert!(handle.is_cancel_requested());
    }
}
