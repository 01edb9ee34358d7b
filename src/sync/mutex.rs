//! Mutex core: ownership, recursion, contention-aware locking built on the
//! kernel wait/wake primitive.
//!
//! The state word is a classic three-state futex word: a single CAS
//! acquires an uncontended mutex with no kernel transition; contended
//! lockers mark the word and block on it; unlock wakes one marked waiter.
//! Owner identity and the recursion count are bookkeeping written only by
//! the thread that holds the word.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::cancel;
use crate::error::{SyncError, SyncResult};
use crate::lazy::LazyHandle;
use crate::park::{self, word_addr, WaitOutcome, WaitWake};
use crate::time::Deadline;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
/// Locked with at least one thread blocked on the word.
const CONTENDED: u32 = 2;

/// Relock and unlock-by-owner policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MutexKind {
    /// No self-relock detection; a self-relock deadlocks.
    #[default]
    Normal,
    /// Self-relock increments a recursion count; N locks need N unlocks.
    Recursive,
    /// Self-relock and unlock by a non-owner return errors.
    ErrorCheck,
}

/// Attributes consumed read-only at init time.
#[derive(Debug, Clone, Copy, Default)]
pub struct MutexAttrs {
    pub kind: MutexKind,
    pub process_shared: bool,
}

/// Live mutex object behind the handle cell.
pub(crate) struct MutexInner {
    word: AtomicU32,
    /// Thread id of the owner, 0 while unlocked. Stored by the acquiring
    /// thread right after it wins the word.
    owner: AtomicU64,
    /// Nested lock count; nonzero only while locked, written only by the
    /// owner.
    recursion: AtomicU32,
    kind: MutexKind,
    backend: &'static dyn WaitWake,
}

impl MutexInner {
    pub(crate) fn try_new(attrs: MutexAttrs, backend: &'static dyn WaitWake) -> SyncResult<Self> {
        if attrs.process_shared && !backend.supports_process_shared() {
            return Err(SyncError::Unsupported);
        }
        Ok(Self {
            word: AtomicU32::new(UNLOCKED),
            owner: AtomicU64::new(0),
            recursion: AtomicU32::new(0),
            kind: attrs.kind,
            backend,
        })
    }

    pub(crate) fn owner_id(&self) -> u64 {
        self.owner.load(Ordering::Acquire)
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.word.load(Ordering::Acquire) != UNLOCKED
    }

    /// Word-level acquire: CAS fast path, futex-style slow path.
    fn lock_word(&self, deadline: Option<&Deadline>) -> SyncResult<()> {
        if self
            .word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return Ok(());
        }
        self.lock_word_slow(deadline)
    }

    #[cold]
    fn lock_word_slow(&self, deadline: Option<&Deadline>) -> SyncResult<()> {
        loop {
            // Acquire through here always leaves the word CONTENDED, so the
            // eventual unlock knows to wake someone. A wasted wake when the
            // last waiter timed out is possible and harmless.
            if self.word.swap(CONTENDED, Ordering::Acquire) == UNLOCKED {
                return Ok(());
            }
            let timeout = match deadline {
                Some(d) => {
                    let rel = d.remaining();
                    if rel.is_zero() {
                        return Err(SyncError::Timeout);
                    }
                    Some(rel)
                }
                None => None,
            };
            match self.backend.wait(&self.word, CONTENDED, timeout) {
                WaitOutcome::TimedOut => return Err(SyncError::Timeout),
                // Spurious and interrupted wakes retry the swap above.
                WaitOutcome::Woken | WaitOutcome::Interrupted => {}
            }
        }
    }

    fn unlock_word(&self) {
        if self.word.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            self.backend.wake(word_addr(&self.word), 1);
        }
    }

    fn relock_nested(&self) -> SyncResult<()> {
        let depth = self.recursion.load(Ordering::Relaxed);
        // Saturation, not wraparound into "unlocked" bookkeeping.
        let next = depth.checked_add(1).ok_or(SyncError::WouldBlock)?;
        self.recursion.store(next, Ordering::Relaxed);
        Ok(())
    }

    /// Acquire with kind semantics; bounded by `deadline` when given.
    pub(crate) fn lock(&self, deadline: Option<&Deadline>) -> SyncResult<()> {
        let me = cancel::current_thread_id();
        if self.owner.load(Ordering::Acquire) == me {
            match self.kind {
                MutexKind::Recursive => return self.relock_nested(),
                MutexKind::ErrorCheck => return Err(SyncError::NotOwner),
                // A Normal self-relock blocks on the word below, as POSIX
                // specifies.
                MutexKind::Normal => {}
            }
        }
        self.lock_word(deadline)?;
        self.owner.store(me, Ordering::Release);
        self.recursion.store(1, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn try_lock(&self) -> SyncResult<()> {
        let me = cancel::current_thread_id();
        if self.owner.load(Ordering::Acquire) == me {
            return match self.kind {
                MutexKind::Recursive => self.relock_nested(),
                _ => Err(SyncError::WouldBlock),
            };
        }
        if self
            .word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner.store(me, Ordering::Release);
            self.recursion.store(1, Ordering::Relaxed);
            Ok(())
        } else {
            Err(SyncError::WouldBlock)
        }
    }

    pub(crate) fn unlock(&self) -> SyncResult<()> {
        let me = cancel::current_thread_id();
        if self.owner.load(Ordering::Acquire) != me {
            return Err(SyncError::NotOwner);
        }
        let depth = self.recursion.load(Ordering::Relaxed);
        if depth > 1 {
            self.recursion.store(depth - 1, Ordering::Relaxed);
            return Ok(());
        }
        self.recursion.store(0, Ordering::Relaxed);
        self.owner.store(0, Ordering::Release);
        self.unlock_word();
        Ok(())
    }

    /// Full release on entry to a condition-variable wait: capture the
    /// recursion depth, drop ownership, one word-level unlock.
    pub(crate) fn release_for_wait(&self) -> SyncResult<u32> {
        let me = cancel::current_thread_id();
        if self.owner.load(Ordering::Acquire) != me {
            return Err(SyncError::NotOwner);
        }
        let depth = self.recursion.load(Ordering::Relaxed);
        self.recursion.store(0, Ordering::Relaxed);
        self.owner.store(0, Ordering::Release);
        self.unlock_word();
        Ok(depth)
    }

    /// Reacquire after a wait, restoring the recorded depth. Untimed and
    /// non-cancellable: the wait's outcome is already decided.
    pub(crate) fn relock(&self, depth: u32) {
        // No deadline, so the word-level acquire cannot fail.
        let _ = self.lock_word(None);
        self.owner
            .store(cancel::current_thread_id(), Ordering::Release);
        self.recursion.store(depth.max(1), Ordering::Relaxed);
    }
}

/// Futex-style mutex with explicit lock/unlock operations.
///
/// `Mutex::new()` is `const`: a statically declared mutex begins as a
/// sentinel and is promoted race-free on its first operation, with default
/// attributes. Use [`Mutex::with_attrs`] for eager initialization.
pub struct Mutex {
    cell: LazyHandle<MutexInner>,
}

impl Mutex {
    /// Statically declarable mutex, initialized lazily on first operation.
    pub const fn new() -> Self {
        Self {
            cell: LazyHandle::uninit(),
        }
    }

    /// Eagerly initialized mutex with the given attributes.
    pub fn with_attrs(attrs: MutexAttrs) -> SyncResult<Self> {
        let inner = MutexInner::try_new(attrs, park::default_backend())?;
        Ok(Self {
            cell: LazyHandle::new_live(inner)?,
        })
    }

    pub(crate) fn inner(&self) -> SyncResult<&MutexInner> {
        self.cell
            .resolve(|| MutexInner::try_new(MutexAttrs::default(), park::default_backend()))
    }

    /// Block until the mutex is acquired.
    pub fn lock(&self) -> SyncResult<()> {
        self.inner()?.lock(None)
    }

    /// Acquire, giving up with [`SyncError::Timeout`] at the deadline.
    pub fn lock_deadline(&self, deadline: Deadline) -> SyncResult<()> {
        self.inner()?.lock(Some(&deadline))
    }

    /// Acquire without blocking; [`SyncError::WouldBlock`] if held.
    pub fn try_lock(&self) -> SyncResult<()> {
        self.inner()?.try_lock()
    }

    /// Release; [`SyncError::NotOwner`] if the caller does not hold it.
    pub fn unlock(&self) -> SyncResult<()> {
        self.inner()?.unlock()
    }

    /// Destroy the mutex. A held mutex is busy ([`SyncError::WouldBlock`]);
    /// destruction is terminal and later operations return
    /// [`SyncError::Destroyed`].
    pub fn destroy(&self) -> SyncResult<()> {
        if let Some(inner) = self.cell.get()? {
            if inner.is_locked() {
                return Err(SyncError::WouldBlock);
            }
        }
        log::trace!("mutex destroyed");
        self.cell.destroy()
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use static_assertions::{assert_impl_all, const_assert};
    use std::thread;

    assert_impl_all!(Mutex: Send, Sync);
    const_assert!(core::mem::size_of::<MutexInner>() <= 64);

    #[test]
    fn lock_unlock_roundtrip() {
        let m = Mutex::new();
        assert_eq!(m.lock(), Ok(()));
        assert_eq!(m.unlock(), Ok(()));
        assert_eq!(m.unlock(), Err(SyncError::NotOwner));
    }

    #[test]
    fn try_lock_reports_busy() {
        let m = Mutex::new();
        m.lock().unwrap();
        thread::scope(|s| {
            let busy = s.spawn(|| m.try_lock()).join().unwrap();
            assert_eq!(busy, Err(SyncError::WouldBlock));
        });
        m.unlock().unwrap();
    }

    #[test]
    fn error_check_detects_self_relock() {
        let m = Mutex::with_attrs(MutexAttrs {
            kind: MutexKind::ErrorCheck,
            process_shared: false,
        })
        .unwrap();
        m.lock().unwrap();
        assert_eq!(m.lock(), Err(SyncError::NotOwner));
        m.unlock().unwrap();
    }

    #[test]
    fn error_check_rejects_foreign_unlock() {
        let m = Mutex::with_attrs(MutexAttrs {
            kind: MutexKind::ErrorCheck,
            process_shared: false,
        })
        .unwrap();
        m.lock().unwrap();
        thread::scope(|s| {
            let r = s.spawn(|| m.unlock()).join().unwrap();
            assert_eq!(r, Err(SyncError::NotOwner));
        });
        m.unlock().unwrap();
    }

    #[test]
    fn destroyed_mutex_rejects_operations() {
        let m = Mutex::new();
        m.lock().unwrap();
        assert_eq!(m.destroy(), Err(SyncError::WouldBlock));
        m.unlock().unwrap();
        assert_eq!(m.destroy(), Ok(()));
        assert_eq!(m.lock(), Err(SyncError::Destroyed));
        assert_eq!(m.try_lock(), Err(SyncError::Destroyed));
        assert_eq!(m.destroy(), Err(SyncError::Destroyed));
    }

    #[test]
    fn destroying_an_unused_static_sentinel_is_terminal() {
        let m = Mutex::new();
        assert_eq!(m.destroy(), Ok(()));
        assert_eq!(m.lock(), Err(SyncError::Destroyed));
    }

    #[test]
    fn process_shared_is_unsupported_on_private_backend() {
        let r = Mutex::with_attrs(MutexAttrs {
            kind: MutexKind::Normal,
            process_shared: true,
        });
        assert_eq!(r.err(), Some(SyncError::Unsupported));
    }

    #[test]
    fn lock_deadline_times_out_on_held_mutex() {
        use crate::time::ClockId;
        use std::time::Duration;

        let m = Mutex::new();
        m.lock().unwrap();
        thread::scope(|s| {
            let r = s
                .spawn(|| {
                    m.lock_deadline(Deadline::after(
                        ClockId::Monotonic,
                        Duration::from_millis(20),
                    ))
                })
                .join()
                .unwrap();
            assert_eq!(r, Err(SyncError::Timeout));
        });
        m.unlock().unwrap();
        assert_eq!(
            m.lock_deadline(Deadline::after(
                crate::time::ClockId::Monotonic,
                std::time::Duration::from_millis(20)
            )),
            Ok(())
        );
        m.unlock().unwrap();
    }

    proptest! {
        #[test]
        fn recursive_needs_matching_unlocks(depth in 1u32..64) {
            let m = Mutex::with_attrs(MutexAttrs {
                kind: MutexKind::Recursive,
                process_shared: false,
            })
            .unwrap();
            for _ in 0..depth {
                m.lock().unwrap();
            }
            for _ in 0..depth {
                m.unlock().unwrap();
            }
            prop_assert_eq!(m.unlock(), Err(SyncError::NotOwner));
        }
    }
}
