//! Condition variable core: wait/signal/broadcast tied to a caller-held
//! mutex, built on the kernel primitive and the mutex core.
//!
//! The wait word is a sequence counter bumped by signal/broadcast. A waiter
//! snapshots it under the condvar's own internal lock, fully releases the
//! user mutex, blocks on the word, then reacquires the mutex to the
//! recorded depth no matter why the block ended.

use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex as SpinMutex;

use crate::cancel::{self, ReacquireGuard};
use crate::error::{SyncError, SyncResult};
use crate::lazy::LazyHandle;
use crate::park::{self, word_addr, WaitOutcome, WaitWake};
use crate::sync::mutex::{Mutex, MutexInner};
use crate::time::{ClockId, Deadline};

/// Attributes consumed read-only at init time.
#[derive(Debug, Clone, Copy, Default)]
pub struct CondAttrs {
    /// Clock timed waits are measured against; fixed at creation.
    pub clock: ClockId,
    pub process_shared: bool,
}

/// Bookkeeping protected by the condvar's internal lock (distinct from any
/// user mutex, never held across a blocking call).
struct CondBook {
    /// Address of the mutex all current waiters are associated with;
    /// 0 while there are no waiters.
    bound_mutex: usize,
    waiters: u32,
}

pub(crate) struct CondInner {
    /// Kernel wait word: bumped on every signal/broadcast.
    seq: AtomicU32,
    book: SpinMutex<CondBook>,
    clock: ClockId,
    backend: &'static dyn WaitWake,
}

impl CondInner {
    pub(crate) fn try_new(attrs: CondAttrs, backend: &'static dyn WaitWake) -> SyncResult<Self> {
        if attrs.process_shared && !backend.supports_process_shared() {
            return Err(SyncError::Unsupported);
        }
        Ok(Self {
            seq: AtomicU32::new(0),
            book: SpinMutex::new(CondBook {
                bound_mutex: 0,
                waiters: 0,
            }),
            clock: attrs.clock,
            backend,
        })
    }

    pub(crate) fn wait_common(
        &self,
        mutex: &MutexInner,
        deadline: Option<&Deadline>,
        cancellable: bool,
    ) -> SyncResult<()> {
        if let Some(d) = deadline {
            d.check_clock(self.clock)?;
        }
        if mutex.owner_id() != cancel::current_thread_id() {
            return Err(SyncError::NotOwner);
        }

        let maddr = mutex as *const MutexInner as usize;
        let expected;
        {
            // All concurrent waiters must be associated with one mutex.
            let mut book = self.book.lock();
            if book.waiters == 0 {
                book.bound_mutex = maddr;
            } else if book.bound_mutex != maddr {
                return Err(SyncError::InvalidArgument);
            }
            book.waiters += 1;
            // Snapshot the wait word while registered: a signal bumping it
            // after this point changes the word, so the kernel block below
            // returns immediately instead of sleeping.
            expected = self.seq.load(Ordering::Acquire);
        }

        // Release before blocking: a signaler that needs the mutex to
        // proceed must not deadlock against the about-to-block waiter.
        let depth = match mutex.release_for_wait() {
            Ok(depth) => depth,
            Err(e) => {
                self.remove_waiter();
                return Err(e);
            }
        };
        let cleanup = ReacquireGuard::new(mutex, depth);

        let state = cancel::current_state();
        // A thread that disabled cancellation waits as if non-cancellable.
        let cancellable = cancellable && state.cancel_enabled();
        let mut timed_out = false;
        let mut cancelled = false;
        if cancellable {
            state.arm(word_addr(&self.seq), self.backend);
        }
        loop {
            if cancellable && state.cancel_pending() {
                cancelled = true;
                break;
            }
            let timeout = match deadline {
                Some(d) => {
                    let rel = d.remaining();
                    if rel.is_zero() {
                        timed_out = true;
                        break;
                    }
                    Some(rel)
                }
                None => None,
            };
            match self.backend.wait(&self.seq, expected, timeout) {
                // Benign interruption by an asynchronous signal: retry the
                // blocking call, never surface it to the caller.
                WaitOutcome::Interrupted => continue,
                WaitOutcome::TimedOut => {
                    timed_out = true;
                    break;
                }
                WaitOutcome::Woken => {
                    if cancellable && state.cancel_pending() {
                        cancelled = true;
                    }
                    break;
                }
            }
        }
        if cancellable {
            state.disarm();
        }

        self.remove_waiter();

        // Reacquire to the recorded depth before any outcome is surfaced.
        cleanup.finish();

        if cancelled {
            Err(SyncError::Cancelled)
        } else if timed_out {
            Err(SyncError::Timeout)
        } else {
            Ok(())
        }
    }

    fn remove_waiter(&self) {
        let mut book = self.book.lock();
        book.waiters -= 1;
        if book.waiters == 0 {
            book.bound_mutex = 0;
        }
    }

    /// Bump the wait word and wake up to `count` waiters. Never blocks.
    fn wake(&self, count: u32) {
        let waiters;
        {
            // Bump under the internal lock so it is ordered against waiter
            // snapshots taken under the same lock.
            let book = self.book.lock();
            self.seq.fetch_add(1, Ordering::Release);
            waiters = book.waiters;
        }
        if waiters > 0 {
            self.backend.wake(word_addr(&self.seq), count);
        }
    }

    fn waiters(&self) -> u32 {
        self.book.lock().waiters
    }
}

/// Condition variable with wait/signal/broadcast operations.
///
/// `Condvar::new()` is `const`: a statically declared condition variable
/// begins as a sentinel and is promoted race-free on its first operation,
/// with default attributes (monotonic clock, process-private). Use
/// [`Condvar::with_attrs`] for eager initialization.
pub struct Condvar {
    cell: LazyHandle<CondInner>,
}

impl Condvar {
    /// Statically declarable condition variable, initialized lazily.
    pub const fn new() -> Self {
        Self {
            cell: LazyHandle::uninit(),
        }
    }

    /// Eagerly initialized condition variable with the given attributes.
    pub fn with_attrs(attrs: CondAttrs) -> SyncResult<Self> {
        let inner = CondInner::try_new(attrs, park::default_backend())?;
        Ok(Self {
            cell: LazyHandle::new_live(inner)?,
        })
    }

    fn inner(&self) -> SyncResult<&CondInner> {
        self.cell
            .resolve(|| CondInner::try_new(CondAttrs::default(), park::default_backend()))
    }

    fn wait_impl(
        &self,
        mutex: &Mutex,
        deadline: Option<Deadline>,
        cancellable: bool,
    ) -> SyncResult<()> {
        let inner = self.inner()?;
        let m = mutex.inner()?;
        inner.wait_common(m, deadline.as_ref(), cancellable)
    }

    /// Release `mutex`, wait until signalled, reacquire `mutex`.
    ///
    /// Cancellation point: a delivered cancellation returns
    /// [`SyncError::Cancelled`] with the mutex reacquired. Spurious returns
    /// are possible; callers re-check their predicate.
    pub fn wait(&self, mutex: &Mutex) -> SyncResult<()> {
        self.wait_impl(mutex, None, true)
    }

    /// [`Condvar::wait`] bounded by an absolute deadline on the clock fixed
    /// at creation. The mutex is reacquired before [`SyncError::Timeout`]
    /// is returned, even for a deadline already in the past.
    pub fn timedwait(&self, mutex: &Mutex, deadline: Deadline) -> SyncResult<()> {
        self.wait_impl(mutex, Some(deadline), true)
    }

    /// Non-cancellable [`Condvar::wait`], for callers that must not become
    /// cancellation points mid-operation.
    pub fn wait_nocancel(&self, mutex: &Mutex) -> SyncResult<()> {
        self.wait_impl(mutex, None, false)
    }

    /// Non-cancellable [`Condvar::timedwait`].
    pub fn timedwait_nocancel(&self, mutex: &Mutex, deadline: Deadline) -> SyncResult<()> {
        self.wait_impl(mutex, Some(deadline), false)
    }

    /// Wake at most one waiter.
    pub fn signal(&self) -> SyncResult<()> {
        self.inner()?.wake(1);
        Ok(())
    }

    /// Wake all waiters.
    pub fn broadcast(&self) -> SyncResult<()> {
        self.inner()?.wake(u32::MAX);
        Ok(())
    }

    /// Clock timed waits are measured against.
    pub fn clock(&self) -> SyncResult<ClockId> {
        Ok(self.inner()?.clock)
    }

    /// Destroy the condition variable. Busy while waiters are present;
    /// destruction is terminal.
    pub fn destroy(&self) -> SyncResult<()> {
        if let Some(inner) = self.cell.get()? {
            if inner.waiters() > 0 {
                return Err(SyncError::WouldBlock);
            }
        }
        log::trace!("condvar destroyed");
        self.cell.destroy()
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}
