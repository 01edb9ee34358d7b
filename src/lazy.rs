//! Static initialization guard.
//!
//! Statically declared objects begin life as a sentinel word and are
//! promoted to a live heap handle exactly once, race-free, on first use.
//! Destruction is terminal: a destroyed handle rejects every further
//! operation and is never silently reinitialized.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::alloc::{alloc, Layout};

use spin::{Mutex as SpinMutex, Once};

use crate::error::{SyncError, SyncResult};

/// "Declared but never initialized" sentinel.
const UNINIT: usize = 0;
/// "Destroyed" sentinel. Terminal.
const DESTROYED: usize = 1;

static STATIC_INIT: Once<SpinMutex<()>> = Once::new();

/// The single coarse-grained lock in the subsystem: serializes lazy
/// promotion and destruction. Never held across a blocking call.
fn static_init_lock() -> &'static SpinMutex<()> {
    STATIC_INIT.call_once(|| SpinMutex::new(()))
}

/// Fallible allocation: the only allocator use in the subsystem.
fn try_box<T>(value: T) -> SyncResult<Box<T>> {
    let layout = Layout::new::<T>();
    // SAFETY: layout has nonzero size for every T stored behind a handle;
    // the write initializes the allocation before Box takes ownership.
    unsafe {
        let ptr = alloc(layout) as *mut T;
        if ptr.is_null() {
            return Err(SyncError::OutOfMemory);
        }
        ptr.write(value);
        Ok(Box::from_raw(ptr))
    }
}

/// Handle cell holding a sentinel or a live boxed object.
///
/// Live pointers come from `Box::into_raw` and are aligned to at least 4,
/// so they can never collide with the sentinel values.
pub(crate) struct LazyHandle<T> {
    state: AtomicUsize,
    _marker: PhantomData<Box<T>>,
}

unsafe impl<T: Send + Sync> Send for LazyHandle<T> {}
unsafe impl<T: Send + Sync> Sync for LazyHandle<T> {}

impl<T> LazyHandle<T> {
    /// Statically declarable sentinel cell.
    pub const fn uninit() -> Self {
        Self {
            state: AtomicUsize::new(UNINIT),
            _marker: PhantomData,
        }
    }

    /// Eagerly initialized handle (explicit init).
    pub fn new_live(value: T) -> SyncResult<Self> {
        let boxed = try_box(value)?;
        Ok(Self {
            state: AtomicUsize::new(Box::into_raw(boxed) as usize),
            _marker: PhantomData,
        })
    }

    /// Resolve to the live object, promoting a sentinel through the
    /// static-init lock on first use.
    pub fn resolve(&self, make: impl FnOnce() -> SyncResult<T>) -> SyncResult<&T> {
        match self.state.load(Ordering::Acquire) {
            UNINIT => self.promote(make),
            DESTROYED => Err(SyncError::Destroyed),
            // SAFETY: a non-sentinel state is a published live pointer.
            // Destruction leaks the allocation, so the pointee outlives
            // every reference handed out here.
            live => Ok(unsafe { &*(live as *const T) }),
        }
    }

    #[cold]
    fn promote(&self, make: impl FnOnce() -> SyncResult<T>) -> SyncResult<&T> {
        let _guard = static_init_lock().lock();
        // Re-check under the lock: another thread may have promoted or
        // destroyed the cell while we were acquiring it.
        match self.state.load(Ordering::Acquire) {
            UNINIT => {
                let boxed = try_box(make()?)?;
                let ptr = Box::into_raw(boxed);
                log::debug!("lazy-promoted sync object at {:p}", ptr);
                self.state.store(ptr as usize, Ordering::Release);
                // SAFETY: just published, still alive.
                Ok(unsafe { &*ptr })
            }
            DESTROYED => Err(SyncError::Destroyed),
            // SAFETY: as in `resolve`.
            live => Ok(unsafe { &*(live as *const T) }),
        }
    }

    /// Peek at the live object without promoting a sentinel.
    pub fn get(&self) -> SyncResult<Option<&T>> {
        match self.state.load(Ordering::Acquire) {
            UNINIT => Ok(None),
            DESTROYED => Err(SyncError::Destroyed),
            // SAFETY: as in `resolve`.
            live => Ok(Some(unsafe { &*(live as *const T) })),
        }
    }

    /// Mark destroyed. An uninitialized cell becomes destroyed without ever
    /// allocating; destroying twice is an error.
    ///
    /// The live allocation is leaked, not freed: a concurrent operation may
    /// already hold a `&T` from [`LazyHandle::resolve`], and those
    /// references must stay valid. The objects are small and destruction is
    /// rare, so the leak is bounded.
    pub fn destroy(&self) -> SyncResult<()> {
        let _guard = static_init_lock().lock();
        match self.state.swap(DESTROYED, Ordering::AcqRel) {
            UNINIT => Ok(()),
            DESTROYED => Err(SyncError::Destroyed),
            live => {
                log::trace!("sync object at {:#x} destroyed, allocation leaked", live);
                Ok(())
            }
        }
    }
}

impl<T> Drop for LazyHandle<T> {
    fn drop(&mut self) {
        let state = *self.state.get_mut();
        if state != UNINIT && state != DESTROYED {
            // SAFETY: exclusive access; the pointer came from Box::into_raw.
            drop(unsafe { Box::from_raw(state as *mut T) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicU32;
    use std::thread;

    #[test]
    fn promotes_exactly_once_under_races() {
        let cell: LazyHandle<u32> = LazyHandle::uninit();
        let makes = AtomicU32::new(0);
        let mut addrs = Vec::new();
        thread::scope(|s| {
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    s.spawn(|| {
                        let v = cell
                            .resolve(|| {
                                makes.fetch_add(1, Ordering::SeqCst);
                                Ok(7)
                            })
                            .unwrap();
                        v as *const u32 as usize
                    })
                })
                .collect();
            for h in handles {
                addrs.push(h.join().unwrap());
            }
        });
        assert_eq!(makes.load(Ordering::SeqCst), 1);
        assert!(addrs.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn destroy_is_terminal() {
        let cell: LazyHandle<u32> = LazyHandle::uninit();
        assert_eq!(cell.destroy(), Ok(()));
        assert_eq!(cell.destroy(), Err(SyncError::Destroyed));
        assert_eq!(cell.resolve(|| Ok(1)).unwrap_err(), SyncError::Destroyed);
        assert_eq!(cell.get().unwrap_err(), SyncError::Destroyed);
    }

    #[test]
    fn outstanding_reference_survives_destroy() {
        let cell = LazyHandle::new_live(5u32).unwrap();
        let held = cell.get().unwrap().unwrap();
        // A reference handed out before destruction stays valid: the
        // allocation is leaked, never freed out from under a holder.
        assert_eq!(cell.destroy(), Ok(()));
        assert_eq!(*held, 5);
        assert_eq!(cell.get().unwrap_err(), SyncError::Destroyed);
    }

    #[test]
    fn eager_init_then_destroy() {
        let cell = LazyHandle::new_live(9u32).unwrap();
        assert_eq!(cell.get().unwrap().copied(), Some(9));
        assert_eq!(cell.destroy(), Ok(()));
        assert_eq!(cell.resolve(|| Ok(0)).unwrap_err(), SyncError::Destroyed);
    }

    #[test]
    fn failed_promotion_leaves_cell_uninit() {
        let cell: LazyHandle<u32> = LazyHandle::uninit();
        assert_eq!(
            cell.resolve(|| Err(SyncError::Unsupported)).unwrap_err(),
            SyncError::Unsupported
        );
        // A later attempt may still succeed.
        assert_eq!(cell.resolve(|| Ok(3)).unwrap(), &3);
    }
}
