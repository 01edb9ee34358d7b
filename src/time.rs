//! Clock selection and deadline arithmetic for timed waits.
//!
//! Absolute deadlines are converted to a relative timeout immediately before
//! each kernel block; a deadline already in the past clamps to zero rather
//! than underflowing.

use std::time::{Duration, Instant, SystemTime};

use crate::error::{SyncError, SyncResult};

/// Clock a condition variable's timed waits are measured against.
/// Fixed at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockId {
    /// Monotonic clock, immune to wall-clock adjustment.
    #[default]
    Monotonic,
    /// Wall clock.
    Realtime,
}

/// Absolute deadline for a timed wait.
#[derive(Debug, Clone, Copy)]
pub enum Deadline {
    Monotonic(Instant),
    Wall(SystemTime),
}

/// Stand-in offset when `now + dur` is not representable. Far enough out
/// to be an effectively untimed wait.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

impl Deadline {
    /// Deadline `dur` from now on the given clock. Saturates instead of
    /// overflowing for durations beyond the clock's range.
    pub fn after(clock: ClockId, dur: Duration) -> Self {
        match clock {
            ClockId::Monotonic => {
                let now = Instant::now();
                let at = now
                    .checked_add(dur)
                    .or_else(|| now.checked_add(FAR_FUTURE))
                    .unwrap_or(now);
                Deadline::Monotonic(at)
            }
            ClockId::Realtime => {
                let now = SystemTime::now();
                let at = now
                    .checked_add(dur)
                    .or_else(|| now.checked_add(FAR_FUTURE))
                    .unwrap_or(now);
                Deadline::Wall(at)
            }
        }
    }

    /// Clock this deadline is expressed against.
    pub fn clock(&self) -> ClockId {
        match self {
            Deadline::Monotonic(_) => ClockId::Monotonic,
            Deadline::Wall(_) => ClockId::Realtime,
        }
    }

    /// Relative timeout left: max(0, deadline - now).
    pub fn remaining(&self) -> Duration {
        match self {
            Deadline::Monotonic(at) => at.saturating_duration_since(Instant::now()),
            Deadline::Wall(at) => at
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO),
        }
    }

    /// A deadline must match the clock the object was created with.
    pub(crate) fn check_clock(&self, clock: ClockId) -> SyncResult<()> {
        if self.clock() == clock {
            Ok(())
        } else {
            Err(SyncError::InvalidArgument)
        }
    }
}
