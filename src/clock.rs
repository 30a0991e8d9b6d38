//! Fixed-rate frame pacing on the monotonic clock.
//!
//! The clock sleeps until absolute deadlines and advances its anchor by exactly one
//! interval per tick, so a late frame never shifts the schedule and the long-run
//! average rate stays constant.

use crate::{DisplayError, Result};

pub const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Source of monotonic time with absolute-deadline sleeping.
pub trait MonotonicClock {
    fn now_ns(&self) -> u64;

    /// Block until the monotonic clock reaches `deadline_ns`.
    fn sleep_until_ns(&self, deadline_ns: u64);
}

/// `CLOCK_MONOTONIC` via `clock_gettime`/`clock_nanosleep(TIMER_ABSTIME)`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemMonotonic;

impl MonotonicClock for SystemMonotonic {
    fn now_ns(&self) -> u64 {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // Safety: `ts` is a valid, writable timespec and CLOCK_MONOTONIC always exists.
        unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        ts.tv_sec as u64 * NANOS_PER_SEC + ts.tv_nsec as u64
    }

    fn sleep_until_ns(&self, deadline_ns: u64) {
        let target = libc::timespec {
            tv_sec: (deadline_ns / NANOS_PER_SEC) as libc::time_t,
            tv_nsec: (deadline_ns % NANOS_PER_SEC) as libc::c_long,
        };
        loop {
            // Safety: `target` is a valid timespec; the remaining-time pointer is unused
            // for absolute sleeps and may be null.
            let ret = unsafe {
                libc::clock_nanosleep(
                    libc::CLOCK_MONOTONIC,
                    libc::TIMER_ABSTIME,
                    &target,
                    std::ptr::null_mut(),
                )
            };
            match ret {
                0 => return,
                // The deadline is absolute, so resuming after a signal is exact.
                libc::EINTR => continue,
                err => {
                    tracing::warn!(errno = err, "clock_nanosleep failed, not pacing this frame");
                    return;
                }
            }
        }
    }
}

#[derive(Debug)]
pub struct FrameClock<C = SystemMonotonic> {
    anchor_ns: Option<u64>,
    interval_ns: u64,
    source: C,
}

impl FrameClock<SystemMonotonic> {
    pub fn new(fps: f64) -> Result<Self> {
        Self::with_source(fps, SystemMonotonic)
    }
}

impl<C: MonotonicClock> FrameClock<C> {
    pub fn with_source(fps: f64, source: C) -> Result<Self> {
        if !fps.is_finite() || fps <= 0.0 {
            return Err(DisplayError::InvalidFrameRate(fps));
        }
        let interval_ns = (NANOS_PER_SEC as f64 / fps) as u64;
        if interval_ns == 0 {
            return Err(DisplayError::InvalidFrameRate(fps));
        }

        Ok(Self {
            anchor_ns: None,
            interval_ns,
            source,
        })
    }

    pub fn interval_ns(&self) -> u64 {
        self.interval_ns
    }

    /// Time of the last wake-up, `None` before the first tick.
    pub fn anchor_ns(&self) -> Option<u64> {
        self.anchor_ns
    }

    /// Block until the next frame slot.
    pub fn tick(&mut self) {
        let anchor = match self.anchor_ns {
            Some(anchor) => anchor,
            None => self.source.now_ns(),
        };

        let wake = anchor + self.interval_ns;
        self.source.sleep_until_ns(wake);
        self.anchor_ns = Some(wake);
    }

    /// Forget the anchor; the next tick latches the current time again.
    pub fn reset(&mut self) {
        self.anchor_ns = None;
    }
}
