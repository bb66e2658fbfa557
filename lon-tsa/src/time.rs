//! Millisecond tick arithmetic and one-shot/repeating timers.
//!
//! Time is data, not a task: the scheduler passes the current tick into
//! every handler and timers are polled with [`Timer::expired`]. The tick is
//! a wrapping 32-bit millisecond counter; durations are limited to half the
//! counter range so the signed-difference comparison is always unambiguous
//! across wrap-around.

/// Longest representable timer duration.
pub const MAX_TIMER_MS: u32 = 0x7FFF_FFFF;

/// A wrapping millisecond tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Millis(pub u32);

impl Millis {
    pub fn wrapping_add(self, ms: u32) -> Millis {
        Millis(self.0.wrapping_add(ms))
    }

    /// Signed distance from `earlier` to `self`. Positive when `self` is
    /// later, valid as long as the two ticks are within half the counter
    /// range of each other.
    pub fn since(self, earlier: Millis) -> i32 {
        self.0.wrapping_sub(earlier.0) as i32
    }
}

/// A polled timer with expired-exactly-once semantics.
///
/// Internally an expiration tick of 0 means "stopped"; arming maps a
/// computed expiration of 0 to 1 so that 0 keeps its meaning.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timer {
    expiration: u32,
    repeat: u32,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a one-shot deadline `duration_ms` from `now`. A duration of 0
    /// stops the timer.
    pub fn set(&mut self, now: Millis, duration_ms: u32) {
        self.repeat = 0;
        self.arm(now, duration_ms);
    }

    /// Arms a repeating deadline. Each report of expiry re-arms the timer
    /// one interval after the previous deadline.
    pub fn set_repeating(&mut self, now: Millis, interval_ms: u32) {
        self.arm(now, interval_ms);
        self.repeat = if self.expiration == 0 { 0 } else { interval_ms.min(MAX_TIMER_MS) };
    }

    fn arm(&mut self, now: Millis, duration_ms: u32) {
        if duration_ms == 0 {
            self.expiration = 0;
            return;
        }
        let exp = now.wrapping_add(duration_ms.min(MAX_TIMER_MS));
        self.expiration = if exp.0 == 0 { 1 } else { exp.0 };
    }

    pub fn stop(&mut self) {
        self.expiration = 0;
        self.repeat = 0;
    }

    /// True while the timer is armed and expiry has not been reported.
    pub fn running(&self) -> bool {
        self.expiration != 0
    }

    /// Reports expiry exactly once per arming. A repeating timer re-arms
    /// itself; if the next deadline is already in the past it is clamped to
    /// `now`, skipping the missed tick.
    pub fn expired(&mut self, now: Millis) -> bool {
        if self.expiration == 0 {
            return false;
        }
        if now.since(Millis(self.expiration)) < 0 {
            return false;
        }
        if self.repeat != 0 {
            let next = Millis(self.expiration).wrapping_add(self.repeat);
            let next = if now.since(next) >= 0 { now } else { next };
            self.expiration = if next.0 == 0 { 1 } else { next.0 };
        } else {
            self.expiration = 0;
        }
        true
    }
}
