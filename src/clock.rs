//! Monotonic time: [`Timeval`], the wall-clock-independent time value used
//! throughout the timeout list (§4.2) and the reply correlator (§4.3), plus
//! the process-wide "now" readers.
//!
//! `Timeval` mirrors a POSIX `struct timeval` (seconds + microseconds) more
//! than [`std::time::Duration`] / [`std::time::Instant`] do, because the
//! source this crate is modeled on computes deadlines by adding a
//! microsecond count to a `timeval` and comparing `timeval`s directly; doing
//! the same arithmetic through `Duration` would just add a layer of
//! unit conversion on every call.

use std::ops::{Add, Sub};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;

const USEC_PER_SEC: i64 = 1_000_000;

/// A "forever" timeout, used where the source treats "no deadline" as a
/// sentinel duration rather than an `Option`.
pub const INFINITY_USEC: i64 = i64::MAX;

/// A monotonic timestamp: 64-bit seconds plus a normalized microsecond
/// remainder (`0 <= usec < 1_000_000`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timeval {
    secs: i64,
    usecs: i64,
}

impl Timeval {
    /// Construct from raw components, normalizing the microsecond part.
    pub fn new(secs: i64, usecs: i64) -> Self {
        let mut tv = Self { secs, usecs };
        tv.normalize();
        tv
    }

    fn normalize(&mut self) {
        if self.usecs >= USEC_PER_SEC {
            self.secs += self.usecs / USEC_PER_SEC;
            self.usecs %= USEC_PER_SEC;
        } else if self.usecs < 0 {
            let borrow = (-self.usecs + USEC_PER_SEC - 1) / USEC_PER_SEC;
            self.secs -= borrow;
            self.usecs += borrow * USEC_PER_SEC;
        }
        debug_assert!((0..USEC_PER_SEC).contains(&self.usecs));
    }

    pub fn secs(&self) -> i64 {
        self.secs
    }

    pub fn usecs(&self) -> i64 {
        self.usecs
    }

    /// Monotonic "now", suitable for computing and comparing deadlines.
    /// Backed by [`Instant`] relative to an arbitrary process-start epoch
    /// (the absolute value is meaningless, only differences are).
    pub fn now() -> Self {
        let elapsed = monotonic_origin().elapsed();
        Self::new(elapsed.as_secs() as i64, elapsed.subsec_micros() as i64)
    }

    /// `self + usec` microseconds.
    pub fn add_usecs(&self, usec: i64) -> Self {
        Self::new(self.secs, self.usecs + usec)
    }

    /// Microseconds from `earlier` to `self` (negative if `self` is
    /// earlier).
    pub fn sub(&self, earlier: Timeval) -> i64 {
        (self.secs - earlier.secs) * USEC_PER_SEC + (self.usecs - earlier.usecs)
    }
}

impl Add<i64> for Timeval {
    type Output = Timeval;
    fn add(self, usec: i64) -> Timeval {
        self.add_usecs(usec)
    }
}

impl Sub<Timeval> for Timeval {
    type Output = i64;
    fn sub(self, earlier: Timeval) -> i64 {
        self.sub(earlier)
    }
}

fn monotonic_origin() -> Instant {
    static ORIGIN: Lazy<Instant> = Lazy::new(Instant::now);
    *ORIGIN
}

/// Wall-clock time in seconds since the Unix epoch. Not used for deadlines
/// (see [`Timeval::now`]); provided for logging timestamps only.
pub fn wall_time_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
