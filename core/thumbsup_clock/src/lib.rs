#[cfg(test)]
#[macro_use]
extern crate approx;
use bincode::{Decode, Encode};
use core::ops::{Add, Sub};
pub use quanta::Instant;
use quanta::{Clock, Mock};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::ops::{AddAssign, Mul};
use std::sync::Arc;
use std::time::Duration;

/// For Robot times, the underlying type is a u64 representing nanoseconds.
/// It is always positive to simplify the reasoning on the user side.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default, Encode, Decode,
)]
pub struct TuDuration(pub u64);

impl TuDuration {
    pub const ZERO: TuDuration = TuDuration(0);

    pub const fn from_millis(millis: u64) -> Self {
        TuDuration(millis * 1_000_000)
    }

    pub const fn from_micros(micros: u64) -> Self {
        TuDuration(micros * 1_000)
    }

    pub fn as_nanos(&self) -> u64 {
        let Self(nanos) = self;
        *nanos
    }

    pub fn as_micros(&self) -> u64 {
        self.as_nanos() / 1_000
    }

    pub fn as_millis(&self) -> u64 {
        self.as_nanos() / 1_000_000
    }

    /// Elapsed time between two instants, zero if `earlier` is actually later.
    pub fn saturating_sub(self, earlier: TuDuration) -> TuDuration {
        TuDuration(self.0.saturating_sub(earlier.0))
    }

    pub fn as_secs_f32(&self) -> f32 {
        self.as_nanos() as f32 / 1_000_000_000.0
    }
}

/// bridge the API with standard Durations.
impl From<Duration> for TuDuration {
    fn from(duration: Duration) -> Self {
        TuDuration(duration.as_nanos() as u64)
    }
}

impl From<TuDuration> for Duration {
    fn from(val: TuDuration) -> Self {
        let TuDuration(nanos) = val;
        Duration::from_nanos(nanos)
    }
}

impl From<u64> for TuDuration {
    fn from(duration: u64) -> Self {
        TuDuration(duration)
    }
}

impl Sub for TuDuration {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        let TuDuration(lhs) = self;
        let TuDuration(rhs) = rhs;
        TuDuration(lhs - rhs)
    }
}

impl Add for TuDuration {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        let TuDuration(lhs) = self;
        let TuDuration(rhs) = rhs;
        TuDuration(lhs + rhs)
    }
}

impl AddAssign for TuDuration {
    fn add_assign(&mut self, rhs: Self) {
        let TuDuration(lhs) = self;
        let TuDuration(rhs) = rhs;
        *lhs += rhs;
    }
}

// TuDuration * scalar, used for ramp cadences.
impl<T> Mul<T> for TuDuration
where
    T: Into<u64>,
{
    type Output = TuDuration;

    fn mul(self, rhs: T) -> TuDuration {
        let TuDuration(lhs) = self;
        TuDuration(lhs * rhs.into())
    }
}

impl Display for TuDuration {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let Self(nanos) = *self;
        if nanos >= 1_000_000_000 {
            write!(f, "{:.3} s", nanos as f64 / 1_000_000_000.0)
        } else if nanos >= 1_000_000 {
            write!(f, "{:.3} ms", nanos as f64 / 1_000_000.0)
        } else if nanos >= 1_000 {
            write!(f, "{:.3} µs", nanos as f64 / 1_000.0)
        } else {
            write!(f, "{nanos} ns")
        }
    }
}

/// A robot time is just a duration from a fixed point in time (boot).
pub type TuTime = TuDuration;

/// A running Robot clock.
/// The clock is a monotonic clock that starts at an arbitrary reference time.
/// It is clone resilient, ie a clone will be the same clock, even when mocked.
#[derive(Clone, Debug)]
pub struct RobotClock {
    inner: Clock,
    ref_time: Instant,
}

/// A mock clock that can be controlled by the user.
/// The simulated board holds one of these so its delays move time forward.
#[derive(Debug, Clone)]
pub struct RobotClockMock(Arc<Mock>);

impl RobotClockMock {
    pub fn increment(&self, amount: Duration) {
        let Self(mock) = self;
        mock.increment(amount);
    }

    pub fn advance_millis(&self, millis: u64) {
        self.increment(Duration::from_millis(millis));
    }

    pub fn advance_micros(&self, micros: u64) {
        self.increment(Duration::from_micros(micros));
    }

    /// A convenient way to get the current time from the mocking side.
    pub fn now(&self) -> TuTime {
        let Self(mock) = self;
        mock.value().into()
    }
}

impl RobotClock {
    /// Creates a RobotClock using now as its reference time.
    pub fn new() -> Self {
        let clock = Clock::new();
        let ref_time = clock.now();
        RobotClock {
            inner: clock,
            ref_time,
        }
    }

    /// Build a fake clock with a reference time of 0.
    /// The RobotClockMock interface controls all the clones of the clock given.
    pub fn mock() -> (Self, RobotClockMock) {
        let (clock, mock) = Clock::mock();
        let ref_time = clock.now();
        (
            RobotClock {
                inner: clock,
                ref_time,
            },
            RobotClockMock(mock),
        )
    }

    /// Time since the reference time, monotonically increasing.
    #[inline]
    pub fn now(&self) -> TuTime {
        (self.inner.now() - self.ref_time).into()
    }

    /// Milliseconds since boot, the unit most of the control loop reasons in.
    #[inline]
    pub fn now_millis(&self) -> u64 {
        self.now().as_millis()
    }

    /// Time elapsed since `since`.
    #[inline]
    pub fn elapsed_since(&self, since: TuTime) -> TuDuration {
        self.now().saturating_sub(since)
    }
}

impl Default for RobotClock {
    fn default() -> Self {
        Self::new()
    }
}

/// A point in time after which a bounded wait must give up.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Deadline {
    expires_at: TuTime,
}

impl Deadline {
    pub fn after(clock: &RobotClock, timeout: TuDuration) -> Self {
        Deadline {
            expires_at: clock.now() + timeout,
        }
    }

    #[inline]
    pub fn is_expired(&self, clock: &RobotClock) -> bool {
        clock.now() >= self.expires_at
    }

    pub fn remaining(&self, clock: &RobotClock) -> TuDuration {
        self.expires_at.saturating_sub(clock.now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tuduration_arithmetic_operations() {
        let a = TuDuration(100);
        let b = TuDuration(50);

        assert_eq!(a + b, TuDuration(150));
        assert_eq!(a - b, TuDuration(50));
        assert_eq!(a * 2u32, TuDuration(200));
        assert_eq!(b.saturating_sub(a), TuDuration::ZERO);
    }

    #[test]
    fn test_unit_conversions() {
        assert_eq!(TuDuration::from_millis(40).as_micros(), 40_000);
        assert_eq!(TuDuration::from_micros(1_500).as_millis(), 1);
        assert_relative_eq!(TuDuration::from_millis(250).as_secs_f32(), 0.25);
    }

    #[test]
    fn test_mock() {
        let (clock, mock) = RobotClock::mock();
        assert_eq!(clock.now(), Duration::from_secs(0).into());
        mock.increment(Duration::from_secs(1));
        assert_eq!(clock.now(), Duration::from_secs(1).into());
        assert_eq!(clock.now_millis(), 1000);
    }

    #[test]
    fn test_mock_clone() {
        let (clock, mock) = RobotClock::mock();
        let clock_clone = clock.clone();
        mock.advance_millis(5);
        assert_eq!(clock_clone.now(), TuDuration::from_millis(5));
        assert_eq!(mock.now(), TuDuration::from_millis(5));
    }

    #[test]
    fn test_deadline_expiry() {
        let (clock, mock) = RobotClock::mock();
        let deadline = Deadline::after(&clock, TuDuration::from_millis(50));
        assert!(!deadline.is_expired(&clock));
        assert_eq!(deadline.remaining(&clock), TuDuration::from_millis(50));
        mock.advance_millis(49);
        assert!(!deadline.is_expired(&clock));
        mock.advance_millis(1);
        assert!(deadline.is_expired(&clock));
        assert_eq!(deadline.remaining(&clock), TuDuration::ZERO);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", TuDuration(999)), "999 ns");
        assert_eq!(format!("{}", TuDuration::from_millis(40)), "40.000 ms");
    }
}
