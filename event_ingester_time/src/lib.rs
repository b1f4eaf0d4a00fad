//! Wall clock time for the ingester.
//!
//! Anything in the pipeline that needs "now" (object naming, batch age) asks a [`TimeProvider`]
//! instead of calling [`Utc::now`] directly, so tests can freeze or step the clock with a
//! [`MockProvider`].

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use std::ops::{Add, Sub};
use std::time::Duration;

/// A UTC timestamp returned by a [`TimeProvider`]
///
/// Purposefully does not provide [`std::convert::From`] implementations as it is intended to be
/// an opaque type returned by a `TimeProvider`; the constructors exist for tests.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct Time(DateTime<Utc>);

impl Add<Duration> for Time {
    type Output = Self;

    /// Saturates at [`Time::MAX`] instead of overflowing.
    fn add(self, rhs: Duration) -> Self::Output {
        self.checked_add(rhs).unwrap_or(Self::MAX)
    }
}

impl Sub<Duration> for Time {
    type Output = Self;

    /// Saturates at [`Time::MIN`] instead of overflowing.
    fn sub(self, rhs: Duration) -> Self::Output {
        self.checked_sub(rhs).unwrap_or(Self::MIN)
    }
}

impl std::fmt::Debug for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl std::fmt::Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl Time {
    pub const MAX: Self = Self(DateTime::<Utc>::MAX_UTC);
    pub const MIN: Self = Self(DateTime::<Utc>::MIN_UTC);

    /// Makes a new `Time` from the number of non-leap nanoseconds since the UNIX epoch.
    pub fn from_timestamp_nanos(nanos: i64) -> Self {
        Self(Utc.timestamp_nanos(nanos))
    }

    /// Makes a new `Time` from the number of non-leap milliseconds since the UNIX epoch.
    ///
    /// Returns None if out of range
    pub fn from_timestamp_millis(millis: i64) -> Option<Self> {
        DateTime::from_timestamp_millis(millis).map(Self)
    }

    /// Makes a new `Time` from whole seconds plus nanoseconds since the UNIX epoch.
    ///
    /// Returns None if out of range
    pub fn from_timestamp(secs: i64, nanos: u32) -> Option<Self> {
        DateTime::from_timestamp(secs, nanos).map(Self)
    }

    /// Returns the number of whole seconds since the UNIX epoch
    pub fn timestamp(&self) -> i64 {
        self.0.timestamp()
    }

    /// Returns the number of non-leap milliseconds since the UNIX epoch
    pub fn timestamp_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Returns the duration since `other`, or None if `other` is later than `self`
    pub fn checked_duration_since(&self, other: Self) -> Option<Duration> {
        self.0.signed_duration_since(other.0).to_std().ok()
    }

    /// Adds the given [`Duration`], returning `None` on overflow
    pub fn checked_add(&self, duration: Duration) -> Option<Self> {
        let duration = chrono::Duration::from_std(duration).ok()?;
        Some(Self(self.0.checked_add_signed(duration)?))
    }

    /// Subtracts the given [`Duration`], returning `None` on overflow
    pub fn checked_sub(&self, duration: Duration) -> Option<Self> {
        let duration = chrono::Duration::from_std(duration).ok()?;
        Some(Self(self.0.checked_sub_signed(duration)?))
    }

    /// Returns `Time` as a [`DateTime<Utc>`]
    pub fn date_time(&self) -> DateTime<Utc> {
        self.0
    }
}

pub trait TimeProvider: std::fmt::Debug + Send + Sync + 'static {
    /// Returns the current `Time`. No guarantees are made about monotonicity
    fn now(&self) -> Time;
}

/// A [`TimeProvider`] that uses [`Utc::now`] as a clock source
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider {}

impl SystemProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> Time {
        Time(Utc::now())
    }
}

/// A [`TimeProvider`] that returns a fixed `Time` that can be moved with [`MockProvider::set`]
/// and [`MockProvider::inc`]
#[derive(Debug)]
pub struct MockProvider {
    now: RwLock<Time>,
}

impl MockProvider {
    pub fn new(start: Time) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    pub fn set(&self, time: Time) {
        *self.now.write() = time
    }

    pub fn inc(&self, duration: Duration) -> Time {
        let mut now = self.now.write();
        *now = *now + duration;
        *now
    }
}

impl TimeProvider for MockProvider {
    fn now(&self) -> Time {
        *self.now.read()
    }
}
