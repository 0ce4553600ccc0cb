//! Timestamps and a mockable clock for the replication stack.
//!
//! The replication log speaks in whole seconds since the epoch, so [`Time`]
//! exposes second-resolution accessors; internally it keeps full precision.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::RwLock;
use std::fmt::Debug;
use std::time::Duration;

/// A point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(DateTime<Utc>);

impl std::fmt::Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl Time {
    /// Create a `Time` from whole seconds since the epoch.
    pub fn from_timestamp(secs: i64) -> Self {
        Self(Utc.timestamp_opt(secs, 0).unwrap())
    }

    /// Create a `Time` from nanoseconds since the epoch.
    pub fn from_timestamp_nanos(nanos: i64) -> Self {
        Self(Utc.timestamp_nanos(nanos))
    }

    /// Whole seconds since the epoch.
    pub fn timestamp(&self) -> i64 {
        self.0.timestamp()
    }

    /// This time advanced by `d`, saturating on overflow.
    pub fn add(&self, d: Duration) -> Self {
        match ChronoDuration::from_std(d) {
            Ok(d) => Self(self.0 + d),
            Err(_) => Self(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// Elapsed wall time since `earlier`, or `None` if `earlier` is in the
    /// future.
    pub fn checked_duration_since(&self, earlier: Self) -> Option<Duration> {
        (self.0 - earlier.0).to_std().ok()
    }
}

/// A source of the current time.
pub trait TimeProvider: Debug + Send + Sync + 'static {
    /// Returns the current time.
    fn now(&self) -> Time;
}

/// A [`TimeProvider`] that reads the system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider;

impl SystemProvider {
    /// Create a new provider.
    pub fn new() -> Self {
        Self
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> Time {
        Time(Utc::now())
    }
}

/// A [`TimeProvider`] that returns a value fixed by the test, advanced
/// explicitly with [`MockProvider::inc`] or [`MockProvider::set`].
#[derive(Debug)]
pub struct MockProvider {
    now: RwLock<Time>,
}

impl MockProvider {
    /// Create a provider initially reporting `now`.
    pub fn new(now: Time) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    /// Pin the reported time to `now`.
    pub fn set(&self, now: Time) {
        *self.now.write() = now
    }

    /// Advance the reported time by `d` and return the new value.
    pub fn inc(&self, d: Duration) -> Time {
        let mut now = self.now.write();
        *now = now.add(d);
        *now
    }
}

impl TimeProvider for MockProvider {
    fn now(&self) -> Time {
        *self.now.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_provider_advances() {
        let provider = SystemProvider::new();
        let a = provider.now();
        let b = provider.now();
        assert!(b >= a);
    }

    #[test]
    fn mock_provider_is_pinned() {
        let provider = MockProvider::new(Time::from_timestamp(1000));
        assert_eq!(provider.now().timestamp(), 1000);
        assert_eq!(provider.now(), provider.now());

        provider.inc(Duration::from_secs(42));
        assert_eq!(provider.now().timestamp(), 1042);

        provider.set(Time::from_timestamp(5));
        assert_eq!(provider.now().timestamp(), 5);
    }

    #[test]
    fn checked_duration_since() {
        let a = Time::from_timestamp(100);
        let b = Time::from_timestamp(130);
        assert_eq!(b.checked_duration_since(a), Some(Duration::from_secs(30)));
        assert_eq!(a.checked_duration_since(b), None);
    }
}
