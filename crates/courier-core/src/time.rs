//! Clock abstraction shared by the delivery pipeline.
//!
//! Retry due times, lease expiry and audit timestamps all read the clock
//! through this trait so tests can move wall time without sleeping.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};

/// Source of wall-clock and monotonic time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current wall-clock time, used for persisted timestamps.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Current monotonic instant, used for measuring call durations.
    fn now(&self) -> Instant;

    /// Waits for roughly `duration`.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Production clock backed by the system time and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Manually driven clock for tests.
///
/// Wall time only moves through [`TestClock::advance`] and
/// [`TestClock::set`]. Sleeping parks the task for at most a few
/// milliseconds of real time so polling loops stay responsive without
/// advancing the virtual clock.
#[derive(Debug, Clone)]
pub struct TestClock {
    origin: DateTime<Utc>,
    origin_instant: Instant,
    offset_ms: Arc<AtomicI64>,
}

impl TestClock {
    const MAX_REAL_SLEEP: Duration = Duration::from_millis(5);

    /// Creates a test clock frozen at the current system time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Creates a test clock frozen at `start`.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self { origin: start, origin_instant: Instant::now(), offset_ms: Arc::new(AtomicI64::new(0)) }
    }

    /// Moves the clock forward.
    pub fn advance(&self, duration: Duration) {
        let ms = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        self.offset_ms.fetch_add(ms, Ordering::AcqRel);
    }

    /// Moves the clock to `time`. Monotonic time never goes backwards.
    pub fn set(&self, time: DateTime<Utc>) {
        let target = (time - self.origin).num_milliseconds();
        self.offset_ms.fetch_max(target, Ordering::AcqRel);
    }

    /// Virtual time elapsed since creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(u64::try_from(self.offset_ms.load(Ordering::Acquire)).unwrap_or(0))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now_utc(&self) -> DateTime<Utc> {
        self.origin + chrono::Duration::milliseconds(self.offset_ms.load(Ordering::Acquire))
    }

    fn now(&self) -> Instant {
        self.origin_instant + self.elapsed()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration.min(Self::MAX_REAL_SLEEP)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_frozen_until_advanced() {
        let clock = TestClock::new();
        let start = clock.now_utc();
        assert_eq!(clock.now_utc(), start);

        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now_utc() - start, chrono::Duration::seconds(90));
        assert_eq!(clock.elapsed(), Duration::from_secs(90));
    }

    #[test]
    fn set_never_moves_backwards() {
        let start = Utc::now();
        let clock = TestClock::starting_at(start);
        clock.set(start + chrono::Duration::minutes(5));
        clock.set(start + chrono::Duration::minutes(1));
        assert_eq!(clock.now_utc(), start + chrono::Duration::minutes(5));
    }

    #[tokio::test]
    async fn sleeping_does_not_advance_virtual_time() {
        let clock = TestClock::new();
        let start = clock.now_utc();
        clock.sleep(Duration::from_secs(3600)).await;
        assert_eq!(clock.now_utc(), start);
    }
}
