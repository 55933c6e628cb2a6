//! Clock abstraction for lease expiry, retry scheduling and loop pauses.
//!
//! The delivery loops never call `tokio::time::sleep` or `Utc::now` directly;
//! they go through a [`Clock`] so tests can move time forward without waiting
//! out a 30 second lease or a one minute retry window.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime},
};

use chrono::{DateTime, Utc};

/// Source of time for the delivery engine.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic instant for measuring elapsed time.
    fn now(&self) -> Instant;

    /// Wall-clock time used for timestamps written to the store.
    fn now_system(&self) -> SystemTime;

    /// Suspends the caller for `duration`.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Wall-clock time as a UTC timestamp.
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.now_system())
    }
}

/// Production clock backed by the OS and the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Manually driven clock for tests.
///
/// Starts at the moment of construction (or a chosen start time) and only
/// moves when [`TestClock::advance`] or [`Clock::sleep`] is called. Clones
/// share the same timeline, so a clone handed to a mock store observes the
/// same "now" as the engine under test.
#[derive(Debug, Clone)]
pub struct TestClock {
    offset_ns: Arc<AtomicU64>,
    start_instant: Instant,
    start_system: SystemTime,
}

impl TestClock {
    /// Creates a clock anchored at the current wall-clock time.
    pub fn new() -> Self {
        Self::with_start_time(SystemTime::now())
    }

    /// Creates a clock anchored at `start`.
    pub fn with_start_time(start: SystemTime) -> Self {
        Self {
            offset_ns: Arc::new(AtomicU64::new(0)),
            start_instant: Instant::now(),
            start_system: start,
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.offset_ns.fetch_add(nanos, Ordering::AcqRel);
    }

    /// Time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.offset_ns.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.start_instant + self.elapsed()
    }

    fn now_system(&self) -> SystemTime {
        self.start_system + self.elapsed()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_moves_both_timelines() {
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let clock = TestClock::with_start_time(start);
        let before = clock.now();

        clock.advance(Duration::from_secs(30));

        assert_eq!(clock.now().duration_since(before), Duration::from_secs(30));
        assert_eq!(clock.now_system(), start + Duration::from_secs(30));
    }

    #[test]
    fn clones_share_a_timeline() {
        let clock = TestClock::new();
        let other = clock.clone();

        other.advance(Duration::from_secs(61));

        assert_eq!(clock.elapsed(), Duration::from_secs(61));
    }

    #[test]
    fn now_utc_tracks_system_time() {
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(86_400);
        let clock = TestClock::with_start_time(start);

        assert_eq!(clock.now_utc().timestamp(), 86_400);
    }

    #[tokio::test]
    async fn sleep_advances_instead_of_waiting() {
        let clock = TestClock::new();

        clock.sleep(Duration::from_secs(120)).await;

        assert_eq!(clock.elapsed(), Duration::from_secs(120));
    }
}
