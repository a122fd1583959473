//! Injected time source and deferred-call scheduler.
//!
//! Every time-based decision in the engine (when to fire a proposal's
//! timer, when a job counts as "lost") goes through a [`Clock`] so that
//! tests can advance virtual time synchronously instead of sleeping in
//! real time. `SystemClock` is the production implementation; `TestClock`
//! (test-only) is a manually advanced stand-in that wakes pending sleepers
//! on each `advance` call.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::Result;

/// An injectable source of "now" and a way to wait for a duration.
#[async_trait::async_trait]
pub trait Clock: Send + Sync {
    /// The current wall-clock time as seen by this node.
    fn now(&self) -> DateTime<Utc>;

    /// Suspend the caller for `delay`.
    async fn sleep(&self, delay: Duration) -> Result<()>;
}

/// Computes `max(notBefore - now, 0)` (§4.7). `std::time::Duration` cannot
/// represent a negative value, so the timer this feeds can never be armed
/// with a negative delay (§8) — past-due work is clamped to zero rather
/// than rejected.
pub fn delay_until(clock: &dyn Clock, not_before: Option<DateTime<Utc>>) -> Duration {
    match not_before {
        None => Duration::ZERO,
        Some(at) => {
            let now = clock.now();
            if at <= now {
                Duration::ZERO
            } else {
                (at - now).to_std().unwrap_or(Duration::ZERO)
            }
        }
    }
}

/// Production clock backed by the real system clock and `tokio::time`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait::async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, delay: Duration) -> Result<()> {
        tokio::time::sleep(delay).await;
        Ok(())
    }
}

pub type SharedClock = Arc<dyn Clock>;

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    /// A manually-advanced clock for deterministic tests.
    ///
    /// `sleep` registers itself and yields only when `advance` has moved
    /// virtual time past the requested point; `advance` wakes every sleeper
    /// whose deadline has passed.
    pub struct TestClock {
        inner: Mutex<TestClockState>,
        notify: Notify,
    }

    struct TestClockState {
        now: DateTime<Utc>,
    }

    impl TestClock {
        pub fn new(start: DateTime<Utc>) -> Arc<Self> {
            Arc::new(Self {
                inner: Mutex::new(TestClockState { now: start }),
                notify: Notify::new(),
            })
        }

        /// Moves virtual time forward by `delta` and wakes any sleeper
        /// whose deadline has now passed.
        pub fn advance(&self, delta: Duration) {
            {
                let mut state = self.inner.lock().unwrap();
                state.now += chrono::Duration::from_std(delta).unwrap_or_default();
            }
            self.notify.notify_waiters();
        }
    }

    #[async_trait::async_trait]
    impl Clock for TestClock {
        fn now(&self) -> DateTime<Utc> {
            self.inner.lock().unwrap().now
        }

        async fn sleep(&self, delay: Duration) -> Result<()> {
            let deadline = self.now() + chrono::Duration::from_std(delay).unwrap_or_default();
            loop {
                if self.now() >= deadline {
                    return Ok(());
                }
                self.notify.notified().await;
            }
        }
    }

    #[tokio::test]
    async fn advance_wakes_pending_sleep() {
        let clock = TestClock::new(Utc::now());
        let clock2 = clock.clone();
        let handle = tokio::spawn(async move { clock2.sleep(Duration::from_secs(8)).await });
        tokio::task::yield_now().await;
        clock.advance(Duration::from_secs(4));
        tokio::task::yield_now().await;
        assert!(!handle.is_finished());
        clock.advance(Duration::from_secs(4));
        handle.await.unwrap().unwrap();
    }

    #[test]
    fn delay_until_clamps_past_due_to_zero() {
        let clock = TestClock::new(Utc::now());
        let past = clock.now() - chrono::Duration::seconds(5);
        assert_eq!(delay_until(&*clock, Some(past)), Duration::ZERO);
    }

    #[test]
    fn delay_until_computes_future_delta() {
        let clock = TestClock::new(Utc::now());
        let future = clock.now() + chrono::Duration::seconds(8);
        assert_eq!(delay_until(&*clock, Some(future)), Duration::from_secs(8));
    }
}
