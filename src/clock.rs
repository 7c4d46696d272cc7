//! Time sources for probing and analysis.
//!
//! Latency is measured against a monotonic reading, timestamps and analysis
//! windows come from wall time. Both live behind [`Clock`] so tests can run
//! retry back-offs without actually waiting.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

/// A source of wall time, monotonic time and sleeping.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Monotonic reading, relative to an arbitrary fixed origin.
    fn monotonic(&self) -> Duration;

    /// Suspend the caller for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// The real clock: `Utc::now`, `Instant` and `tokio::time::sleep`.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Duration {
        self.origin.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// A clock that only moves when told to.
///
/// By default `sleep` advances it instantly. A stepped clock instead parks
/// sleepers until [`ManualClock::advance`] moves past their wake time.
#[cfg(test)]
#[derive(Debug)]
pub struct ManualClock {
    state: tokio::sync::watch::Sender<(DateTime<Utc>, Duration)>,
    auto_advance: bool,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            state: tokio::sync::watch::Sender::new((start, Duration::ZERO)),
            auto_advance: true,
        }
    }

    pub fn stepped(start: DateTime<Utc>) -> Self {
        Self {
            auto_advance: false,
            ..Self::new(start)
        }
    }

    pub fn advance(&self, by: Duration) {
        self.state.send_modify(|state| {
            state.0 += chrono::Duration::from_std(by).unwrap();
            state.1 += by;
        });
    }
}

#[cfg(test)]
#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.state.borrow().0
    }

    fn monotonic(&self) -> Duration {
        self.state.borrow().1
    }

    async fn sleep(&self, duration: Duration) {
        if self.auto_advance {
            self.advance(duration);
            return;
        }
        let wake = self.monotonic() + duration;
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| state.1 >= wake).await;
    }
}
