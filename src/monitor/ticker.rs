//! Pauseable poll ticker
//!
//! The checker silences its polling trigger after a successful submission so
//! a pending transaction is never raced by another poll, then resumes it
//! when the round closes. `tokio::time::Interval` cannot be paused, so the
//! ticker allocates a fresh interval on resume and drops it on stop.

use std::future;
use std::time::Duration;

use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// A periodic timer whose ticking can be suspended and resumed without
/// touching its configured period.
#[derive(Debug)]
pub struct PollTicker {
    period: Duration,
    inner: Option<Interval>,
}

impl PollTicker {
    /// A stopped ticker with the given period.
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            inner: None,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_some()
    }

    /// Begin a fresh tick train. The first tick fires one full period from
    /// now, never immediately; a resume directly after a submission must not
    /// re-poll in the same breath.
    pub fn resume(&mut self) {
        let mut interval = interval_at(Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.inner = Some(interval);
    }

    /// Cease ticking until the next `resume`.
    pub fn stop(&mut self) {
        self.inner = None;
    }

    /// Wait for the next tick. Pends forever while the ticker is stopped.
    pub async fn tick(&mut self) -> Instant {
        match self.inner.as_mut() {
            Some(interval) => interval.tick().await,
            None => future::pending().await,
        }
    }
}
