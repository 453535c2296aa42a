//! ---
//! rl_section: "01-core-functionality"
//! rl_subsection: "module"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Runtime helpers supporting the bus poll loop."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::trace;

/// Async pacing for the poll loop; late ticks are delayed rather than bunched.
#[derive(Debug)]
pub struct RateLimiter {
    interval: tokio::time::Interval,
    period: Duration,
    ticks: u64,
}

impl RateLimiter {
    pub fn new(period: Duration) -> Self {
        let period = period.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            interval,
            period,
            ticks: 0,
        }
    }

    pub async fn tick(&mut self) -> Instant {
        let at = self.interval.tick().await;
        self.ticks += 1;
        if self.ticks % 10_000 == 0 {
            trace!(ticks = self.ticks, period_ms = self.period.as_millis() as u64, "poll loop alive");
        }
        at
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}
