//! ---
//! rl_section: "01-core-functionality"
//! rl_subsection: "module"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Runtime helpers supporting the bus poll loop."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
//! Millisecond tick source and relative countdown timers.
//!
//! The protocol core never reads wall time directly; it asks a [`Clock`] and compares
//! against [`Countdown`] deadlines, so tests can drive time by hand.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Monotonic millisecond tick provider.
pub trait Clock: Send {
    /// Milliseconds since an arbitrary origin; never goes backwards.
    fn now_ms(&self) -> u64;

    /// Yield while a synchronous wait (bus scan) spins; must let time advance.
    fn idle(&self) {}
}

/// Wall-clock backed ticks.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn idle(&self) {
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Hand-driven ticks shared between a test and the code under test.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward.
    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    /// Jump to an absolute tick; earlier values are ignored.
    pub fn set(&self, ms: u64) {
        self.now.fetch_max(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn idle(&self) {
        self.advance(1);
    }
}

/// One-shot relative timer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Countdown {
    deadline: Option<u64>,
}

impl Countdown {
    /// Stopped timer.
    pub const fn stopped() -> Self {
        Self { deadline: None }
    }

    /// (Re)arm to fire `duration` after `now`.
    pub fn start(&mut self, now: u64, duration: Duration) {
        self.deadline = Some(now.saturating_add(duration.as_millis() as u64));
    }

    /// Disarm.
    pub fn stop(&mut self) {
        self.deadline = None;
    }

    /// Whether the timer is armed (expired or not).
    pub fn is_running(&self) -> bool {
        self.deadline.is_some()
    }

    /// Armed and past its deadline.
    pub fn expired(&self, now: u64) -> bool {
        matches!(self.deadline, Some(deadline) if now >= deadline)
    }

    /// Armed and not yet expired.
    pub fn pending(&self, now: u64) -> bool {
        matches!(self.deadline, Some(deadline) if now < deadline)
    }

    /// Milliseconds left, zero once expired or stopped.
    pub fn remaining(&self, now: u64) -> u64 {
        self.deadline
            .map(|deadline| deadline.saturating_sub(now))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn countdown_lifecycle() {
        let clock = ManualClock::new();
        let mut timer = Countdown::stopped();
        assert!(!timer.expired(clock.now_ms()));
        timer.start(clock.now_ms(), Duration::from_millis(150));
        clock.advance(149);
        assert!(timer.pending(clock.now_ms()));
        assert_eq!(timer.remaining(clock.now_ms()), 1);
        clock.advance(1);
        assert!(timer.expired(clock.now_ms()));
        timer.stop();
        assert!(!timer.is_running());
        assert!(!timer.expired(clock.now_ms()));
    }

    #[test]
    fn manual_clock_is_shared_and_monotonic() {
        let clock = ManualClock::new();
        let other = clock.clone();
        other.advance(10);
        clock.idle();
        assert_eq!(clock.now_ms(), 11);
        clock.set(5);
        assert_eq!(other.now_ms(), 11);
    }

    #[test]
    fn monotonic_clock_moves_forward() {
        let clock = MonotonicClock::new();
        let before = clock.now_ms();
        clock.idle();
        assert!(clock.now_ms() >= before + 1);
    }
}
