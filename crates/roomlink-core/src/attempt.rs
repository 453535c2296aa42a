//! ---
//! rl_section: "05-protocol-core"
//! rl_subsection: "module"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Master orchestration of the room controller bus."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};

/// What a failed attempt leaves behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum AttemptOutcome {
    /// Send the same request again.
    Retry { remaining: u32 },
    /// Budget spent; abandon the request.
    Exhausted,
}

/// Per-request retry counters, reset for every new logical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeAttempt {
    ceiling: u32,
    send_attempt: u32,
    last_attempt: u32,
    cmd_attempts_remaining: u32,
}

impl ExchangeAttempt {
    pub fn new(ceiling: u32) -> Self {
        let ceiling = ceiling.max(1);
        Self {
            ceiling,
            send_attempt: 0,
            last_attempt: 0,
            cmd_attempts_remaining: ceiling,
        }
    }

    /// Start counting for a new request.
    pub fn reset(&mut self) {
        self.send_attempt = 0;
        self.last_attempt = 0;
        self.cmd_attempts_remaining = self.ceiling;
    }

    /// Note one transmission of the current request.
    pub fn record_send(&mut self) {
        self.last_attempt = self.send_attempt;
        self.send_attempt += 1;
    }

    /// NAK, timeout or an invalid reply. The Nth failure of a ceiling of N is terminal.
    pub fn record_failure(&mut self) -> AttemptOutcome {
        self.cmd_attempts_remaining = self.cmd_attempts_remaining.saturating_sub(1);
        match self.cmd_attempts_remaining {
            0 => AttemptOutcome::Exhausted,
            remaining => AttemptOutcome::Retry { remaining },
        }
    }

    pub fn remaining(&self) -> u32 {
        self.cmd_attempts_remaining
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    /// Transmissions of the current request so far.
    pub fn sends(&self) -> u32 {
        self.send_attempt
    }

    /// Zero-based index of the transmission now in flight.
    pub fn last_attempt(&self) -> u32 {
        self.last_attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nth_failure_is_terminal() {
        let mut attempt = ExchangeAttempt::new(10);
        for n in 1..10 {
            attempt.record_send();
            assert_eq!(
                attempt.record_failure(),
                AttemptOutcome::Retry { remaining: 10 - n }
            );
        }
        attempt.record_send();
        assert_eq!(attempt.record_failure(), AttemptOutcome::Exhausted);
        assert_eq!(attempt.sends(), 10);
        assert_eq!(attempt.last_attempt(), 9);
    }

    #[test]
    fn reset_restores_budget() {
        let mut attempt = ExchangeAttempt::new(2);
        attempt.record_failure();
        attempt.reset();
        assert_eq!(attempt.remaining(), 2);
        assert_eq!(attempt.sends(), 0);
    }

    #[test]
    fn single_attempt_ceiling() {
        let mut attempt = ExchangeAttempt::new(0);
        assert_eq!(attempt.ceiling(), 1);
        assert_eq!(attempt.record_failure(), AttemptOutcome::Exhausted);
    }
}
