//! Retransmission timer.
//!
//! Plain stop-and-wait: one datagram is outstanding at a time, so there is no
//! RTT estimation.  The timeout starts at `initial_timeout`, doubles on each
//! consecutive expiry up to `max_timeout`, and the transfer is abandoned once
//! `max_retries` expiries happen in a row.  Any datagram from the peer resets
//! the back-off.
//!
//! Sessions only arm a timer when their config carries a
//! [`RetransmitPolicy`]; without one they wait indefinitely.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitPolicy {
    pub initial_timeout: Duration,
    pub max_timeout: Duration,
    pub max_retries: u32,
}

impl Default for RetransmitPolicy {
    fn default() -> Self {
        Self {
            initial_timeout: Duration::from_secs(1),
            max_timeout: Duration::from_secs(8),
            max_retries: 5,
        }
    }
}

impl RetransmitPolicy {
    /// How long a sink keeps answering a repeated final DATA after it has
    /// sent the final ACK.
    pub fn linger(&self) -> Duration {
        self.max_timeout
    }
}

/// A running retransmit timer for one session.
#[derive(Debug, Clone)]
pub struct RetransmitTimer {
    policy: RetransmitPolicy,
    current: Duration,
    retries: u32,
}

impl RetransmitTimer {
    pub fn new(policy: RetransmitPolicy) -> Self {
        Self {
            policy,
            current: policy.initial_timeout,
            retries: 0,
        }
    }

    pub fn current_timeout(&self) -> Duration {
        self.current
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Record an expiry and double the timeout, capped at `max_timeout`.
    ///
    /// Returns `false` once the retry budget is spent.
    pub fn back_off(&mut self) -> bool {
        if self.retries >= self.policy.max_retries {
            return false;
        }
        self.retries += 1;
        self.current = (self.current * 2).min(self.policy.max_timeout);
        true
    }

    /// The peer answered; start over from `initial_timeout`.
    pub fn reset(&mut self) {
        self.current = self.policy.initial_timeout;
        self.retries = 0;
    }
}
