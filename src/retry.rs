//! Reload policy for failed connections
//!
//! The delay before each automatic reload grows linearly: the maximum timeout
//! is split into `attempts - 1` equal steps and the n-th retry waits n steps,
//! never more than the maximum.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Attempt budget and delay ceiling for one run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total connection attempts, the first one included; 0 is treated as 1
    pub load_attempts: u32,
    /// Delay before the last permitted retry
    pub max_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            load_attempts: 1,
            max_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(load_attempts: u32, max_timeout: Duration) -> Self {
        Self {
            load_attempts,
            max_timeout,
        }
    }

    pub fn attempts_allowed(&self) -> u32 {
        self.load_attempts.max(1)
    }

    /// Delay increment between consecutive retries, `None` when retries are disabled
    pub fn timeout_step(&self) -> Option<Duration> {
        let allowed = self.attempts_allowed();
        (allowed > 1).then(|| self.max_timeout / (allowed - 1))
    }
}

/// Where a run stands with respect to its attempt budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPhase {
    Idle,
    Attempting,
    AwaitingRetry(Duration),
    Succeeded,
    Exhausted,
}

/// What to do after a transport failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Reissue the fixed request after this delay
    Retry(Duration),
    /// No attempts left; surface the failure
    Exhausted,
}

/// Per-run retry state machine
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    attempts_used: u32,
    phase: RetryPhase,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts_used: 0,
            phase: RetryPhase::Idle,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn phase(&self) -> RetryPhase {
        self.phase
    }

    /// Retries scheduled so far
    pub fn attempts_used(&self) -> u32 {
        self.attempts_used
    }

    /// Connection attempts made so far, the current one included
    pub fn attempts_made(&self) -> u32 {
        match self.phase {
            RetryPhase::Idle => 0,
            _ => self.attempts_used + 1,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, RetryPhase::Succeeded | RetryPhase::Exhausted)
    }

    /// A connection attempt is starting
    ///
    /// Panics when the run already reached a terminal phase.
    pub fn begin_attempt(&mut self) {
        assert!(
            !self.is_terminal(),
            "cannot start an attempt on a finished run ({:?})",
            self.phase
        );
        self.phase = RetryPhase::Attempting;
    }

    /// The current attempt delivered the whole response
    pub fn succeed(&mut self) {
        self.phase = RetryPhase::Succeeded;
    }

    /// The current attempt failed at the connection level
    pub fn on_failure(&mut self) -> RetryDecision {
        let Some(step) = self.policy.timeout_step() else {
            self.phase = RetryPhase::Exhausted;
            return RetryDecision::Exhausted;
        };

        if self.attempts_used + 1 >= self.policy.attempts_allowed() {
            self.phase = RetryPhase::Exhausted;
            return RetryDecision::Exhausted;
        }

        self.attempts_used += 1;
        let timeout = step
            .saturating_mul(self.attempts_used)
            .min(self.policy.max_timeout);
        self.phase = RetryPhase::AwaitingRetry(timeout);
        RetryDecision::Retry(timeout)
    }
}
