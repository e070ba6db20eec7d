//! Task-run level retry decisions.
//!
//! Per task run: `Stable -> Degraded(k) -> {Stable, Abandoned}`. After the
//! k-th consecutive failed attempt the run waits `base_wait * 2^(k-1)` and
//! its model's connection cap is scaled by `connection_factor^k`, so the
//! first retry waits `base_wait` and every further retry doubles it.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tracing::{info, warn};

use crate::work::ErrorClass;

/// Retry budget and backoff shape.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts per task run, the first one included.
    pub max_attempts: u32,
    pub base_wait: Duration,
    /// Multiplier applied to the connection scale on every retry, in (0, 1].
    pub connection_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_wait: Duration::from_secs(30),
            connection_factor: 0.5,
        }
    }
}

impl RetryPolicy {
    /// Wait before the retry that follows the `failures`-th consecutive failure.
    pub fn wait_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base_wait.saturating_mul(1u32 << exponent)
    }

    /// Connection scale after `failures` consecutive failures.
    pub fn scale_for(&self, failures: u32) -> f64 {
        self.connection_factor.powi(failures.min(i32::MAX as u32) as i32)
    }

    /// `floor(max_connections * scale)`, never below one connection.
    pub fn effective_cap(max_connections: usize, scale: f64) -> usize {
        let scaled = (max_connections as f64 * scale + 1e-9).floor() as usize;
        scaled.clamp(1, max_connections.max(1))
    }
}

/// Retry bookkeeping of a degraded task run.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryState {
    pub attempts_used: u32,
    pub next_wait: Duration,
    pub connection_scale_factor: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPhase {
    Stable,
    Degraded { attempt_count: u32 },
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonReason {
    /// Every allowed retry failed.
    AttemptsExhausted,
    /// A failure that retrying cannot fix.
    Fatal,
}

impl std::fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbandonReason::AttemptsExhausted => write!(f, "retry attempts exhausted"),
            AbandonReason::Fatal => write!(f, "fatal error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Retry {
        /// 1-based retry number.
        attempt: u32,
        wait: Duration,
        connection_scale_factor: f64,
    },
    Abandon {
        reason: AbandonReason,
        attempts_used: u32,
    },
}

/// Tracks retry state for every task run of an eval set.
#[derive(Debug, Default)]
pub struct RetryController {
    policy: RetryPolicy,
    states: HashMap<String, RetryState>,
    abandoned: HashSet<String>,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            states: HashMap::new(),
            abandoned: HashSet::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn phase(&self, run_id: &str) -> RetryPhase {
        if self.abandoned.contains(run_id) {
            RetryPhase::Abandoned
        } else if let Some(state) = self.states.get(run_id) {
            RetryPhase::Degraded {
                attempt_count: state.attempts_used,
            }
        } else {
            RetryPhase::Stable
        }
    }

    pub fn state(&self, run_id: &str) -> Option<&RetryState> {
        self.states.get(run_id)
    }

    pub fn is_abandoned(&self, run_id: &str) -> bool {
        self.abandoned.contains(run_id)
    }

    /// Records a failed attempt of `run_id` and decides what happens next.
    ///
    /// Fatal failures abandon at once without consuming an attempt.
    pub fn on_failure(&mut self, run_id: &str, class: ErrorClass) -> RetryDecision {
        let used = self.states.get(run_id).map_or(0, |s| s.attempts_used);

        if self.abandoned.contains(run_id) {
            return RetryDecision::Abandon {
                reason: AbandonReason::AttemptsExhausted,
                attempts_used: used,
            };
        }

        if class == ErrorClass::Fatal {
            warn!(run = run_id, "Abandoning task run after fatal error");
            return self.abandon(run_id, AbandonReason::Fatal, used);
        }

        let failures = used + 1;
        if failures >= self.policy.max_attempts {
            warn!(
                run = run_id,
                attempts = failures,
                "Abandoning task run, retry attempts exhausted"
            );
            return self.abandon(run_id, AbandonReason::AttemptsExhausted, failures);
        }

        let state = RetryState {
            attempts_used: failures,
            next_wait: self.policy.wait_for(failures),
            connection_scale_factor: self.policy.scale_for(failures),
        };
        info!(
            run = run_id,
            attempt = failures,
            max_attempts = self.policy.max_attempts,
            wait_secs = state.next_wait.as_secs_f64(),
            connection_scale = state.connection_scale_factor,
            "Scheduling task run retry"
        );
        let decision = RetryDecision::Retry {
            attempt: failures,
            wait: state.next_wait,
            connection_scale_factor: state.connection_scale_factor,
        };
        self.states.insert(run_id.to_string(), state);
        decision
    }

    /// A successful attempt returns the run to `Stable`.
    pub fn on_success(&mut self, run_id: &str) {
        self.states.remove(run_id);
    }

    fn abandon(&mut self, run_id: &str, reason: AbandonReason, used: u32) -> RetryDecision {
        self.states.remove(run_id);
        self.abandoned.insert(run_id.to_string());
        RetryDecision::Abandon {
            reason,
            attempts_used: used,
        }
    }
}
