use std::time::{Duration, Instant};

use http::Method;
use rand::RngExt;

use crate::error::Error;

/// Backoff and attempt limits for one client.
///
/// Attempt `n` (1-indexed) waits `base * 2^(n-1)`, capped at `max_backoff`,
/// then scaled by a uniform factor in `[0.5, 1.5]` when jitter is enabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: usize,
    base_backoff: Duration,
    max_backoff: Duration,
    jitter: bool,
}

impl RetryPolicy {
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::standard()
        }
    }

    pub fn standard() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            jitter: true,
        }
    }

    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn base_backoff(mut self, base_backoff: Duration) -> Self {
        self.base_backoff = base_backoff.max(Duration::from_millis(1));
        if self.max_backoff < self.base_backoff {
            self.max_backoff = self.base_backoff;
        }
        self
    }

    pub fn max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff.max(self.base_backoff);
        self
    }

    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn configured_max_retries(&self) -> usize {
        self.max_retries
    }

    pub fn max_attempts(&self) -> usize {
        self.max_retries.saturating_add(1)
    }

    pub(crate) fn backoff_for_attempt(&self, attempt: usize) -> Duration {
        let capped_exponent = attempt.saturating_sub(1).min(31) as u32;
        let multiplier = 1_u128 << capped_exponent;
        let base_ms = self.base_backoff.as_millis().max(1);
        let max_ms = self.max_backoff.as_millis().max(base_ms);
        let delay_ms = base_ms
            .saturating_mul(multiplier)
            .min(max_ms)
            .min(u64::MAX as u128) as u64;
        self.apply_jitter(Duration::from_millis(delay_ms))
    }

    fn apply_jitter(&self, backoff: Duration) -> Duration {
        if !self.jitter || backoff.is_zero() {
            return backoff;
        }
        let factor = rand::rng().random_range(0.5..=1.5);
        backoff.mul_f64(factor)
    }

    /// Decides what happens after a failed attempt recorded in `state`.
    pub(crate) fn decide(&self, error: Error, state: &mut RetryState) -> RetryDecision {
        if !state.idempotent && error.is_ambiguous() {
            return RetryDecision::GiveUp(Error::AmbiguousOutcome {
                method: state.method.clone(),
                uri: state.uri.clone(),
                attempts: state.attempts,
                source: Box::new(error),
            });
        }
        if !error.is_transient() || state.attempts >= self.max_attempts() {
            return RetryDecision::GiveUp(error);
        }

        let mut delay = self.backoff_for_attempt(state.attempts);
        if let Some(retry_after) = error.retry_after() {
            delay = delay.max(retry_after);
        }
        if let Some(deadline) = state.deadline
            && Instant::now() + delay >= deadline
        {
            return RetryDecision::GiveUp(error);
        }

        RetryDecision::Retry {
            after: delay,
            error,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Debug)]
pub(crate) enum RetryDecision {
    Retry { after: Duration, error: Error },
    GiveUp(Error),
}

/// Per-call bookkeeping owned by the executor.
#[derive(Debug)]
pub(crate) struct RetryState {
    method: Method,
    uri: String,
    idempotent: bool,
    deadline: Option<Instant>,
    started_at: Instant,
    attempts: usize,
}

impl RetryState {
    pub(crate) fn new(method: Method, uri: String, idempotent: bool, deadline: Option<Instant>) -> Self {
        Self {
            method,
            uri,
            idempotent,
            deadline,
            started_at: Instant::now(),
            attempts: 0,
        }
    }

    /// Counts a new attempt and returns its 1-indexed number.
    pub(crate) fn begin_attempt(&mut self) -> usize {
        self.attempts += 1;
        self.attempts
    }

    pub(crate) fn target(&self) -> (&Method, &str) {
        (&self.method, &self.uri)
    }

    pub(crate) fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

pub(crate) fn method_is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS | Method::TRACE
    )
}
