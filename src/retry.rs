//! Reconnect policy and backoff state for streaming sessions.
//!
//! The policy decides whether a session failure is worth retrying and,
//! if so, how long to wait before the next attempt. State lives in
//! [`RetryState`], which the stream worker resets whenever a frame is
//! delivered successfully.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::debug;

/// Classification of a streaming session failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureKind {
    /// The caster closed the stream (zero-length read).
    StreamClosed,
    /// Connect or read error on the transport.
    NetworkError,
    /// The caster rejected the request (non-200 response): bad
    /// credentials or unknown mountpoint.
    AuthFailure,
}

impl FailureKind {
    /// Whether a failure of this kind may be retried at all.
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::AuthFailure)
    }
}

/// Policy controlling reconnect attempts and exponential backoff.
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts tolerated before giving up.
    /// `0` retries indefinitely.
    pub max_attempts: usize,
    /// Delay used before the first reconnect.
    pub initial_backoff: Duration,
    /// Upper bound for exponential backoff delay growth.
    pub max_backoff: Duration,
    /// Maximum random jitter added to each reconnect delay.
    pub jitter: Duration,
}

impl ReconnectPolicy {
    /// Returns a policy suited to long-lived correction streams: patient
    /// backoff, unbounded attempts.
    pub fn steady() -> Self {
        Self {
            max_attempts: 0,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
        }
    }

    /// Computes the delay to apply before the given reconnect attempt.
    ///
    /// `attempt` is 1-based and should correspond to the current attempt
    /// index. With zero jitter, delays are non-decreasing up to
    /// `max_backoff`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let mut delay = self.initial_backoff;
        for _ in 1..attempt {
            delay = std::cmp::min(delay.saturating_mul(2), self.max_backoff);
        }
        delay + jitter_duration(self.jitter, attempt)
    }

    /// Consults the policy after a failure.
    ///
    /// Returns the delay to wait before reconnecting, or `None` when the
    /// failure is not retryable or the attempt budget is exhausted.
    /// Every retryable failure is recorded in `state`, including the one
    /// that trips the breaker.
    pub fn next_delay(&self, kind: FailureKind, state: &mut RetryState) -> Option<Duration> {
        if !kind.is_retryable() {
            return None;
        }

        state.record_failure();
        if self.max_attempts > 0 && state.attempts() > self.max_attempts {
            debug!(
                attempts = state.attempts(),
                max_attempts = self.max_attempts,
                "reconnect attempt budget exhausted"
            );
            return None;
        }

        let delay = self.delay_for_attempt(state.attempts());
        debug!(
            ?kind,
            attempt = state.attempts(),
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );
        Some(delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::steady()
    }
}

/// Mutable reconnect accounting for one connection worker.
#[derive(Clone, Debug, Default)]
pub struct RetryState {
    attempts: usize,
    last_failure: Option<Instant>,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consecutive failures since the last successful frame delivery.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Time of the most recent recorded failure.
    pub fn last_failure(&self) -> Option<Instant> {
        self.last_failure
    }

    fn record_failure(&mut self) {
        self.attempts += 1;
        self.last_failure = Some(Instant::now());
    }

    /// Clears the failure streak; called on successful frame delivery.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

fn jitter_duration(max_jitter: Duration, attempt: usize) -> Duration {
    if max_jitter.is_zero() {
        return Duration::ZERO;
    }

    let limit_nanos = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    if limit_nanos == 0 {
        return Duration::ZERO;
    }

    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = now_nanos ^ ((attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    Duration::from_nanos(mixed % (limit_nanos + 1))
}
