//! Retry policy shared by the client orchestrator and the backend model client
//!
//! The policy only answers two questions: may this error be retried, and how
//! long to wait before the next attempt. Callers own the sleep.

use crate::error::RequestError;
use std::time::Duration;

/// Default number of attempts (including the first one)
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    pub fn with_delays(mut self, base: Duration, cap: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = cap;
        self
    }

    /// Client errors (4xx except 429) and locally detected problems will not
    /// change on retry. Everything else is worth another attempt.
    pub fn is_retryable(&self, error: &RequestError) -> bool {
        match error {
            RequestError::Transient { status, .. } => is_retryable_status(*status),
            RequestError::Timeout { .. } => true,
            RequestError::Client { .. }
            | RequestError::Validation(_)
            | RequestError::Backend(_)
            | RequestError::InvalidResponse(_)
            | RequestError::Connectivity { .. }
            | RequestError::RetriesExhausted { .. } => false,
        }
    }

    /// Backoff before the attempt that follows attempt number `attempt`
    /// (counted from 1): `min(base * 2^(attempt-1), cap)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempt` attempts failed with `error`.
    pub fn should_retry(&self, attempt: u32, error: &RequestError) -> bool {
        attempt < self.max_attempts && self.is_retryable(error)
    }
}

/// Status-only classification used where no [`RequestError`] exists yet.
pub fn is_retryable_status(status: Option<u16>) -> bool {
    match status {
        Some(code) => !((400..500).contains(&code) && code != 429),
        None => true,
    }
}

/// Per-call bookkeeping; created when the first attempt starts and dropped
/// with the call.
#[derive(Debug, Clone)]
pub struct RetryState {
    pub attempt: u32,
    pub max_attempts: u32,
    pub last_error: Option<RequestError>,
}

impl RetryState {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            attempt: 0,
            max_attempts: policy.max_attempts,
            last_error: None,
        }
    }

    pub fn begin_attempt(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }

    /// Final error once the loop gives up. Retryable failures that ran out of
    /// budget are reported as exhausted; anything else is surfaced as-is.
    pub fn into_error(self, policy: &RetryPolicy) -> RequestError {
        match self.last_error {
            Some(err) if policy.is_retryable(&err) => RequestError::RetriesExhausted {
                attempts: self.attempt,
                last: err.to_string(),
            },
            Some(err) => err,
            None => RequestError::RetriesExhausted {
                attempts: self.attempt,
                last: "no attempt completed".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(5).with_delays(Duration::from_millis(500), Duration::from_millis(3000))
    }

    #[test]
    fn test_client_errors_are_not_retryable() {
        let p = policy();
        assert!(!p.is_retryable(&RequestError::from_status(404, "not found")));
        assert!(!p.is_retryable(&RequestError::from_status(400, "bad")));
        assert!(!p.is_retryable(&RequestError::Validation("too long".into())));
    }

    #[test]
    fn test_rate_limit_and_server_errors_are_retryable() {
        let p = policy();
        assert!(p.is_retryable(&RequestError::from_status(429, "slow")));
        assert!(p.is_retryable(&RequestError::from_status(503, "down")));
        assert!(p.is_retryable(&RequestError::Transient {
            status: None,
            message: "connection reset".into()
        }));
    }

    #[test]
    fn test_delay_doubles_until_cap() {
        let p = policy();
        assert_eq!(p.delay_for(1), Duration::from_millis(500));
        assert_eq!(p.delay_for(2), Duration::from_millis(1000));
        assert_eq!(p.delay_for(3), Duration::from_millis(2000));
        assert_eq!(p.delay_for(4), Duration::from_millis(3000));
        assert_eq!(p.delay_for(40), Duration::from_millis(3000));
    }

    #[test]
    fn test_should_retry_respects_budget() {
        let p = RetryPolicy::new(3);
        let err = RequestError::from_status(503, "down");
        assert!(p.should_retry(1, &err));
        assert!(p.should_retry(2, &err));
        assert!(!p.should_retry(3, &err));
    }

    #[test]
    fn test_retry_state_reports_exhaustion() {
        let p = RetryPolicy::new(2);
        let mut state = RetryState::new(&p);
        state.begin_attempt();
        state.begin_attempt();
        state.last_error = Some(RequestError::from_status(502, "bad gateway"));
        match state.into_error(&p) {
            RequestError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 2);
                assert!(last.contains("502"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_retry_state_surfaces_client_error_unchanged() {
        let p = RetryPolicy::new(3);
        let mut state = RetryState::new(&p);
        state.begin_attempt();
        state.last_error = Some(RequestError::from_status(404, "nope"));
        assert!(matches!(
            state.into_error(&p),
            RequestError::Client { status: 404, .. }
        ));
    }
}
