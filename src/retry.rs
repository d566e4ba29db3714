use std::time::Duration;

/// Backoff and give-up policy for retryable failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    /// Upper bound for a single backoff; set to the driver tick interval.
    pub max_delay: Duration,
    /// Retryable failures tolerated inside `window` before giving up.
    pub max_attempts: u32,
    pub window: Duration,
    /// Absolute budget measured from submission.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
            window: Duration::from_secs(60 * 60),
            timeout: Duration::from_secs(864_000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp(GiveUpReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    TimedOut,
    AttemptsExhausted,
}

/// Decide what to do after the `attempts`-th retryable failure in the window,
/// `elapsed` after submission.
pub fn decide(policy: &RetryPolicy, attempts: u32, elapsed: Duration) -> RetryDecision {
    if elapsed >= policy.timeout {
        return RetryDecision::GiveUp(GiveUpReason::TimedOut);
    }
    if attempts > policy.max_attempts {
        return RetryDecision::GiveUp(GiveUpReason::AttemptsExhausted);
    }
    let exponent = attempts.saturating_sub(1).min(31);
    let delay = policy
        .base_delay
        .saturating_mul(1u32 << exponent)
        .min(policy.max_delay)
        .min(policy.timeout - elapsed);
    RetryDecision::RetryAfter(delay)
}
