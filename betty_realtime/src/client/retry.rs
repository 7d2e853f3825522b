use std::time::Duration;

pub trait RetryPolicy {
    /// Returns the delay before the retry numbered `attempt` (starting at 0),
    /// or `None` if no more retries should be made.
    fn next_delay(&self, attempt: usize) -> Option<Duration>;
}

#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    factor: f64,
    max_delay: Option<Duration>,
    max_attempts: Option<usize>,
}

impl ExponentialBackoff {
    pub const fn new(
        base: Duration,
        factor: f64,
        max_delay: Option<Duration>,
        max_attempts: Option<usize>,
    ) -> Self {
        Self {
            base,
            factor,
            max_delay,
            max_attempts,
        }
    }

    /// `base * 2^attempt`, giving up after `max_attempts` retries.
    pub const fn doubling(base: Duration, max_attempts: usize) -> Self {
        Self::new(base, 2., None, Some(max_attempts))
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn next_delay(&self, attempt: usize) -> Option<Duration> {
        if let Some(max_attempts) = self.max_attempts {
            if attempt >= max_attempts {
                return None;
            }
        }
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base.as_secs_f64() * self.factor.powi(exponent);
        // Converting before capping would overflow on large attempts.
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
        if let Some(max_delay) = self.max_delay {
            Some(delay.min(max_delay))
        } else {
            Some(delay)
        }
    }
}

pub const DEFAULT_RETRY_POLICY: ExponentialBackoff =
    ExponentialBackoff::doubling(Duration::from_secs(1), 5);

pub type BoxedRetry = Box<dyn RetryPolicy + Send + Sync + 'static>;

/// The reconnect counter together with the policy deciding its delays.
pub struct RetryState {
    retry_policy: BoxedRetry,
    attempts: usize,
}

impl RetryState {
    pub fn new(retry_policy: BoxedRetry) -> Self {
        Self {
            retry_policy,
            attempts: 0,
        }
    }

    /// Consumes one attempt and returns its delay, or `None` once exhausted
    /// (in which case the counter stays at its cap).
    pub fn next_delay(&mut self) -> Option<Duration> {
        let delay = self.retry_policy.next_delay(self.attempts)?;
        self.attempts += 1;
        Some(delay)
    }

    pub fn is_exhausted(&self) -> bool { self.retry_policy.next_delay(self.attempts).is_none() }

    pub fn attempts(&self) -> usize { self.attempts }

    pub fn reset(&mut self) { self.attempts = 0; }
}

impl Default for RetryState {
    fn default() -> Self { RetryState::new(Box::new(DEFAULT_RETRY_POLICY)) }
}
