//! Exponential backoff shared by the resolver, registration, and probe rounds.

use std::future::Future;
use std::time::Duration;

/// Cap on the doubling multiplier so delays stay bounded.
pub const BACKOFF_MAX_MULTIPLIER: u32 = 1024;

/// Doubling delay schedule: `base`, `2*base`, `4*base`, ... clamped to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Delay for a zero-indexed attempt, without advancing.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = 2u32
            .checked_pow(attempt)
            .unwrap_or(BACKOFF_MAX_MULTIPLIER)
            .min(BACKOFF_MAX_MULTIPLIER);
        self.base.saturating_mul(multiplier).min(self.max)
    }

    /// Next delay in the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Retry an async operation with exponential backoff.
///
/// `operation` receives the 1-based attempt number. Returns the last error
/// once `max_attempts` have failed.
pub async fn retry_with_backoff<T, E, F, Fut>(
    mut operation: F,
    max_attempts: u32,
    base_delay: Duration,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let backoff = Backoff::new(base_delay, Duration::MAX);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= max_attempts {
                    return Err(err);
                }
                tokio::time::sleep(backoff.delay_for(attempt - 1)).await;
            }
        }
    }
}
