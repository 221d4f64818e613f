//! Exponential backoff for the Solver's retry of `Network`/`Resource`
//! failures, per the error-handling design's retry policy (§7: only those
//! two kinds are retryable, `Cancelled` never is).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BuildError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, base_delay_ms: 200, max_delay_ms: 10_000, multiplier: 2.0 }
    }
}

impl RetryPolicy {
    /// The delay before attempt `attempt` (1-indexed: the first retry is
    /// `attempt == 1`), capped at `max_delay_ms`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.base_delay_ms as f64 * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        Duration::from_millis((scaled as u64).min(self.max_delay_ms))
    }

    #[must_use]
    pub fn should_retry(&self, attempt: u32, error: &BuildError) -> bool {
        attempt < self.max_attempts && error.retryable()
    }
}

/// Runs `op` under `policy`, retrying on retryable [`BuildError`]s with
/// backoff between attempts.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, BuildError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, BuildError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if policy.should_retry(attempt, &err) => {
                tokio::time::sleep(policy.delay_for(attempt)).await;
                log::warn!("retrying after {}: attempt {attempt}/{}", err.kind, policy.max_attempts);
            }
            Err(err) => return Err(err),
        }
    }
}
