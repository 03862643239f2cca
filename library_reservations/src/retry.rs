//! Bounded retry with exponential backoff for transient store failures.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;

/// Errors that know whether trying again can help
pub trait Transient {
    fn is_transient(&self) -> bool;
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    #[serde(rename = "initial_delay_ms", deserialize_with = "millis::deserialize")]
    pub initial_delay: Duration,
    #[serde(rename = "max_delay_ms", deserialize_with = "millis::deserialize")]
    pub max_delay: Duration,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_multiplier() -> f64 {
    2.0
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts, used by tests
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// initial_delay * multiplier^attempt, capped at max_delay
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_ms =
            self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        Duration::from_millis(delay_ms as u64).min(self.max_delay)
    }
}

/// Runs `operation` until it succeeds, fails with a non-transient error, or
/// the retry budget is spent. The last error is returned in the latter cases.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(operation = operation_name, attempt, "Succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) if err.is_transient() && attempt < policy.max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Transient failure, retrying: {}",
                    err
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if err.is_transient() {
                    tracing::error!(
                        operation = operation_name,
                        attempts = attempt + 1,
                        "Retry budget exhausted: {}",
                        err
                    );
                }
                return Err(err);
            }
        }
    }
}
