//! Retry-with-backoff wrapper for exchange calls.

use super::error::{ExchangeError, ExchangeResult};
use crate::config::RetryConfig;
use rust_decimal::prelude::ToPrimitive;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound on a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Retry policy parameterised by attempts, base delay and multiplier.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    /// Timeout applied to every individual attempt
    pub call_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.backoff_multiplier.to_f64().unwrap_or(2.0).max(1.0),
            call_timeout: Duration::from_millis(config.call_timeout_ms),
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn no_retry(call_timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            call_timeout,
        }
    }

    /// Sleep before retry number `attempt` (1-based: the delay after the first failure).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= MAX_BACKOFF.as_secs_f64() {
            return MAX_BACKOFF;
        }
        Duration::from_secs_f64(secs)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Run `call` under `policy`.
///
/// Each attempt is bounded by the policy timeout; a timeout counts as a
/// transient failure. Fatal errors return immediately. Only idempotent calls
/// belong here: an order submit that timed out may still have reached the
/// venue, so submits run under [`RetryPolicy::no_retry`] and the caller
/// verifies by client order id before trying again.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut call: F,
) -> ExchangeResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ExchangeResult<T>>,
{
    let mut attempt = 1;
    loop {
        let result = match tokio::time::timeout(policy.call_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::Timeout(policy.call_timeout)),
        };

        match result {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Exchange call succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    operation,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient exchange error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_transient() {
                    warn!(operation, attempt, error = %e, "Retry budget exhausted");
                }
                return Err(e);
            }
        }
    }
}
