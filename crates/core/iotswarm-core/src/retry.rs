//! Bounded retry with exponential backoff and jitter
//!
//! Every data source and sink call made by a device or by the live uploader
//! goes through [`RetryPolicy::run`]. Each attempt is bounded by the
//! operation timeout; a timeout counts as a transient failure. Backoff sleeps
//! are cancellation points.

use crate::error::{IotSwarmError, IotSwarmResult};
use serde::{Deserialize, Serialize};
use std::{future::Future, time::Duration};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry and timeout settings for source and sink calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay in milliseconds
    pub max_delay_ms: u64,
    /// Backoff multiplier (typically 2.0)
    pub multiplier: f64,
    /// Random jitter factor (0.0 = no jitter, 1.0 = full jitter)
    pub jitter_factor: f64,
    /// Deadline for a single attempt in milliseconds
    pub operation_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter_factor: 0.1,
            operation_timeout_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_operation_timeout(mut self, deadline: Duration) -> Self {
        self.operation_timeout_ms = deadline.as_millis() as u64;
        self
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Reject settings that would never terminate or never wait
    pub fn validate(&self) -> IotSwarmResult<()> {
        if self.max_attempts == 0 {
            return Err(IotSwarmError::config("retry.max_attempts must be at least 1"));
        }
        if self.multiplier < 1.0 {
            return Err(IotSwarmError::config(format!(
                "retry.multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(IotSwarmError::config(format!(
                "retry.jitter_factor must be within 0.0..=1.0, got {}",
                self.jitter_factor
            )));
        }
        if self.operation_timeout_ms == 0 {
            return Err(IotSwarmError::config("retry.operation_timeout_ms must be positive"));
        }
        Ok(())
    }

    /// Calculate delay for the given retry (0 = first retry)
    pub fn calculate_delay(&self, retry_count: u32) -> Duration {
        let base_delay =
            self.initial_delay_ms as f64 * self.multiplier.powi(retry_count.min(63) as i32);
        let delay = base_delay.min(self.max_delay_ms as f64);

        // Spread retries of many devices apart
        let jitter = delay * self.jitter_factor * (rand::random::<f64>() - 0.5);
        let final_delay = (delay + jitter).max(0.0) as u64;

        Duration::from_millis(final_delay)
    }

    /// Run `op` until it succeeds, fails permanently, runs out of attempts or
    /// `cancel` fires during a backoff sleep.
    ///
    /// Permanent errors are returned unchanged. Exhausting the attempts
    /// yields [`IotSwarmError::RetriesExhausted`] wrapping the last error.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> IotSwarmResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = IotSwarmResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let deadline = self.operation_timeout();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = match timeout(deadline, op()).await {
                Ok(result) => result,
                Err(_) => Err(IotSwarmError::timeout(operation, deadline)),
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !error.is_retryable() {
                warn!(operation, attempt, error = %error, "Permanent failure, not retrying");
                return Err(error);
            }

            metrics::counter!("iotswarm_retries_total", "operation" => operation.to_string())
                .increment(1);

            if attempt >= max_attempts {
                warn!(operation, attempts = attempt, error = %error, "Retries exhausted");
                return Err(IotSwarmError::RetriesExhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    last: Box::new(error),
                });
            }

            let delay = self.calculate_delay(attempt - 1);
            debug!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient failure, backing off"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(IotSwarmError::Cancelled),
                _ = sleep(delay) => {}
            }
        }
    }
}
