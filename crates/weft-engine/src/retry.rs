use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use weft_core::config::RetryConfig;
use weft_core::error::{Result, WeftError};
use weft_core::types::{AttemptRecord, ClassifiedError};

use crate::classifier::classify_error;

/// Final failure of a retried operation.
#[derive(Debug, thiserror::Error)]
#[error("task {task_id} ({agent_id}) failed after {attempts} attempt(s): {error}")]
pub struct RetryError {
    pub task_id: String,
    pub agent_id: String,
    /// The last error returned by the operation.
    pub error: WeftError,
    pub classified: ClassifiedError,
    pub attempts: u32,
    pub history: Vec<AttemptRecord>,
    /// True when every allowed attempt was used; false when a
    /// non-retryable error stopped the sequence early.
    pub exhausted: bool,
}

impl RetryError {
    pub fn into_error(self) -> WeftError {
        self.error
    }
}

/// Retries fallible async operations with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryHandler {
    config: RetryConfig,
}

impl RetryHandler {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Base backoff after failed attempt `attempt` (1-based), before jitter:
    /// `initial_delay * backoff_base^(attempt-1)`, capped at `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.config.initial_delay_secs * self.config.backoff_base.powi(exp);
        let secs = if secs.is_finite() {
            secs.min(self.config.max_delay_secs)
        } else {
            self.config.max_delay_secs
        };
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Actual sleep after attempt `attempt` failed with `classified`.
    fn backoff(&self, attempt: u32, classified: &ClassifiedError) -> Duration {
        let mut delay = self.delay(attempt);
        if self.config.jitter {
            // Jitter: 0.8x to 1.2x
            let factor = 0.8 + rand::random::<f64>() * 0.4;
            delay = delay.mul_f64(factor);
        }
        if self.config.respect_retry_after && classified.retry_after_secs > 0.0 {
            delay = delay.max(Duration::from_secs_f64(classified.retry_after_secs));
        }
        delay
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or `max_attempts` is reached. The operation receives the 1-based
    /// attempt number.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        mut operation: F,
        task_id: &str,
        agent_id: &str,
    ) -> std::result::Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut history: Vec<AttemptRecord> = Vec::new();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(task_id, agent_id, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            let classified = classify_error(&error);
            let can_continue = classified.retryable && attempt < max_attempts;
            let delay = can_continue.then(|| self.backoff(attempt, &classified));

            history.push(AttemptRecord {
                attempt,
                category: classified.category,
                error: error.to_string(),
                delay_secs: delay.map(|d| d.as_secs_f64()),
                timestamp: Utc::now(),
            });

            let Some(delay) = delay else {
                warn!(
                    task_id,
                    agent_id,
                    attempts = attempt,
                    category = %classified.category,
                    retryable = classified.retryable,
                    error = %error,
                    "Giving up on task"
                );
                return Err(RetryError {
                    task_id: task_id.to_string(),
                    agent_id: agent_id.to_string(),
                    error,
                    exhausted: classified.retryable,
                    classified,
                    attempts: attempt,
                    history,
                });
            };

            warn!(
                task_id,
                agent_id,
                attempt,
                max_attempts,
                category = %classified.category,
                backoff_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying task"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
