//! Fixed retry policy for generation calls

use std::future::Future;
use std::time::Duration;

use kbforge_core::{ExtractionConfig, KbError, Result};
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

/// A small, fixed number of attempts, each bounded by a wall-clock timeout,
/// separated by a constant pause
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    timeout: Duration,
    backoff: Duration,
}

impl RetryPolicy {
    /// `max_attempts` below one is treated as one
    pub fn new(max_attempts: u32, timeout: Duration, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            timeout,
            backoff,
        }
    }

    pub fn from_config(config: &ExtractionConfig) -> Self {
        Self::new(config.max_attempts, config.timeout(), config.retry_backoff())
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `operation` until it succeeds or the attempts are used up; the
    /// last error is returned. A timed-out attempt counts as a failure.
    pub async fn run<F, Fut, T>(&self, operation_name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;

        loop {
            let outcome = match timeout(self.timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(KbError::Timeout(self.timeout.as_secs())),
            };

            match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        info!(
                            operation = operation_name,
                            attempts = attempt,
                            "Operation succeeded after retries"
                        );
                    }
                    return Ok(value);
                }
                Err(e) if attempt >= self.max_attempts => {
                    warn!(
                        operation = operation_name,
                        attempts = attempt,
                        error = %e,
                        "Operation failed after max attempts"
                    );
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        operation = operation_name,
                        attempt,
                        max_attempts = self.max_attempts,
                        backoff_ms = self.backoff.as_millis() as u64,
                        error = %e,
                        "Operation failed, retrying"
                    );
                    sleep(self.backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}
