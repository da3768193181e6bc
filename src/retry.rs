use crate::error::Result;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Exponential backoff: `base_delay_ms * 2^(attempt-1)`, capped at `max_delay_ms`
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryStrategy {
    fn delay_for(&self, attempt: u32) -> u64 {
        // attempt is 1-based; cap the shift so large counts cannot overflow
        let factor = 1u64 << (attempt - 1).min(16);
        self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms)
    }
}

/// Retry executor for transient failures (see [`crate::error::InpaintError::is_recoverable`])
pub struct RetryExecutor {
    strategy: RetryStrategy,
}

impl RetryExecutor {
    pub fn new(strategy: RetryStrategy) -> Self {
        Self { strategy }
    }

    /// Execute an operation with retry logic
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let max_attempts = self.strategy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            debug!("Attempt {} of {}", attempt, max_attempts);

            match operation().await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    if !err.is_recoverable() || attempt >= max_attempts {
                        return Err(err);
                    }

                    let delay = self.strategy.delay_for(attempt);
                    warn!("Attempt {} failed: {}, retrying in {}ms", attempt, err, delay);
                    sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
            }
        }
    }
}
