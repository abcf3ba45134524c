//! Per-call retry bookkeeping.

use crate::config::RetryConfig;
use crate::error::{Error, Result};
use std::time::Duration;

/// Retry budget for one routed call.
#[derive(Debug, Clone)]
pub struct RetryState {
    retries: u32,
    max_retries: u32,
    delay: Duration,
}

impl RetryState {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            retries: 0,
            max_retries: config.max_retries,
            delay: config.retry_delay,
        }
    }

    /// Retries performed so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Attempts made so far, the first one included.
    pub fn attempt(&self) -> u32 {
        self.retries + 1
    }

    pub fn is_exhausted(&self) -> bool {
        self.retries >= self.max_retries
    }

    /// Wait out the backoff before the next attempt, or fail once the
    /// ceiling is reached.
    pub async fn backoff(&mut self) -> Result<()> {
        if self.is_exhausted() {
            return Err(Error::RetryExhausted {
                retries: self.retries,
            });
        }
        self.retries += 1;
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}
