use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Pause between consecutive attempts
    pub delay: Duration,
}

impl RetryConfig {
    /// `retries` extra attempts, all separated by the same `delay`.
    pub fn fixed(retries: u32, delay: Duration) -> Self {
        Self {
            max_attempts: retries.saturating_add(1),
            delay,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `f` until it succeeds, fails with an error `should_retry` rejects,
    /// or the attempts run out. The last error is returned.
    pub async fn execute_if<F, Fut, T, E, P>(&self, mut f: F, should_retry: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            match f().await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!("Retry succeeded on attempt {}", attempt);
                    }
                    return Ok(result);
                }
                Err(error) if !should_retry(&error) => return Err(error),
                Err(error) if attempt >= self.config.max_attempts => {
                    warn!("All {} attempts exhausted", self.config.max_attempts);
                    return Err(error);
                }
                Err(error) => {
                    warn!(
                        "Attempt {} failed: {}. Retrying in {:?}",
                        attempt, error, self.config.delay
                    );
                    sleep(self.config.delay).await;
                }
            }
        }
    }
}
