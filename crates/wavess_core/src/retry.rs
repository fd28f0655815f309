//! Retry with exponential backoff and jitter.
//!
//! Callers decide which errors are transient through a predicate; anything
//! else fails immediately.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Upper bound of the random delay added to each wait.
    pub max_jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
            max_jitter: Duration::from_millis(50),
        }
    }
}

impl RetryConfig {
    /// `retries` extra attempts after the first, default delays.
    pub fn with_retries(retries: u32) -> Self {
        Self {
            max_attempts: retries + 1,
            ..Self::default()
        }
    }

    fn jitter(&self) -> Duration {
        let max = self.max_jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// `max_attempts` is exhausted. The last error is returned unchanged.
pub async fn with_retry<T, E, F, Fut, P>(
    config: &RetryConfig,
    label: &str,
    is_retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay;
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(v) => {
                if attempt > 1 {
                    tracing::info!("{} succeeded on attempt {}", label, attempt);
                }
                return Ok(v);
            }
            Err(e) if attempt < config.max_attempts && is_retryable(&e) => {
                let sleep_time = delay + config.jitter();
                tracing::warn!(
                    "{} failed on attempt {}/{}: {}; retrying in {:.2}s",
                    label,
                    attempt,
                    config.max_attempts,
                    e,
                    sleep_time.as_secs_f64()
                );
                tokio::time::sleep(sleep_time).await;
                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_factor)
                        .min(config.max_delay.as_secs_f64()),
                );
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
