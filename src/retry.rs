use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::time::sleep;
use tracing::warn;

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

/// Bounded exponential backoff with jitter for calls to external services.
///
/// Only errors that [`AppError::is_transient`] accepts are retried. Once the
/// attempts run out the last error is reported as [`AppError::Lookup`] for
/// the calling service; permanent errors pass through untouched.
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay_ms: u64,
    jitter_rng: Mutex<StdRng>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self::with_rng(max_attempts, base_delay, StdRng::from_entropy())
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.retry_max_attempts, config.retry_base_delay())
    }

    pub fn with_rng(max_attempts: u32, base_delay: Duration, rng: StdRng) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms: base_delay.as_millis() as u64,
            jitter_rng: Mutex::new(rng),
        }
    }

    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::with_rng(max_attempts, Duration::ZERO, StdRng::seed_from_u64(0))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub async fn run<T, F, Fut>(&self, service: &'static str, mut call: F) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) if attempt < self.max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        ?err,
                        service,
                        attempt, "external call failed; retrying after {:?}", delay
                    );
                    sleep(delay).await;
                }
                Err(err) => {
                    return Err(AppError::Lookup {
                        service,
                        detail: format!("gave up after {attempt} attempts: {err}"),
                    })
                }
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        if self.base_delay_ms == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(6);
        let base = Duration::from_millis(self.base_delay_ms * (1 << exponent));
        let jitter = {
            let mut rng = self.jitter_rng.lock();
            Duration::from_millis(rng.gen_range(0..self.base_delay_ms))
        };
        base + jitter
    }
}
