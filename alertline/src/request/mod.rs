//! Resilient request execution.
//!
//! Every REST call made by alertline goes through [`RequestClient::execute`], which retries
//! network failures and retryable HTTP statuses with pure exponential backoff, and reduces
//! everything else to a uniform [`ApiError`].

mod error;

pub use error::{ApiError, ErrorCategory, extract_error_message, is_retryable_status};

use std::{future::Future, time::Duration};
use tracing::{debug, warn};

/// Default number of additional attempts after the first one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Retry budget and backoff base for one logical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Additional attempts allowed after the first
    pub max_retries: u32,
    /// Delay before the first retry, doubled for each subsequent one
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryConfig {
    /// Set the retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the backoff base
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Delay slept before retry number `retry` (1-indexed): `base_delay * 2^(retry - 1)`.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(20);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

/// Transient bookkeeping for one request's attempts. Never outlives the request.
#[derive(Debug)]
struct RetryState {
    attempt: u32,
    last_error: Option<ApiError>,
    delay: Duration,
}

impl RetryState {
    fn new() -> Self {
        Self {
            attempt: 0,
            last_error: None,
            delay: Duration::ZERO,
        }
    }

    /// Record a failed attempt. Hands the error back when no further attempt is allowed.
    fn record_failure(
        &mut self,
        error: ApiError,
        config: &RetryConfig,
    ) -> Result<Duration, ApiError> {
        let retries_used = self.attempt.saturating_sub(1);
        if !error.is_retryable || retries_used >= config.max_retries {
            return Err(error);
        }
        self.delay = config.backoff_delay(self.attempt);
        self.last_error = Some(error);
        Ok(self.delay)
    }
}

/// Wraps single-attempt request functions with retry, backoff and error classification.
#[derive(Debug, Clone, Default)]
pub struct RequestClient {
    config: RetryConfig,
}

impl RequestClient {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> RetryConfig {
        self.config
    }

    /// Run `request_fn` with the client's default retry configuration.
    pub async fn execute<T, F, Fut>(&self, request_fn: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        self.execute_with(self.config, request_fn).await
    }

    /// Run `request_fn` until it succeeds, fails with a non-retryable error, or the retry
    /// budget is spent. Attempts are strictly sequential.
    pub async fn execute_with<T, F, Fut>(
        &self,
        config: RetryConfig,
        mut request_fn: F,
    ) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut state = RetryState::new();

        loop {
            state.attempt += 1;

            let error = match request_fn().await {
                Ok(response) => {
                    if state.attempt > 1 {
                        debug!(attempts = state.attempt, "request succeeded after retry");
                    }
                    return Ok(response);
                }
                Err(error) => error,
            };

            let delay = match state.record_failure(error, &config) {
                Ok(delay) => delay,
                Err(error) => {
                    if error.is_retryable {
                        warn!(
                            attempts = state.attempt,
                            status = ?error.status,
                            %error,
                            "request retry budget exhausted"
                        );
                    } else {
                        debug!(status = ?error.status, %error, "request failed, not retryable");
                    }
                    return Err(error);
                }
            };

            warn!(
                attempt = state.attempt,
                delay_ms = delay.as_millis() as u64,
                status = ?state.last_error.as_ref().and_then(|error| error.status),
                "request failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };
    use tokio::time::Instant;

    fn assert_close(actual: Duration, expected: Duration) {
        let tolerance = Duration::from_millis(5);
        assert!(
            actual >= expected && actual <= expected + tolerance,
            "expected ~{expected:?}, got {actual:?}"
        );
    }

    #[test]
    fn test_backoff_delay() {
        let config = RetryConfig::default();
        assert_eq!(config.backoff_delay(1), Duration::from_millis(1000));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(2000));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(4000));
    }

    #[test]
    fn test_default_config() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_delay, Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_503_then_succeeds() {
        let client = RequestClient::new(RetryConfig::default().with_max_retries(2));
        let attempts = Arc::new(AtomicU32::new(0));
        let start = Instant::now();
        let attempt_times = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let result = client
            .execute(|| {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                attempt_times.lock().push(start.elapsed());
                async move {
                    if attempt < 2 {
                        Err(ApiError::http(503, "Service Unavailable"))
                    } else {
                        Ok("filled")
                    }
                }
            })
            .await;

        assert_eq!(result, Ok("filled"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        let times = attempt_times.lock().clone();
        assert_close(times[0], Duration::ZERO);
        assert_close(times[1] - times[0], Duration::from_millis(1000));
        assert_close(times[2] - times[1], Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_404_is_not_retried() {
        let client = RequestClient::default();
        let attempts = AtomicU32::new(0);

        let result: Result<(), ApiError> = client
            .execute(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(ApiError::http(404, "Not Found")) }
            })
            .await;

        let error = result.unwrap_err();
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(error.status, Some(404));
        assert!(error.user_message().to_lowercase().contains("resource not found"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_failure_exhausts_budget() {
        let client = RequestClient::default();
        let attempts = AtomicU32::new(0);
        let start = Instant::now();

        let result: Result<(), ApiError> = client
            .execute(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(ApiError::network("connection refused")) }
            })
            .await;

        let error = result.unwrap_err();
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert!(error.is_network_error);
        assert_eq!(error.message, "connection refused");
        // 1s + 2s + 4s
        assert_close(start.elapsed(), Duration::from_millis(7000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_with_overrides_default() {
        let client = RequestClient::default();
        let attempts = AtomicU32::new(0);

        let result: Result<(), ApiError> = client
            .execute_with(RetryConfig::default().with_max_retries(0), || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(ApiError::http(500, "Internal Server Error")) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
