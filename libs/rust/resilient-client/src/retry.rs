//! Retry policy with exponential backoff.
//!
//! The policy is the single place that decides whether a failed attempt is
//! tried again. Attempts are numbered from 1; `max_attempts` counts the first
//! attempt too.

use crate::error::{ClassifiedError, ErrorKind};
use crate::profile::{ClientProfile, RetryConfig};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry decisions for one destination.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a policy from a retry block.
    #[must_use]
    pub const fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Create the policy configured for a profile.
    #[must_use]
    pub fn for_profile(profile: &ClientProfile) -> Self {
        Self::new(profile.retry.clone())
    }

    /// Effective attempt limit. A disabled policy allows exactly one attempt.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        if self.config.enabled {
            self.config.max_attempts
        } else {
            1
        }
    }

    /// Whether another attempt should follow attempt number `attempt`.
    ///
    /// `Auth` errors are retried only while their forced refresh is unspent.
    #[must_use]
    pub const fn should_retry(&self, attempt: u32, error: &ClassifiedError) -> bool {
        if attempt >= self.max_attempts() {
            return false;
        }
        match error.kind {
            ErrorKind::Transient => true,
            ErrorKind::Unretryable => false,
            ErrorKind::Auth => !error.auth_retried(),
        }
    }

    /// Delay to wait after attempt number `attempt` fails.
    ///
    /// `backoff_ms * multiplier^(attempt - 1)`, capped at `max_backoff_ms`.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let cap = self.config.max_backoff_ms as f64;
        let base = self.config.backoff_ms as f64 * self.config.backoff_multiplier.powi(exponent);
        let mut delay_ms = base.min(cap);

        if self.config.jitter {
            let jitter_factor = 1.0 + rand::random::<f64>() * 0.25;
            delay_ms = (delay_ms * jitter_factor).min(cap);
        }

        Duration::from_millis(delay_ms as u64)
    }

    /// Whether a downstream status is configured as transient.
    #[must_use]
    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.config.retryable_status_codes.contains(&status)
    }

    /// Whether calls with this method may be retried at all.
    #[must_use]
    pub fn allows_method(&self, method: &reqwest::Method) -> bool {
        self.config
            .methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method.as_str()))
    }

    /// Run `operation` until it succeeds or the policy gives up.
    ///
    /// A second `Auth` failure is marked as having spent its refresh so it
    /// is surfaced rather than retried again.
    ///
    /// # Errors
    ///
    /// Returns the last error once no further attempt is allowed.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T, ClassifiedError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ClassifiedError>>,
    {
        let mut attempt = 1;
        let mut auth_failures = 0u32;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(mut error) => {
                    if error.kind == ErrorKind::Auth {
                        auth_failures += 1;
                        if auth_failures > 1 {
                            error = error.mark_auth_retried();
                        }
                    }
                    if !self.should_retry(attempt, &error) {
                        return Err(error);
                    }
                    let delay = self.backoff_delay(attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "Retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy::new(RetryConfig::default().with_backoff(100, 2.0).with_max_backoff(1_000))
    }

    #[test]
    fn test_backoff_grows_exponentially() {
        let policy = policy();
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_capped() {
        let policy = policy();
        assert_eq!(policy.backoff_delay(5), Duration::from_millis(1_000));
        assert_eq!(policy.backoff_delay(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_respects_cap() {
        let policy = RetryPolicy::new(
            RetryConfig::default()
                .with_backoff(1_000, 1.0)
                .with_max_backoff(1_000)
                .with_jitter(),
        );
        for attempt in 1..20 {
            assert!(policy.backoff_delay(attempt) <= Duration::from_millis(1_000));
        }
    }

    #[test]
    fn test_should_retry() {
        let policy = policy();
        let transient = ClassifiedError::transient(codes::TIMEOUT, "t");

        assert!(policy.should_retry(1, &transient));
        assert!(policy.should_retry(2, &transient));
        assert!(!policy.should_retry(3, &transient));

        let unretryable = ClassifiedError::unretryable(codes::INVALID_CLIENT, "c");
        assert!(!policy.should_retry(1, &unretryable));

        let auth = ClassifiedError::auth(codes::UNAUTHORIZED, "a");
        assert!(policy.should_retry(1, &auth));
        assert!(!policy.should_retry(1, &auth.mark_auth_retried()));
    }

    #[test]
    fn test_disabled_policy_allows_single_attempt() {
        let policy = RetryPolicy::new(RetryConfig::default().disabled());
        assert_eq!(policy.max_attempts(), 1);
        assert!(!policy.should_retry(1, &ClassifiedError::transient(codes::TIMEOUT, "t")));
    }

    #[test]
    fn test_method_filter() {
        let policy = RetryPolicy::default();
        assert!(policy.allows_method(&reqwest::Method::GET));
        assert!(!policy.allows_method(&reqwest::Method::POST));
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = policy()
            .execute(|_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ClassifiedError::transient(codes::NETWORK_ERROR, "reset"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_stops_on_unretryable() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy()
            .execute(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ClassifiedError::unretryable(codes::INVALID_CLIENT, "bad")) }
            })
            .await;
        assert_eq!(result.unwrap_err().code, codes::INVALID_CLIENT);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_retries_auth_once() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::new(RetryConfig::default().with_max_attempts(5))
            .execute(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ClassifiedError::auth(codes::UNAUTHORIZED, "rejected")) }
            })
            .await;
        let err = result.unwrap_err();
        assert!(err.auth_retried());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
