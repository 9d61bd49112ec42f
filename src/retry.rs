//! Bounded retry for provider HTTP calls.
//!
//! Every request outcome is classified into a [`Failure`]: rate limits back
//! off for `(attempt + 1) * rate_limit_backoff`, timeouts and connection
//! errors back off for a fixed delay, and anything else fails at once.

use std::{future::Future, time::Duration};

use reqwest::StatusCode;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::{Error, Result};

/// Upper bound on `max_attempts`.
pub const MAX_ATTEMPTS_LIMIT: u32 = 10;

/// Retry and backoff settings for a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per request, including the first (1..=10).
    pub max_attempts: u32,
    /// Delay after a timeout or connection error.
    pub timeout_backoff_ms: u64,
    /// Base delay after a rate-limit response, multiplied by the attempt number.
    pub rate_limit_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout_backoff_ms: 1_000,
            rate_limit_backoff_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never sleeps. Useful for tests and local servers.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            timeout_backoff_ms: 0,
            rate_limit_backoff_ms: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_ATTEMPTS_LIMIT).contains(&self.max_attempts) {
            return Err(Error::Config(format!(
                "retry.max_attempts must be between 1 and {MAX_ATTEMPTS_LIMIT}"
            )));
        }
        Ok(())
    }

    /// Batch requests are heavier, so they wait twice as long after a timeout.
    pub fn for_batch(self) -> Self {
        Self {
            timeout_backoff_ms: self.timeout_backoff_ms.saturating_mul(2),
            ..self
        }
    }

    pub fn rate_limit_wait(&self, attempt: u32) -> Duration {
        Duration::from_millis(
            self.rate_limit_backoff_ms
                .saturating_mul(u64::from(attempt) + 1),
        )
    }

    pub fn timeout_wait(&self) -> Duration {
        Duration::from_millis(self.timeout_backoff_ms)
    }
}

/// Why a single provider request failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// The provider answered 429.
    RateLimited,
    /// Timeout or connection error; worth retrying.
    Transient(String),
    /// Any other error; retrying will not help.
    Permanent(String),
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Failure::RateLimited => f.write_str("rate limited"),
            Failure::Transient(msg) => write!(f, "transient error: {msg}"),
            Failure::Permanent(msg) => write!(f, "{msg}"),
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or the policy's attempts
/// are used up. Returns the last failure on exhaustion.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> std::result::Result<T, Failure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, Failure>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last = Failure::Transient("no attempt made".into());

    for attempt in 0..attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(Failure::Permanent(msg)) => {
                tracing::warn!(what, error = %msg, "request failed");
                return Err(Failure::Permanent(msg));
            }
            Err(failure) => {
                let wait = match failure {
                    Failure::RateLimited => policy.rate_limit_wait(attempt),
                    _ => policy.timeout_wait(),
                };
                tracing::warn!(
                    what,
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    error = %failure,
                    "request failed"
                );
                last = failure;
                if attempt + 1 < attempts && !wait.is_zero() {
                    tracing::debug!(wait_ms = wait.as_millis() as u64, "backing off");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    Err(last)
}

/// Send a request and decode a JSON response, classifying any failure.
pub async fn send_json<R: DeserializeOwned>(
    request: reqwest::RequestBuilder,
) -> std::result::Result<R, Failure> {
    let resp = request.send().await.map_err(classify)?;
    let status = resp.status();

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(Failure::RateLimited);
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        let body: String = body.chars().take(200).collect();
        return Err(Failure::Permanent(format!("HTTP {status}: {body}")));
    }

    resp.json::<R>().await.map_err(|e| {
        if e.is_timeout() {
            Failure::Transient(e.to_string())
        } else {
            Failure::Permanent(format!("invalid response body: {e}"))
        }
    })
}

fn classify(e: reqwest::Error) -> Failure {
    if e.is_timeout() || e.is_connect() {
        Failure::Transient(e.to_string())
    } else {
        Failure::Permanent(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&RetryPolicy::immediate(3), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(Failure::Transient("timeout".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: std::result::Result<(), _> =
            with_retry(&RetryPolicy::immediate(5), "test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Failure::Permanent("HTTP 400".into())) }
            })
            .await;

        assert_eq!(result, Err(Failure::Permanent("HTTP 400".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_failure() {
        let calls = AtomicU32::new(0);
        let result: std::result::Result<(), _> =
            with_retry(&RetryPolicy::immediate(3), "test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Failure::RateLimited) }
            })
            .await;

        assert_eq!(result, Err(Failure::RateLimited));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn rate_limit_wait_grows_with_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.rate_limit_wait(0), Duration::from_secs(2));
        assert_eq!(policy.rate_limit_wait(1), Duration::from_secs(4));
        assert_eq!(policy.timeout_wait(), Duration::from_secs(1));
        assert_eq!(policy.for_batch().timeout_wait(), Duration::from_secs(2));
    }

    #[test]
    fn validate_bounds_attempts() {
        assert!(RetryPolicy::immediate(0).validate().is_err());
        assert!(RetryPolicy::immediate(11).validate().is_err());
        RetryPolicy::immediate(1).validate().unwrap();
    }
}
