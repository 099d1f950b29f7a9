//! Per-call timeout and bounded exponential backoff

use std::future::Future;
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::ExponentialBackoffBuilder;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Timeout and retry settings applied to every remote call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Retries after the first attempt; `0` means a single attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_call_timeout_ms() -> u64 {
    15_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryPolicy {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    fn backoff(&self) -> ExponentialBackoff {
        // Retries are bounded by count, not elapsed time.
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.initial_backoff_ms))
            .with_max_interval(Duration::from_millis(self.max_backoff_ms))
            .with_multiplier(self.multiplier)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Run `call` with a timeout per attempt, retrying retryable failures.
    ///
    /// Non-retryable errors are returned as-is after the first attempt.
    /// When retries run out the last error is wrapped in
    /// [`Error::RetriesExhausted`].
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let timeout = self.call_timeout();
        let timeout_ms = self.call_timeout_ms;
        let max_attempts = self.max_retries.saturating_add(1);
        let mut attempt = 0u32;

        backoff::future::retry(self.backoff(), || {
            attempt += 1;
            let current = attempt;
            let fut = call();
            async move {
                let outcome = match tokio::time::timeout(timeout, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout { timeout_ms }),
                };
                match outcome {
                    Ok(value) => Ok(value),
                    Err(err) if err.is_retryable() && current < max_attempts => {
                        tracing::debug!(
                            operation,
                            attempt = current,
                            error = %err,
                            "Remote call failed, backing off"
                        );
                        Err(backoff::Error::transient(err))
                    }
                    Err(err) if err.is_retryable() && max_attempts > 1 => {
                        tracing::warn!(operation, attempts = current, error = %err, "Remote call retries exhausted");
                        Err(backoff::Error::permanent(Error::RetriesExhausted {
                            attempts: current,
                            last: Box::new(err),
                        }))
                    }
                    Err(err) => Err(backoff::Error::permanent(err)),
                }
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            call_timeout_ms: 50,
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            multiplier: 1.5,
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = fast(3)
            .run("fetch", || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(Error::server(503, "unavailable"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_bounded_retries() {
        let calls = AtomicU32::new(0);
        let err = fast(2)
            .run("fetch", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::network("reset")) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(err, Error::RetriesExhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn does_not_retry_rejections() {
        let calls = AtomicU32::new(0);
        let err = fast(5)
            .run("upsert", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(Error::Validation {
                        id: None,
                        message: "bad".into(),
                    })
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn slow_calls_time_out() {
        let err = fast(0)
            .run("fetch", || async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout { timeout_ms: 50 }));
    }

    #[test]
    fn policy_defaults_fill_missing_fields() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"max_retries": 7}"#).unwrap();
        assert_eq!(policy.max_retries, 7);
        assert_eq!(policy.call_timeout_ms, 15_000);
    }
}
