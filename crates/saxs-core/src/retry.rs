//! Retry policy for device operations.
//!
//! The connection never retries on its own. Device-specific operations wrap
//! their exchanges in [`with_retry`], which repeats only errors classified as
//! retryable by [`CoreError::is_retryable`] and reports the last failure.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Defines a policy for retrying a device operation.
///
/// # Example
///
/// ```rust
/// use saxs_core::retry::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_attempts: 5,
///     backoff_delay: Duration::from_millis(200),
/// };
/// assert!(policy.max_attempts > 1);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    ///
    /// Values below 1 are treated as 1.
    pub max_attempts: u32,

    /// Constant delay between attempts.
    #[serde(with = "humantime_serde")]
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    /// Three attempts, 50 ms apart.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff_delay: Duration::ZERO,
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are exhausted.
///
/// The closure receives the 1-based attempt number. The error returned after
/// exhaustion is the one raised by the last attempt.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> CoreResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = CoreResult<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < attempts => {
                tracing::debug!(
                    operation = label,
                    attempt,
                    max_attempts = attempts,
                    kind = describe(&err),
                    error = %err,
                    "Retrying after communication error"
                );
                sleep(policy.backoff_delay).await;
                attempt += 1;
            }
            Err(err) => {
                if err.is_retryable() {
                    tracing::warn!(operation = label, attempts, error = %err, "Retries exhausted");
                }
                return Err(err);
            }
        }
    }
}

/// Classify an error for logging at call sites that do their own looping.
pub fn describe(err: &CoreError) -> &'static str {
    match err {
        CoreError::Timeout { .. } => "timeout",
        CoreError::Protocol { .. } if err.is_retryable() => "integrity",
        CoreError::Protocol { .. } => "protocol",
        CoreError::DeviceRejected { .. } => "rejected",
        CoreError::CommunicationBroken { .. } => "broken",
        CoreError::Connection(_) => "connection",
        CoreError::Config(_) | CoreError::InvalidArgument(_) => "usage",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_timeouts() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast(), "GAP", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(CoreError::timeout("tmcm", "GAP", Duration::from_millis(1)))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_last_error_reported() {
        let result: CoreResult<()> = with_retry(&fast(), "GAP", |attempt| async move {
            Err(CoreError::protocol(
                "tmcm",
                ProtocolError::Checksum {
                    computed: attempt as u8,
                    received: 0xFF,
                },
            ))
        })
        .await;
        match result {
            Err(CoreError::Protocol {
                source: ProtocolError::Checksum { computed, .. },
                ..
            }) => assert_eq!(computed, 3),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejection_not_retried() {
        let calls = AtomicU32::new(0);
        let result: CoreResult<()> = with_retry(&fast(), "SAP", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CoreError::rejected("tmcm", "InvalidValue")) }
        })
        .await;
        assert!(matches!(result, Err(CoreError::DeviceRejected { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_policy_deserializes_humantime() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"max_attempts": 5, "backoff_delay": "250ms"}"#).unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.backoff_delay, Duration::from_millis(250));
        assert_eq!(describe(&CoreError::Config("x".into())), "usage");
    }
}
