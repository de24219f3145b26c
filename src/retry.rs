// 🔁 Retry Utility - the one place fetch attempts are repeated
//
// Every adapter call made by the orchestrator goes through `with_retry`:
// - each attempt is bounded by a timeout (the in-flight request is dropped)
// - transient failures wait base × 2^attempt (capped) and try again
// - structural failures return immediately; refetching the same broken
//   page will not fix it
//
// Store writes get the same backoff through `retry_store`, but only for
// SQLITE_BUSY / SQLITE_LOCKED. Any other store error is final.

use crate::db::is_busy;
use crate::sources::FetchError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            timeout_ms: 25_000,
            max_attempts: 4,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    /// No waiting, one attempt - for tests and dry estimates
    pub fn immediate() -> Self {
        RetryPolicy {
            timeout_ms: 5_000,
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay after failed attempt `attempt` (0-based): base × 2^attempt, capped
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

/// Run `op` until it succeeds, fails structurally, or attempts run out.
/// The last error is returned as-is so callers can still classify it.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let attempts = policy.max_attempts.max(1);
    let timeout = Duration::from_millis(policy.timeout_ms);
    let mut attempt = 0;

    loop {
        let result = match tokio::time::timeout(timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout {
                url: label.to_string(),
                timeout_ms: policy.timeout_ms,
            }),
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        attempt += 1;
        if !err.is_transient() || attempt >= attempts {
            return Err(err);
        }

        let delay = policy.backoff_delay(attempt - 1);
        warn!(
            op = label,
            attempt = attempt,
            max_attempts = attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient fetch failure, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

/// Retry a synchronous store operation while the database is busy
pub async fn retry_store<T, F>(policy: &RetryPolicy, label: &str, mut op: F) -> anyhow::Result<T>
where
    F: FnMut() -> anyhow::Result<T>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        let err = match op() {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        attempt += 1;
        if !is_busy(&err) || attempt >= attempts {
            return Err(err);
        }

        let delay = policy.backoff_delay(attempt - 1);
        warn!(
            op = label,
            attempt = attempt,
            max_attempts = attempts,
            delay_ms = delay.as_millis() as u64,
            "store busy, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            timeout_ms: 200,
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 4,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(500));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(1_000));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(4_000));
        assert_eq!(policy.backoff_delay(10), Duration::from_millis(8_000));
        assert_eq!(policy.backoff_delay(200), Duration::from_millis(8_000));
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = with_retry(&fast(4), "chapter", move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(FetchError::Status {
                    url: "u".to_string(),
                    status: 503,
                })
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        println!("✅ Retry with backoff PASSED");
    }

    #[tokio::test]
    async fn test_structural_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), FetchError> = with_retry(&fast(4), "chapter", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(FetchError::structural("u", "no heading"))
        })
        .await;

        assert!(matches!(result, Err(FetchError::Structural { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_exhausted() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), FetchError> = with_retry(&fast(3), "chapter", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(FetchError::Network {
                url: "u".to_string(),
                message: "reset".to_string(),
            })
        })
        .await;

        assert!(matches!(result, Err(FetchError::Network { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_timeout_aborts_attempt() {
        let result: Result<(), FetchError> = with_retry(&fast(1), "slow page", || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        match result {
            Err(FetchError::Timeout { url, timeout_ms }) => {
                assert_eq!(url, "slow page");
                assert_eq!(timeout_ms, 200);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    fn busy() -> anyhow::Error {
        let err = rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY), None);
        anyhow::Error::new(err).context("write chapter")
    }

    #[tokio::test]
    async fn test_store_busy_retried() {
        let mut calls = 0;
        let result = retry_store(&fast(4), "write chapter", || {
            calls += 1;
            if calls < 3 {
                Err(busy())
            } else {
                Ok(calls)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        println!("✅ Busy store retry PASSED");
    }

    #[tokio::test]
    async fn test_store_other_errors_not_retried() {
        let mut calls = 0;
        let result: anyhow::Result<()> = retry_store(&fast(4), "write chapter", || {
            calls += 1;
            Err(anyhow::anyhow!("UNIQUE constraint failed"))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls, 1);

        let mut busy_calls = 0;
        let exhausted: anyhow::Result<()> = retry_store(&fast(2), "write chapter", || {
            busy_calls += 1;
            Err(busy())
        })
        .await;
        assert!(is_busy(&exhausted.unwrap_err()));
        assert_eq!(busy_calls, 2);
    }
}
