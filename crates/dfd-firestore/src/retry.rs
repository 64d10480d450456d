//! Exponential backoff with full jitter for transient Firestore failures.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, SystemTime};

use tracing::{info_span, warn, Instrument};

use crate::error::{FirestoreError, FirestoreResult};
use crate::metrics::record_retry;

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 5000,
        }
    }
}

impl RetryConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_retries: env_parse("FIRESTORE_MAX_RETRIES").unwrap_or(defaults.max_retries),
            base_delay_ms: env_parse("FIRESTORE_RETRY_BASE_MS").unwrap_or(defaults.base_delay_ms),
            max_delay_ms: env_parse("FIRESTORE_RETRY_MAX_MS").unwrap_or(defaults.max_delay_ms),
        }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based).
    ///
    /// A server hint wins. Otherwise the delay is drawn from
    /// `[base, min(base * 2^attempt, max)]` using `jitter` in `[0, 1)`.
    pub fn delay_for(&self, attempt: u32, retry_after_ms: Option<u64>, jitter: f64) -> Duration {
        if let Some(after) = retry_after_ms {
            return Duration::from_millis(after);
        }

        let ceiling = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(self.max_delay_ms);
        let jittered = (ceiling as f64 * jitter.clamp(0.0, 1.0)) as u64;

        Duration::from_millis(jittered.max(self.base_delay_ms.min(ceiling)))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

/// Cheap jitter from the clock's sub-second nanos.
fn clock_jitter() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as f64 / 1000.0
}

/// Run `op`, retrying retryable failures (network, 429, 5xx).
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation: &str, op: F) -> FirestoreResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = FirestoreResult<T>>,
{
    let mut attempt = 0;
    loop {
        let span = info_span!("firestore_attempt", operation = %operation, attempt = attempt + 1);
        let err: FirestoreError = match op().instrument(span).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !err.is_retryable() || attempt >= config.max_retries {
            return Err(err);
        }

        let delay = config.delay_for(attempt, err.retry_after_ms(), clock_jitter());
        warn!(
            operation = %operation,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Firestore operation failed, retrying"
        );
        record_retry(operation);

        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// [`with_retry`] for creates under a caller-chosen ID.
///
/// An attempt that timed out may still have been written. If a retried
/// attempt then reports `AlreadyExists`, the write is taken as landed and
/// `read_back` fetches what was stored. A conflict on the first attempt is
/// returned unchanged.
pub async fn with_retry_create<T, F, Fut, R, RFut>(
    config: &RetryConfig,
    operation: &str,
    op: F,
    read_back: R,
) -> FirestoreResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = FirestoreResult<T>>,
    R: FnOnce() -> RFut,
    RFut: Future<Output = FirestoreResult<T>>,
{
    let attempts = AtomicU32::new(0);
    let result = with_retry(config, operation, || {
        attempts.fetch_add(1, Ordering::SeqCst);
        op()
    })
    .await;

    match result {
        Err(FirestoreError::AlreadyExists(msg)) if attempts.load(Ordering::SeqCst) > 1 => {
            warn!(operation = %operation, error = %msg, "Create conflicted after a retry, reading back");
            read_back().await
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn fast() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            base_delay_ms: 1,
            max_delay_ms: 2,
        }
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_delay_ms, 100);
        assert_eq!(config.max_delay_ms, 5000);
    }

    #[test]
    #[serial]
    fn test_retry_config_from_env() {
        std::env::set_var("FIRESTORE_RETRY_BASE_MS", "250");
        std::env::set_var("FIRESTORE_RETRY_MAX_MS", "not-a-number");
        let config = RetryConfig::from_env();
        std::env::remove_var("FIRESTORE_RETRY_BASE_MS");
        std::env::remove_var("FIRESTORE_RETRY_MAX_MS");

        assert_eq!(config.base_delay_ms, 250);
        assert_eq!(config.max_delay_ms, 5000);
    }

    #[test]
    fn test_delay_prefers_server_hint() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for(0, Some(2000), 0.5), Duration::from_millis(2000));
    }

    #[test]
    fn test_delay_bounds() {
        let config = RetryConfig {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 2000,
        };
        assert_eq!(config.delay_for(10, None, 0.9), Duration::from_millis(1800));
        assert_eq!(config.delay_for(10, None, 0.0), Duration::from_millis(1000));
        assert_eq!(config.delay_for(1, None, 0.75), Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast(), "get", || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(FirestoreError::ServerError(503, "unavailable".into()))
            } else {
                Ok("doc")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "doc");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_does_not_retry_client_errors() {
        let calls = AtomicU32::new(0);
        let result: FirestoreResult<()> = with_retry(&fast(), "create", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(FirestoreError::AlreadyExists("doc".into()))
        })
        .await;

        assert!(matches!(result, Err(FirestoreError::AlreadyExists(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: FirestoreResult<()> = with_retry(&fast(), "query", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(FirestoreError::ServerError(500, "boom".into()))
        })
        .await;

        assert!(matches!(result, Err(FirestoreError::ServerError(500, _))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_create_conflict_after_retry_reads_back() {
        let calls = AtomicU32::new(0);
        let result = with_retry_create(
            &fast(),
            "create",
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(FirestoreError::ServerError(503, "timed out".into()))
                } else {
                    Err(FirestoreError::AlreadyExists("doc".into()))
                }
            },
            || async { Ok("stored") },
        )
        .await;

        assert_eq!(result.unwrap(), "stored");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_create_conflict_on_first_attempt_is_an_error() {
        let read_back = AtomicU32::new(0);
        let result: FirestoreResult<&str> = with_retry_create(
            &fast(),
            "create",
            || async { Err(FirestoreError::AlreadyExists("doc".into())) },
            || async {
                read_back.fetch_add(1, Ordering::SeqCst);
                Ok("stored")
            },
        )
        .await;

        assert!(matches!(result, Err(FirestoreError::AlreadyExists(_))));
        assert_eq!(read_back.load(Ordering::SeqCst), 0);
    }
}
