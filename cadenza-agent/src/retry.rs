//! Default retry policy: exponential backoff with jitter, capped, with a
//! fixed attempt budget. Transient failures are retried; permanent ones
//! surface immediately.

use std::time::Duration;

use tracing::warn;

use crate::error::AgentError;

/// Failure classification for a retried operation.
#[derive(Debug)]
pub enum CallError {
    /// Worth retrying: transport failure or server-side (5xx) error.
    Transient(String),
    /// Not worth retrying: the caller did something wrong (4xx) or the
    /// operation cannot succeed.
    Permanent(AgentError),
}

impl CallError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the second attempt; doubles each retry.
    pub base: Duration,
    /// Ceiling on the computed delay (jitter excluded).
    pub cap: Duration,
    /// Total attempts, including the first.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            cap: Duration::from_secs(10),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `attempt + 1` (zero-based): `base * 2^attempt`,
    /// capped, plus 0–50 ms of jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.cap);
        exp + Duration::from_millis(jitter_ms())
    }
}

/// 0–50 ms of jitter from a time-seeded LCG step, enough to de-correlate
/// concurrent retry loops without pulling in a rand dependency.
fn jitter_ms() -> u64 {
    use std::time::SystemTime;
    let seed = u64::from(
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos(),
    );
    seed.wrapping_mul(6364136223846793005).wrapping_add(1) % 50
}

/// Run `op` under `policy`. `what` names the operation in diagnostics.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, AgentError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, CallError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(CallError::Permanent(error)) => return Err(error),
            Err(CallError::Transient(message)) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return Err(AgentError::api(format!(
                        "{what} failed after {attempt} attempts: {message}"
                    )));
                }
                let delay = policy.delay(attempt - 1);
                warn!("{what} failed ({message}), retrying in {delay:?}");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(4),
            max_attempts: 3,
        }
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result = with_retry(&fast_policy(), "op", move || {
            let calls = calls_clone.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CallError::transient("503"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempts_exhausted() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result: Result<(), _> = with_retry(&fast_policy(), "op", move || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CallError::transient("connection reset"))
            }
        })
        .await;
        assert!(matches!(result.unwrap_err(), AgentError::Api(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result: Result<(), _> = with_retry(&fast_policy(), "op", move || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CallError::Permanent(AgentError::api("400 bad request")))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(1),
            max_attempts: 10,
        };
        // Far past the cap: delay stays within cap + max jitter.
        assert!(policy.delay(30) <= Duration::from_millis(1050));
    }
}
