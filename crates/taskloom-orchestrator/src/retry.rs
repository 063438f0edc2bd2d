use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use taskloom_core::{TaskloomError, TaskloomResult};
use tracing::info;

/// Smallest delay ever slept between attempts.
const MIN_DELAY_MS: u64 = 10;

/// Transient-error phrases recognized in provider messages.
const TRANSIENT_PHRASES: &[&str] = &[
    "rate limit",
    "429",
    "unavailable",
    "overloaded",
    "connection",
    "timed out",
    "timeout",
    "500",
    "502",
    "503",
    "504",
];

/// Configures bounded exponential backoff with jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed beyond the first attempt.
    pub max_retries: u32,
    /// Base delay in milliseconds.
    pub base_delay_ms: u64,
    /// Exponent applied per attempt.
    pub backoff_factor: f64,
    /// Cap on the computed delay.
    pub max_delay_ms: u64,
    /// Jitter as a fraction of the delay (0.1 = ±10%).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            backoff_factor: 2.0,
            max_delay_ms: 30_000,
            jitter_factor: 0.1,
        }
    }
}

/// Whether an error is transient and worth retrying.
///
/// Rate limits and timeouts are retryable by variant; provider errors are
/// classified by substring against known transient phrases. Everything else
/// is fatal for the operation that raised it.
pub fn is_retryable(err: &TaskloomError) -> bool {
    match err {
        TaskloomError::RateLimited { .. } | TaskloomError::Timeout(_) => true,
        TaskloomError::Provider(msg) => {
            let lower = msg.to_lowercase();
            TRANSIENT_PHRASES.iter().any(|p| lower.contains(p))
        }
        _ => false,
    }
}

/// Extract a provider-supplied retry-after hint, if the error carries one.
pub fn retry_after_hint(err: &TaskloomError) -> Option<u64> {
    match err {
        TaskloomError::RateLimited { retry_after_ms } => *retry_after_ms,
        _ => None,
    }
}

impl RetryPolicy {
    /// Compute the delay before the next attempt.
    ///
    /// An explicit retry-after hint wins. Otherwise the delay is
    /// `base * factor^attempt`, capped at `max_delay_ms`, jittered by
    /// ±(delay × jitter_factor), and floored at a small positive value.
    pub fn delay_for(&self, attempt: u32, hint: Option<u64>) -> Duration {
        if let Some(ms) = hint {
            return Duration::from_millis(ms.max(MIN_DELAY_MS));
        }

        let raw = (self.base_delay_ms as f64) * self.backoff_factor.powi(attempt as i32);
        let capped = raw.min(self.max_delay_ms as f64);

        let jittered = if self.jitter_factor > 0.0 {
            let spread = capped * self.jitter_factor;
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            capped + offset
        } else {
            capped
        };

        Duration::from_millis((jittered as u64).max(MIN_DELAY_MS))
    }
}

/// Run `op` with bounded retry.
///
/// Makes up to `max_retries + 1` attempts, sleeping [`RetryPolicy::delay_for`]
/// between them. Non-retryable errors propagate immediately; exhausting the
/// budget surfaces [`TaskloomError::MaxRetriesExceeded`] carrying the last
/// error's message.
pub async fn retry_with_backoff<F, Fut, T>(policy: &RetryPolicy, mut op: F) -> TaskloomResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = TaskloomResult<T>>,
{
    let mut last_error: Option<TaskloomError> = None;

    for attempt in 0..=policy.max_retries {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !is_retryable(&e) {
                    return Err(e);
                }
                if attempt < policy.max_retries {
                    let delay = policy.delay_for(attempt, retry_after_hint(&e));
                    info!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retryable error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                last_error = Some(e);
            }
        }
    }

    Err(TaskloomError::MaxRetriesExceeded {
        attempts: policy.max_retries + 1,
        last_error: last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn exact_policy() -> RetryPolicy {
        RetryPolicy {
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn test_is_retryable_classification() {
        assert!(is_retryable(&TaskloomError::Timeout(300)));
        assert!(is_retryable(&TaskloomError::RateLimited {
            retry_after_ms: None
        }));
        assert!(is_retryable(&TaskloomError::Provider(
            "503 Service Unavailable".to_string()
        )));
        assert!(is_retryable(&TaskloomError::Provider(
            "connection reset by peer".to_string()
        )));
        assert!(is_retryable(&TaskloomError::Provider(
            "model overloaded, try later".to_string()
        )));

        assert!(!is_retryable(&TaskloomError::Provider(
            "invalid api key".to_string()
        )));
        assert!(!is_retryable(&TaskloomError::Orchestrator(
            "no plan".to_string()
        )));
    }

    #[test]
    fn test_delay_exponential_without_jitter() {
        let policy = RetryPolicy {
            base_delay_ms: 1_000,
            backoff_factor: 2.0,
            max_delay_ms: 30_000,
            jitter_factor: 0.0,
            max_retries: 5,
        };
        assert_eq!(policy.delay_for(0, None), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(1, None), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(3, None), Duration::from_millis(8_000));
        // Capped at max_delay_ms.
        assert_eq!(policy.delay_for(10, None), Duration::from_millis(30_000));
    }

    #[test]
    fn test_delay_jitter_stays_in_band() {
        let policy = RetryPolicy {
            base_delay_ms: 1_000,
            backoff_factor: 2.0,
            max_delay_ms: 30_000,
            jitter_factor: 0.25,
            max_retries: 3,
        };
        for _ in 0..50 {
            let d = policy.delay_for(0, None).as_millis() as u64;
            assert!((750..=1_250).contains(&d), "delay {d} out of jitter band");
        }
    }

    #[test]
    fn test_retry_after_hint_wins() {
        let policy = exact_policy();
        assert_eq!(policy.delay_for(5, Some(42)), Duration::from_millis(42));
        // Hint is floored at the minimum delay.
        assert_eq!(policy.delay_for(0, Some(0)), Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result = retry_with_backoff(&exact_policy(), move || {
            let calls = calls2.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TaskloomError::Provider("429 rate limit".to_string()))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_propagates_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: TaskloomResult<()> = retry_with_backoff(&exact_policy(), move || {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TaskloomError::Orchestrator("bad plan".to_string()))
            }
        })
        .await;

        assert!(matches!(result, Err(TaskloomError::Orchestrator(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_surfaces_max_retries_exceeded() {
        let policy = RetryPolicy {
            max_retries: 2,
            ..exact_policy()
        };
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: TaskloomResult<()> = retry_with_backoff(&policy, move || {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TaskloomError::Timeout(300))
            }
        })
        .await;

        match result {
            Err(TaskloomError::MaxRetriesExceeded {
                attempts,
                last_error,
            }) => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("300"));
            }
            other => panic!("expected MaxRetriesExceeded, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
