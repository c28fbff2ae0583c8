use broker_providers::{ProviderError, ProviderResult};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Bounded exponential backoff for transient provider errors.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Adds up to 10% random delay so concurrent retries spread out.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(300),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter: false,
        }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// `base * 2^(attempt - 1)`, capped at `max_delay`. Attempts count from 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .base_delay
            .saturating_mul(2_u32.pow(exponent))
            .min(self.max_delay);
        if self.jitter && !delay.is_zero() {
            let spread = (delay.as_millis() as u64 / 10).max(1);
            delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
        } else {
            delay
        }
    }

    /// Runs `call` until it succeeds, fails permanently, or attempts run out.
    /// `call` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, label: &str, mut call: F) -> ProviderResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match call(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation = %label,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient provider error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

/// Treats a provider "not found" as success, for idempotent release.
pub fn ignore_not_found(result: ProviderResult<()>) -> ProviderResult<()> {
    match result {
        Err(ProviderError::ResourceNotFound(_)) => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(4))
    }

    #[test]
    fn test_delay_doubles_until_cap() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(4), Duration::from_secs(8));
        assert_eq!(policy.delay_for(5), Duration::from_secs(10));
        assert_eq!(policy.delay_for(40), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let result = fast()
            .run("status", |_| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProviderError::RateLimited("busy".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: ProviderResult<()> = fast()
            .run("extend", |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::AuthenticationFailed("nope".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: ProviderResult<()> = fast()
            .run("release", |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::Timeout("slow".into()))
            })
            .await;
        assert!(matches!(result, Err(ProviderError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_ignore_not_found() {
        assert!(ignore_not_found(Err(ProviderError::ResourceNotFound("x".into()))).is_ok());
        assert!(ignore_not_found(Err(ProviderError::Timeout("x".into()))).is_err());
    }

    proptest! {
        #[test]
        fn prop_delay_is_monotonic_and_capped(
            base_ms in 1u64..1_000,
            cap_ms in 1u64..100_000,
            attempt in 1u32..64,
            jitter in any::<bool>(),
        ) {
            let mut policy = RetryPolicy::new(
                64,
                Duration::from_millis(base_ms),
                Duration::from_millis(cap_ms),
            );
            policy.jitter = jitter;
            let cap = Duration::from_millis(cap_ms);
            let slack = if jitter { cap / 10 + Duration::from_millis(1) } else { Duration::ZERO };

            prop_assert!(policy.delay_for(attempt) <= cap + slack);
            if !jitter {
                prop_assert!(policy.delay_for(attempt) <= policy.delay_for(attempt + 1));
            }
        }
    }
}
