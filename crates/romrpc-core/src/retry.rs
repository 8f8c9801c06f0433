//! Retry helper for connection negotiation.
//!
//! Opening a transport can fail transiently (refused connect while a server
//! restarts, an interrupted handshake). Those failures are retried a small
//! number of times inside one connect attempt before the session's reconnect
//! loop sees them. Requests themselves are never retried here.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// How the wait between negotiation attempts evolves.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed(Duration),
    /// Doubles from `initial` up to `cap`.
    Doubling { initial: Duration, cap: Duration },
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts including the first; zero behaves like one.
    pub attempts: u32,
    pub backoff: Backoff,
    /// Spread each wait over [0.5, 1.5) of its nominal value, still capped.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Backoff::Doubling {
                initial: Duration::from_millis(200),
                cap: Duration::from_secs(5),
            },
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            backoff: Backoff::Fixed(delay),
            jitter: false,
        }
    }

    pub fn doubling(attempts: u32, initial: Duration, cap: Duration) -> Self {
        Self {
            attempts,
            backoff: Backoff::Doubling { initial, cap },
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Wait after the `failures`-th consecutive failure (1-based).
    pub fn delay_after(&self, failures: u32) -> Duration {
        let (nominal, cap) = match self.backoff {
            Backoff::Fixed(delay) => (delay, delay),
            Backoff::Doubling { initial, cap } => {
                let shift = failures.saturating_sub(1).min(16);
                (initial.saturating_mul(1 << shift).min(cap), cap)
            }
        };
        if !self.jitter {
            return nominal;
        }
        let factor: f64 = rand::rng().random_range(0.5..1.5);
        nominal.mul_f64(factor).min(cap)
    }
}

/// Run `attempt` until it succeeds, fails with an error `retryable` rejects,
/// or the policy runs out. Returns the last result and the attempts made.
pub async fn retry_async<F, Fut, T, E>(
    policy: &RetryPolicy,
    mut attempt: F,
    retryable: impl Fn(&E) -> bool,
) -> (Result<T, E>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let limit = policy.attempts.max(1);
    let mut made = 0;
    loop {
        made += 1;
        let error = match attempt().await {
            Ok(value) => {
                if made > 1 {
                    debug!("Negotiation succeeded on attempt {}", made);
                }
                return (Ok(value), made);
            }
            Err(e) => e,
        };
        if !retryable(&error) || made >= limit {
            if made >= limit && limit > 1 {
                warn!("Negotiation gave up after {} attempts: {}", made, error);
            }
            return (Err(error), made);
        }
        let delay = policy.delay_after(made);
        debug!(
            "Negotiation attempt {}/{} failed ({}); next in {:?}",
            made, limit, error, delay
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_fixed_policy_never_grows() {
        let policy = RetryPolicy::fixed(4, Duration::from_millis(50));
        assert_eq!(policy.delay_after(1), Duration::from_millis(50));
        assert_eq!(policy.delay_after(4), Duration::from_millis(50));
    }

    #[test]
    fn test_doubling_policy_is_capped() {
        let policy = RetryPolicy::doubling(5, Duration::from_secs(1), Duration::from_secs(3));
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(3));
        assert_eq!(policy.delay_after(40), Duration::from_secs(3));
    }

    #[test]
    fn test_jitter_stays_under_cap() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(2)).with_jitter(true);
        for _ in 0..20 {
            let delay = policy.delay_after(1);
            assert!(delay >= Duration::from_secs(1) && delay <= Duration::from_secs(2));
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(5));
        let calls = AtomicU32::new(0);
        let (result, made) = retry_async(
            &policy,
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("handshake reset".to_string())
                    } else {
                        Ok(7)
                    }
                }
            },
            |_: &String| true,
        )
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(made, 3);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let policy = RetryPolicy::fixed(5, Duration::from_millis(5));
        let (result, made) = retry_async(
            &policy,
            || async { Err::<(), _>("policy violation".to_string()) },
            |e: &String| !e.contains("policy"),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(made, 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_limit() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(5));
        let (result, made) = retry_async(
            &policy,
            || async { Err::<(), _>("refused".to_string()) },
            |_: &String| true,
        )
        .await;
        assert_eq!(result.unwrap_err(), "refused");
        assert_eq!(made, 3);
    }
}
