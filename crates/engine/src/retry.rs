//! Bounded, fixed-delay retry shared by the text and voice pipelines.

use std::{fmt, future::Future, time::Duration};

use {parley_config::BackendConfig, tracing::warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    pub fn from_backend(config: &BackendConfig) -> Self {
        Self::new(config.max_attempts, config.retry_delay())
    }
}

/// Why one backend call failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// The backend answered with a non-success status.
    Api { status: u16, body: String },
    /// Connection refused, DNS failure, timeout.
    Network { message: String },
    Other { message: String },
}

impl FailureKind {
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            Self::Api {
                status: status.as_u16(),
                body: String::new(),
            }
        } else if err.is_connect() || err.is_timeout() || err.is_request() {
            Self::Network {
                message: err.to_string(),
            }
        } else {
            Self::Other {
                message: err.to_string(),
            }
        }
    }

    /// Network errors and 5xx answers may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Api { status, .. } => *status >= 500,
            Self::Network { .. } => true,
            Self::Other { .. } => false,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Api { status, body } if body.is_empty() => write!(f, "api error {status}"),
            Self::Api { status, body } => write!(f, "api error {status}: {body}"),
            Self::Network { message } => write!(f, "network error: {message}"),
            Self::Other { message } => f.write_str(message),
        }
    }
}

/// Result of one attempt.
pub type Outcome<T> = Result<T, FailureKind>;

#[derive(Debug, Clone, thiserror::Error)]
#[error("gave up after {attempts} attempt(s): {last}")]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last: FailureKind,
}

/// Run `call` until it succeeds, `retryable` rejects the failure, or the
/// policy's attempt bound is reached.
pub async fn run_with_retry<T, F, Fut, P>(
    policy: RetryPolicy,
    operation: &'static str,
    retryable: P,
    mut call: F,
) -> Result<T, RetryExhausted>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Outcome<T>>,
    P: Fn(&FailureKind) -> bool,
{
    let mut attempt = 1;
    loop {
        match call(attempt).await {
            Ok(value) => return Ok(value),
            Err(failure) => {
                if attempt >= policy.max_attempts || !retryable(&failure) {
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last: failure,
                    });
                }
                warn!(
                    operation,
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %failure,
                    "backend call failed, retrying"
                );
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        rstest::rstest,
        std::sync::atomic::{AtomicU32, Ordering},
    };

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = run_with_retry(policy(), "test", FailureKind::is_transient, |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(FailureKind::Network {
                        message: "refused".into(),
                    })
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
    async fn stops_at_attempt_bound() {
        let start = tokio::time::Instant::now();
        let err = run_with_retry(policy(), "test", |_| true, |_| async {
            Err::<(), _>(FailureKind::Api {
                status: 503,
                body: "busy".into(),
            })
        })
        .await
        .unwrap_err();
        assert_eq!(err.attempts, 3);
        assert!(matches!(err.last, FailureKind::Api { status: 503, .. }));
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let err = run_with_retry(policy(), "test", FailureKind::is_transient, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<(), _>(FailureKind::Api {
                    status: 400,
                    body: String::new(),
                })
            }
        })
        .await
        .unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    #[case(FailureKind::Api { status: 500, body: String::new() }, true)]
    #[case(FailureKind::Api { status: 429, body: String::new() }, false)]
    #[case(FailureKind::Network { message: "x".into() }, true)]
    #[case(FailureKind::Other { message: "x".into() }, false)]
    fn transient_classification(#[case] kind: FailureKind, #[case] transient: bool) {
        assert_eq!(kind.is_transient(), transient);
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }
}
