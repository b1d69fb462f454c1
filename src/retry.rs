//! Bounded retry executor applied independently around each pipeline stage.
//!
//! Attempts run back to back with no delay between them. Backoff between
//! deliveries is the job queue's concern, not this executor's.

use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::RetryWithoutCause;

/// An ordered step of the per-job pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Download,
    Transcode,
    Upload,
}

impl Stage {
    /// Returns the lowercase stage name used in logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Transcode => "transcode",
            Self::Upload => "upload",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry budget for one stage.
///
/// `max_attempts` counts every attempt including the first, so a stage with
/// three retries has four attempts. A policy with zero attempts never runs
/// its operation and fails with [`RetryWithoutCause`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub stage: Stage,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Builds a policy allowing the initial attempt plus `retries` more.
    pub fn with_retries(stage: Stage, retries: u32) -> Self {
        Self {
            stage,
            max_attempts: retries.saturating_add(1),
        }
    }

    /// Number of attempts after the first.
    pub fn retries(&self) -> u32 {
        self.max_attempts.saturating_sub(1)
    }
}

/// Runs `operation` until it succeeds or the policy's budget is spent.
///
/// Every failure except the last is logged with its attempt number and cause.
/// The last failure is returned to the caller exactly as the operation
/// produced it.
pub async fn run_with_retry<F, Fut, T, E>(policy: &RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display + From<RetryWithoutCause>,
{
    let retries = policy.retries();

    for attempt in 0..policy.max_attempts {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt == retries => return Err(e),
            Err(e) => {
                warn!(
                    stage = %policy.stage,
                    attempt = attempt + 1,
                    retries,
                    error = %e,
                    "Retry {}/{} of {} stage",
                    attempt + 1,
                    retries,
                    policy.stage
                );
            }
        }
    }

    Err(E::from(RetryWithoutCause {
        stage: policy.stage,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq, Eq)]
    enum TestError {
        Attempt(u32),
        NoCause(Stage),
    }

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    impl From<RetryWithoutCause> for TestError {
        fn from(e: RetryWithoutCause) -> Self {
            Self::NoCause(e.stage)
        }
    }

    #[test]
    fn retries_count_extra_attempts() {
        let policy = RetryPolicy::with_retries(Stage::Download, 3);
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.retries(), 3);
    }

    #[tokio::test]
    async fn first_success_runs_once() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::with_retries(Stage::Download, 3);

        let result: Result<&str, TestError> = run_with_retry(&policy, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok("done") }
        })
        .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_budget_returns_last_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::with_retries(Stage::Transcode, 2);

        let result: Result<(), TestError> = run_with_retry(&policy, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(TestError::Attempt(attempt)) }
        })
        .await;

        assert_eq!(result, Err(TestError::Attempt(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn succeeds_on_final_attempt() {
        let policy = RetryPolicy::with_retries(Stage::Download, 3);

        let result: Result<u32, TestError> = run_with_retry(&policy, |attempt| async move {
            if attempt < 3 {
                Err(TestError::Attempt(attempt))
            } else {
                Ok(attempt)
            }
        })
        .await;

        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn zero_attempt_policy_fails_without_running() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            stage: Stage::Upload,
            max_attempts: 0,
        };

        let result: Result<(), TestError> = run_with_retry(&policy, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;

        assert_eq!(result, Err(TestError::NoCause(Stage::Upload)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
