//! Bounded retry for optimistic-concurrency conflicts.

use std::future::Future;
use std::time::Duration;

use koney_core::cluster::ClusterError;

/// Default number of attempts for conflicting writes.
pub const DEFAULT_PATCH_ATTEMPTS: u32 = 5;

/// Base delay of the exponential backoff between attempts.
const BASE_DELAY: Duration = Duration::from_millis(50);

/// Errors that may represent a lost optimistic-concurrency race.
pub trait ConflictError {
    /// Whether retrying the same write after a re-read can succeed.
    fn is_conflict(&self) -> bool;
}

impl ConflictError for ClusterError {
    fn is_conflict(&self) -> bool {
        Self::is_conflict(self)
    }
}

impl ConflictError for crate::decoy::DeployError {
    fn is_conflict(&self) -> bool {
        matches!(self, Self::Cluster(err) if err.is_conflict())
    }
}

/// Run `operation` until it succeeds, fails with a non-conflict error,
/// or exhausts `attempts`. The delay doubles after every conflict.
///
/// The operation is re-invoked from scratch each attempt, so it must
/// re-read whatever object it writes.
///
/// # Errors
///
/// Returns the first non-conflict error immediately, or the last
/// conflict once attempts are exhausted.
pub async fn on_conflict<T, E, F, Fut>(attempts: u32, mut operation: F) -> Result<T, E>
where
    E: ConflictError + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = attempts.max(1);
    let mut delay = BASE_DELAY;

    for attempt in 0.. {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_conflict() && attempt + 1 < attempts => {
                tracing::debug!(attempt, error = %err, "write conflicted, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(err) => return Err(err),
        }
    }
    unreachable!("retry loop always returns");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn conflict() -> ClusterError {
        ClusterError::Conflict {
            kind: "Workload",
            name: "default/nginx".to_string(),
            submitted: 1,
            current: 2,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_conflicts_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, ClusterError> = on_conflict(5, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(conflict())
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
    async fn test_gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), ClusterError> = on_conflict(3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(conflict()) }
        })
        .await;
        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_conflict_errors_pass_through() {
        let calls = AtomicU32::new(0);
        let result: Result<(), ClusterError> = on_conflict(5, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ClusterError::Unreachable("down".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(ClusterError::Unreachable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
