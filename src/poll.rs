//! Polling of asynchronous remote jobs (file batches and runs).
//!
//! [`poll_until`] repeatedly fetches a job's state until a classifier says it
//! is terminal. The wait between fetches starts at [`PollPolicy::interval`]
//! and grows by [`PollPolicy::backoff`] up to [`PollPolicy::max_interval`].
//! An optional [`PollPolicy::deadline`] bounds the total wait.
//!
//! Dropping the returned future abandons the poll; the remote job keeps
//! running under the service's own rules.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::remote::RemoteError;

#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_interval: Duration,
    /// Multiplier applied to the interval after each pending fetch. `1.0` is a fixed interval.
    pub backoff: f64,
    /// `None` polls until the job is terminal, however long that takes.
    pub deadline: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(1),
            backoff: 1.0,
            deadline: None,
        }
    }
}

impl PollPolicy {
    /// Fixed interval, no deadline.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            max_interval: interval,
            backoff: 1.0,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    fn next_interval(&self, current: Duration) -> Duration {
        Duration::try_from_secs_f64(current.as_secs_f64() * self.backoff)
            .map_or(self.max_interval, |next| next.min(self.max_interval))
    }
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error("gave up waiting for {what} after {waited:?} (last status: {last_status})")]
    DeadlineExceeded {
        what: &'static str,
        waited: Duration,
        last_status: String,
    },

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Fetch `what` until `is_terminal` returns true, sleeping between fetches.
///
/// `describe` renders the last observed state for the deadline error.
/// Fetch errors end the poll immediately; retrying transient failures is the
/// fetcher's job.
pub async fn poll_until<T, F, Fut>(
    policy: &PollPolicy,
    what: &'static str,
    mut fetch: F,
    is_terminal: impl Fn(&T) -> bool,
    describe: impl Fn(&T) -> String,
) -> Result<T, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let started = Instant::now();
    let mut interval = policy.interval;
    let mut attempts: u64 = 0;

    loop {
        let state = fetch().await?;
        attempts += 1;
        if is_terminal(&state) {
            tracing::debug!(what, attempts, "job reached a terminal state");
            return Ok(state);
        }

        if let Some(deadline) = policy.deadline {
            let waited = started.elapsed();
            if waited + interval > deadline {
                return Err(PollError::DeadlineExceeded {
                    what,
                    waited,
                    last_status: describe(&state),
                });
            }
        }

        tracing::trace!(what, attempts, status = %describe(&state), "still pending");
        tokio::time::sleep(interval).await;
        interval = policy.next_interval(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_backoff_is_capped() {
        let policy = PollPolicy {
            interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(350),
            backoff: 2.0,
            deadline: None,
        };
        let second = policy.next_interval(policy.interval);
        let third = policy.next_interval(second);
        let fourth = policy.next_interval(third);
        assert_eq!(second, Duration::from_millis(200));
        assert_eq!(third, Duration::from_millis(350));
        assert_eq!(fourth, Duration::from_millis(350));
    }

    #[test]
    fn test_huge_backoff_saturates_at_cap() {
        let policy = PollPolicy {
            interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(5),
            backoff: 1e30,
            deadline: None,
        };
        assert_eq!(policy.next_interval(policy.interval), Duration::from_secs(5));

        let infinite = PollPolicy {
            backoff: f64::INFINITY,
            ..policy
        };
        assert_eq!(infinite.next_interval(infinite.interval), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_huge_backoff_keeps_polling() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let policy = PollPolicy {
            interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
            backoff: 1e30,
            deadline: None,
        };
        let result = poll_until(
            &policy,
            "batch",
            || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, RemoteError>(if n < 3 { "in_progress" } else { "completed" })
            },
            |s| *s == "completed",
            |s| s.to_string(),
        )
        .await
        .unwrap();
        assert_eq!(result, "completed");
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_fixed_policy_does_not_grow() {
        let policy = PollPolicy::fixed(Duration::from_millis(5));
        assert_eq!(policy.next_interval(policy.interval), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_polls_until_terminal() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let policy = PollPolicy::fixed(Duration::from_millis(1));
        let result = poll_until(
            &policy,
            "job",
            || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, RemoteError>(if n < 2 { "pending" } else { "done" })
            },
            |s| *s == "done",
            |s| s.to_string(),
        )
        .await
        .unwrap();
        assert_eq!(result, "done");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_deadline_exceeded() {
        let policy = PollPolicy::fixed(Duration::from_millis(5))
            .with_deadline(Duration::from_millis(20));
        let err = poll_until(
            &policy,
            "run",
            || async { Ok::<_, RemoteError>("queued") },
            |_| false,
            |s| s.to_string(),
        )
        .await
        .unwrap_err();
        match err {
            PollError::DeadlineExceeded {
                what, last_status, ..
            } => {
                assert_eq!(what, "run");
                assert_eq!(last_status, "queued");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_error_stops_polling() {
        let policy = PollPolicy::fixed(Duration::from_millis(1));
        let err = poll_until(
            &policy,
            "run",
            || async {
                Err::<&str, _>(RemoteError::Api {
                    status: 500,
                    message: "boom".to_string(),
                })
            },
            |_| true,
            |s| s.to_string(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PollError::Remote(RemoteError::Api { status: 500, .. })));
    }
}
