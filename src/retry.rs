//! Bounded retry with a fixed backoff for transient failures.
//!
//! Each call to [`RetryPolicy::execute`] owns its own [`RetryState`], so the
//! same policy can be shared by concurrent or re-entrant callers without
//! leaking attempt counts between them.

use std::future::Future;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::time::sleep;

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default pause between attempts.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(15);

/// Attempt bookkeeping for a single [`RetryPolicy::execute`] invocation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryState {
    /// One-based number of the attempt about to run (or that just failed).
    pub attempt: u32,
    /// Upper bound on attempts for this invocation (`max_retries + 1`).
    pub max_attempts: u32,
}

impl RetryState {
    const fn first(max_attempts: u32) -> Self {
        Self {
            attempt: 1,
            max_attempts,
        }
    }

    /// Returns `true` when another attempt is permitted after this one.
    #[must_use]
    pub const fn can_retry(&self) -> bool {
        self.attempt < self.max_attempts
    }

    const fn next(self) -> Self {
        Self {
            attempt: self.attempt + 1,
            max_attempts: self.max_attempts,
        }
    }
}

/// Outcome of an operation that did not succeed under a [`RetryPolicy`].
#[derive(Debug, Error, Eq, PartialEq)]
pub enum RetryError<E> {
    /// The error was transient but the attempt budget ran out.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        /// Number of attempts made, including the first.
        attempts: u32,
        /// Error returned by the final attempt.
        last: E,
    },
    /// The error was not classified as transient, so no retry was made.
    #[error("{0}")]
    Fatal(E),
}

impl<E> RetryError<E> {
    /// Returns the underlying error regardless of how the retry ended.
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { last, .. } => last,
            Self::Fatal(err) => err,
        }
    }

    /// Returns `true` when the retry budget was used up.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

/// Fixed-interval retry for operations that fail transiently.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_BACKOFF)
    }
}

impl RetryPolicy {
    /// Creates a policy allowing `max_retries` retries after the first
    /// attempt, pausing `backoff` between attempts.
    #[must_use]
    pub const fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Number of retries permitted after the first attempt.
    #[must_use]
    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Pause between attempts.
    #[must_use]
    pub const fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Runs `operation` until it succeeds, fails with an error that
    /// `is_transient` rejects, or the attempt budget is spent.
    ///
    /// `on_retry` is called with the state of the failed attempt before
    /// each pause so callers can report progress.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError::Fatal`] for non-transient errors and
    /// [`RetryError::Exhausted`] once `max_retries + 1` attempts have failed
    /// transiently.
    pub async fn execute<T, E, Op, Fut, Classify, Notify>(
        &self,
        mut operation: Op,
        is_transient: Classify,
        mut on_retry: Notify,
    ) -> Result<T, RetryError<E>>
    where
        Op: FnMut(RetryState) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        Classify: Fn(&E) -> bool,
        Notify: FnMut(RetryState, &E),
    {
        let mut state = RetryState::first(self.max_retries.saturating_add(1));
        loop {
            match operation(state).await {
                Ok(value) => return Ok(value),
                Err(err) if !is_transient(&err) => return Err(RetryError::Fatal(err)),
                Err(err) if !state.can_retry() => {
                    tracing::warn!(attempts = state.attempt, "retry budget exhausted");
                    return Err(RetryError::Exhausted {
                        attempts: state.attempt,
                        last: err,
                    });
                }
                Err(err) => {
                    on_retry(state, &err);
                    tracing::debug!(
                        attempt = state.attempt,
                        backoff_secs = self.backoff.as_secs(),
                        "transient failure; retrying"
                    );
                    sleep(self.backoff).await;
                    state = state.next();
                }
            }
        }
    }
}

/// Point in time after which a polling loop gives up.
///
/// A timeout too large to represent as an [`Instant`] never expires.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// Starts a deadline `timeout` from now.
    #[must_use]
    pub fn after(timeout: Duration) -> Self {
        Self(Instant::now().checked_add(timeout))
    }

    /// Returns `true` once the deadline lies in the past.
    #[must_use]
    pub fn has_passed(self) -> bool {
        self.0.is_some_and(|deadline| Instant::now() > deadline)
    }

    /// Time left before the deadline; [`Duration::MAX`] when unbounded.
    #[must_use]
    pub fn remaining(self) -> Duration {
        self.0.map_or(Duration::MAX, |deadline| {
            deadline.saturating_duration_since(Instant::now())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::cell::Cell;

    #[derive(Debug, Eq, PartialEq, Error)]
    enum Flaky {
        #[error("connection refused")]
        Refused,
        #[error("broken")]
        Broken,
    }

    const fn refused(err: &Flaky) -> bool {
        matches!(err, Flaky::Refused)
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(3)]
    #[tokio::test]
    async fn transient_errors_are_attempted_at_most_max_retry_plus_one_times(
        #[case] max_retries: u32,
    ) {
        let calls = Cell::new(0_u32);
        let policy = RetryPolicy::new(max_retries, Duration::ZERO);

        let result: Result<(), _> = policy
            .execute(
                |_| {
                    calls.set(calls.get() + 1);
                    async { Err(Flaky::Refused) }
                },
                refused,
                |_, _| {},
            )
            .await;

        assert_eq!(calls.get(), max_retries + 1);
        assert_eq!(
            result,
            Err(RetryError::Exhausted {
                attempts: max_retries + 1,
                last: Flaky::Refused,
            })
        );
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let calls = Cell::new(0_u32);
        let policy = RetryPolicy::new(3, Duration::ZERO);

        let result: Result<(), _> = policy
            .execute(
                |_| {
                    calls.set(calls.get() + 1);
                    async { Err(Flaky::Broken) }
                },
                refused,
                |_, _| {},
            )
            .await;

        assert_eq!(calls.get(), 1);
        assert_eq!(result, Err(RetryError::Fatal(Flaky::Broken)));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures_and_reports_each_retry() {
        let policy = RetryPolicy::new(3, Duration::ZERO);
        let mut notified = Vec::new();

        let result = policy
            .execute(
                |state| async move {
                    if state.attempt < 3 {
                        Err(Flaky::Refused)
                    } else {
                        Ok(state.attempt)
                    }
                },
                refused,
                |state, _| notified.push(state.attempt),
            )
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(notified, vec![1, 2]);
    }

    #[test]
    fn into_inner_unwraps_both_variants() {
        let exhausted: RetryError<Flaky> = RetryError::Exhausted {
            attempts: 4,
            last: Flaky::Refused,
        };
        assert!(exhausted.is_exhausted());
        assert_eq!(exhausted.into_inner(), Flaky::Refused);
        assert_eq!(RetryError::Fatal(Flaky::Broken).into_inner(), Flaky::Broken);
    }

    #[test]
    fn unrepresentable_deadline_never_expires() {
        let deadline = Deadline::after(Duration::from_secs(u64::MAX));

        assert!(!deadline.has_passed());
        assert_eq!(deadline.remaining(), Duration::MAX);
    }

    #[test]
    fn zero_deadline_runs_out() {
        let deadline = Deadline::after(Duration::ZERO);

        assert!(deadline.remaining().is_zero());
    }
}
