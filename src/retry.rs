//! Bounded retry with per-attempt delays.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_retry::RetryIf;
use tracing::{debug, warn};

use crate::error::ClassifiedError;

type DelayFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// How many times to try, and how long to wait after each failed attempt.
///
/// `delay_for_attempt(i)` is the pause after the failure of attempt `i`
/// (0-based) and before attempt `i + 1`.
#[derive(Clone)]
pub struct RetryPolicy {
  max_attempts: u32,
  delay: DelayFn,
}

impl RetryPolicy {
  /// `max_attempts` below 1 is raised to 1.
  pub fn new<F>(max_attempts: u32, delay: F) -> Self
  where
    F: Fn(u32) -> Duration + Send + Sync + 'static,
  {
    Self {
      max_attempts: max_attempts.max(1),
      delay: Arc::new(delay),
    }
  }

  /// `min(base * 2^i, cap)`.
  pub fn exponential(max_attempts: u32, base: Duration, cap: Duration) -> Self {
    Self::new(max_attempts, move |i| {
      base.saturating_mul(2u32.saturating_pow(i)).min(cap)
    })
  }

  pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
    Self::new(max_attempts, move |_| delay)
  }

  /// Single attempt, no retries.
  pub fn never() -> Self {
    Self::fixed(1, Duration::ZERO)
  }

  /// Read default: three attempts, 1s then 2s apart.
  pub fn queries() -> Self {
    Self::exponential(3, Duration::from_secs(1), Duration::from_secs(30))
  }

  /// Write default: two attempts.
  pub fn mutations() -> Self {
    Self::exponential(2, Duration::from_secs(1), Duration::from_secs(30))
  }

  pub fn max_attempts(&self) -> u32 {
    self.max_attempts
  }

  pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
    (self.delay)(attempt_index)
  }

  fn schedule(&self) -> impl Iterator<Item = Duration> {
    let delay = Arc::clone(&self.delay);
    (0..self.max_attempts - 1).map(move |i| delay(i))
  }
}

impl fmt::Debug for RetryPolicy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RetryPolicy")
      .field("max_attempts", &self.max_attempts)
      .finish_non_exhaustive()
  }
}

/// Final result of a retried operation and how many attempts it took.
#[derive(Debug, Clone)]
pub struct Attempted<T> {
  pub result: Result<T, ClassifiedError>,
  pub attempts: u32,
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy runs out of attempts.
pub async fn run<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Attempted<T>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, ClassifiedError>>,
{
  let attempts = AtomicU32::new(0);
  let max = policy.max_attempts();

  let result = RetryIf::start(
    policy.schedule(),
    || {
      let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
      debug!(label, attempt, max, "Attempt started");
      op()
    },
    |e: &ClassifiedError| {
      let attempt = attempts.load(Ordering::SeqCst);
      warn!(
        label,
        attempt,
        max,
        kind = %e.kind,
        retryable = e.retryable,
        "Attempt failed: {}",
        e.message
      );
      e.retryable
    },
  )
  .await;

  Attempted {
    result,
    attempts: attempts.load(Ordering::SeqCst),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::ErrorKind;
  use parking_lot::Mutex;
  use std::collections::VecDeque;
  use tokio::time::Instant;

  fn server_error() -> ClassifiedError {
    ClassifiedError::new(ErrorKind::ServerError, "boom", Some(500))
  }

  fn not_found() -> ClassifiedError {
    ClassifiedError::new(ErrorKind::NotFound, "missing", Some(404))
  }

  /// Fails `k` times with `err`, then succeeds with the attempt number.
  fn flaky(k: u32, err: ClassifiedError) -> impl FnMut() -> futures::future::Ready<Result<u32, ClassifiedError>> {
    let mut calls = 0;
    move || {
      calls += 1;
      if calls <= k {
        futures::future::ready(Err(err.clone()))
      } else {
        futures::future::ready(Ok(calls))
      }
    }
  }

  #[test]
  fn test_exponential_schedule_is_capped() {
    let policy = RetryPolicy::exponential(10, Duration::from_secs(1), Duration::from_secs(30));
    assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
    assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
    assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
    assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(30));
    assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(30));
  }

  #[test]
  fn test_zero_attempts_means_one() {
    assert_eq!(RetryPolicy::fixed(0, Duration::ZERO).max_attempts(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_succeeds_on_last_allowed_attempt() {
    let k = 3;
    let policy = RetryPolicy::fixed(k + 1, Duration::from_millis(100));

    let outcome = run(&policy, "test", flaky(k, server_error())).await;

    assert_eq!(outcome.result, Ok(k + 1));
    assert_eq!(outcome.attempts, k + 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_gives_up_after_max_attempts() {
    let k = 3;
    let policy = RetryPolicy::fixed(k, Duration::from_millis(100));

    let outcome = run(&policy, "test", flaky(k, server_error())).await;

    assert_eq!(outcome.result, Err(server_error()));
    assert_eq!(outcome.attempts, k);
  }

  #[tokio::test(start_paused = true)]
  async fn test_non_retryable_stops_immediately() {
    let policy = RetryPolicy::fixed(5, Duration::from_millis(100));

    let outcome = run(&policy, "test", flaky(10, not_found())).await;

    assert_eq!(outcome.result, Err(not_found()));
    assert_eq!(outcome.attempts, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_waits_between_attempts() {
    let policy = RetryPolicy::exponential(3, Duration::from_secs(1), Duration::from_secs(30));
    let stamps = Mutex::new(VecDeque::new());
    let start = Instant::now();

    let outcome = run(&policy, "test", || {
      stamps.lock().push_back(start.elapsed());
      futures::future::ready(Err::<(), _>(server_error()))
    })
    .await;

    assert_eq!(outcome.attempts, 3);
    let stamps: Vec<Duration> = stamps.into_inner().into();
    assert_eq!(stamps[0], Duration::ZERO);
    assert!(stamps[1] >= Duration::from_secs(1));
    assert!(stamps[2] >= Duration::from_secs(3));
  }
}
