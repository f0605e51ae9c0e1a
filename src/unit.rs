use crate::error::PoolError;

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering as AtomicOrdering};
use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;
use tracing::trace;

lazy_static::lazy_static! {
  static ref NEXT_WORK_UNIT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

// One-way flags, each set at most once.
const CANCELLING: u8 = 0b001;
const CANCELLED: u8 = 0b010;
const WRITING: u8 = 0b100;

struct UnitInner<T> {
  id: u64,
  state: AtomicU8,
  outcome: OnceLock<Result<T, PoolError>>,
  // Used as a one-shot latch: cancelled exactly once, when `outcome` is set.
  done: CancellationToken,
}

/// A handle to a single unit of work queued on a [`LimitedPool`](crate::LimitedPool).
///
/// Handles are cheap to clone; every clone observes the same outcome. The
/// unit completes exactly once, either because its worker committed the
/// task's result or because a cancellation reached the unit first.
pub struct WorkUnit<T> {
  inner: Arc<UnitInner<T>>,
}

impl<T> Clone for WorkUnit<T> {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
    }
  }
}

impl<T> fmt::Debug for WorkUnit<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.inner.state.load(AtomicOrdering::Acquire);
    f.debug_struct("WorkUnit")
      .field("id", &self.inner.id)
      .field("done", &self.is_done())
      .field("cancelling", &(state & CANCELLING != 0))
      .field("cancelled", &(state & CANCELLED != 0))
      .field("writing", &(state & WRITING != 0))
      .finish()
  }
}

impl<T> WorkUnit<T> {
  pub(crate) fn new() -> Self {
    Self {
      inner: Arc::new(UnitInner {
        id: NEXT_WORK_UNIT_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed),
        state: AtomicU8::new(0),
        outcome: OnceLock::new(),
        done: CancellationToken::new(),
      }),
    }
  }

  /// Returns the process-unique ID of this unit.
  pub fn id(&self) -> u64 {
    self.inner.id
  }

  /// Waits until the unit has completed, successfully or not.
  ///
  /// Any number of callers may wait concurrently; all of them wake once the
  /// unit completes. Returns immediately if it already has.
  pub async fn wait(&self) {
    self.inner.done.cancelled().await
  }

  /// Returns `true` once a result or a cancellation has been committed.
  pub fn is_done(&self) -> bool {
    self.inner.done.is_cancelled()
  }

  /// The committed outcome, or `None` while the unit is still pending.
  pub fn result(&self) -> Option<&Result<T, PoolError>> {
    self.inner.outcome.get()
  }

  /// The value returned by the task, if it ran and succeeded.
  pub fn value(&self) -> Option<&T> {
    self.result().and_then(|outcome| outcome.as_ref().ok())
  }

  /// The error the unit completed with, if any.
  pub fn error(&self) -> Option<&PoolError> {
    self.result().and_then(|outcome| outcome.as_ref().err())
  }

  /// Cancels this unit unless it is already committed to writing its result.
  ///
  /// Calling this more than once, or after completion, has no further effect.
  pub fn cancel(&self) {
    self.cancel_with_error(PoolError::Cancelled);
  }

  /// Reports whether the unit ended up cancelled.
  ///
  /// This also commits the unit to writing: once it returns, no later
  /// cancellation can take effect. A task body may call it mid-run to learn
  /// whether it should stop, knowing its own result will not be overridden.
  pub fn is_cancelled(&self) -> bool {
    self.inner.state.fetch_or(WRITING, AtomicOrdering::AcqRel) & CANCELLED != 0
  }

  /// Returns `true` if cancellation has been requested, whether or not it won.
  /// Unlike [`is_cancelled`](Self::is_cancelled) this has no side effect.
  pub fn is_cancel_requested(&self) -> bool {
    self.inner.state.load(AtomicOrdering::Acquire) & CANCELLING != 0
  }

  /// Whether a cancellation has already won, without touching the writing flag.
  pub(crate) fn was_cancelled(&self) -> bool {
    self.inner.state.load(AtomicOrdering::Acquire) & CANCELLED != 0
  }

  /// Completes the unit with `err` unless it is already writing or cancelled.
  /// Returns `true` if this call won the race.
  pub(crate) fn cancel_with_error(&self, err: PoolError) -> bool {
    let mut current = self.inner.state.fetch_or(CANCELLING, AtomicOrdering::AcqRel) | CANCELLING;
    loop {
      if current & (WRITING | CANCELLED) != 0 {
        trace!(unit_id = %self.inner.id, "Cancel ignored: unit already committed or cancelled.");
        return false;
      }
      match self.inner.state.compare_exchange_weak(
        current,
        current | CANCELLED,
        AtomicOrdering::AcqRel,
        AtomicOrdering::Acquire,
      ) {
        Ok(_) => break,
        Err(actual) => current = actual,
      }
    }
    trace!(unit_id = %self.inner.id, error = %err, "Unit cancelled before commit.");
    self.finish(Err(err))
  }

  /// Fails a unit that will never reach a worker, such as one drained from a
  /// closed queue. Unlike [`cancel_with_error`](Self::cancel_with_error) this
  /// ignores `writing`, which a caller may have set through `is_cancelled`
  /// while the unit was still queued. Returns `true` if this call completed it.
  pub(crate) fn fail_unexecuted(&self, err: PoolError) -> bool {
    let previous = self.inner.state.fetch_or(CANCELLING | CANCELLED, AtomicOrdering::AcqRel);
    if previous & CANCELLED != 0 {
      return false;
    }
    trace!(unit_id = %self.inner.id, error = %err, "Unit failed without running.");
    self.finish(Err(err))
  }

  /// Marks the unit as writing and stores `outcome`, unless a cancellation
  /// already won. Returns `true` if the outcome was committed.
  pub(crate) fn commit(&self, outcome: Result<T, PoolError>) -> bool {
    if self.inner.state.fetch_or(WRITING, AtomicOrdering::AcqRel) & CANCELLED != 0 {
      return false;
    }
    self.finish(outcome)
  }

  fn finish(&self, outcome: Result<T, PoolError>) -> bool {
    if self.inner.outcome.set(outcome).is_err() {
      return false;
    }
    self.inner.done.cancel();
    true
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[tokio::test]
  async fn test_commit_delivers_value() {
    let unit = WorkUnit::<u32>::new();
    assert!(!unit.is_done());
    assert!(unit.result().is_none());

    assert!(unit.commit(Ok(42)));
    unit.wait().await;

    assert!(unit.is_done());
    assert_eq!(unit.value(), Some(&42));
    assert!(unit.error().is_none());
  }

  #[tokio::test]
  async fn test_cancel_before_commit_wins() {
    let unit = WorkUnit::<u32>::new();
    unit.cancel();
    unit.wait().await;

    assert!(!unit.commit(Ok(1)), "commit after cancellation must be discarded");
    assert!(unit.value().is_none());
    assert!(matches!(unit.error(), Some(PoolError::Cancelled)));
    assert!(unit.is_cancel_requested());
    assert!(unit.is_cancelled());
  }

  #[tokio::test]
  async fn test_cancel_after_commit_is_noop() {
    let unit = WorkUnit::<&'static str>::new();
    assert!(unit.commit(Ok("written")));

    unit.cancel();
    unit.cancel();

    assert_eq!(unit.value(), Some(&"written"));
    assert!(unit.is_cancel_requested());
    assert!(!unit.is_cancelled());
  }

  #[test]
  fn test_is_cancelled_forecloses_cancellation() {
    let unit = WorkUnit::<u32>::new();
    assert!(!unit.is_cancelled());

    assert!(!unit.cancel_with_error(PoolError::Cancelled));
    assert!(!unit.is_done(), "a foreclosed unit stays pending until its worker commits");

    assert!(unit.commit(Ok(5)));
    assert_eq!(unit.value(), Some(&5));
  }

  #[test]
  fn test_first_cancellation_error_sticks() {
    let unit = WorkUnit::<u32>::new();
    assert!(unit.cancel_with_error(PoolError::Closed));
    assert!(!unit.cancel_with_error(PoolError::Cancelled));
    assert!(matches!(unit.error(), Some(PoolError::Closed)));
  }

  #[test]
  fn test_fail_unexecuted_overrides_early_write_barrier() {
    let unit = WorkUnit::<u32>::new();
    assert!(!unit.is_cancelled());
    assert!(!unit.cancel_with_error(PoolError::Closed));

    assert!(unit.fail_unexecuted(PoolError::Closed));
    assert!(unit.is_done());
    assert!(matches!(unit.error(), Some(PoolError::Closed)));

    assert!(!unit.fail_unexecuted(PoolError::Cancelled));
    assert!(!unit.commit(Ok(3)));
    assert!(matches!(unit.error(), Some(PoolError::Closed)));
  }

  #[tokio::test]
  async fn test_multiple_waiters_all_wake() {
    let unit = WorkUnit::<u32>::new();
    let mut waiters = Vec::new();
    for _ in 0..4 {
      let unit = unit.clone();
      waiters.push(tokio::spawn(async move {
        unit.wait().await;
        unit.value().copied()
      }));
    }

    tokio::time::sleep(Duration::from_millis(20)).await;
    unit.commit(Ok(9));

    for waiter in waiters {
      assert_eq!(waiter.await.unwrap(), Some(9));
    }
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_commit_cancel_race_completes_exactly_once() {
    for _ in 0..200 {
      let unit = WorkUnit::<u32>::new();
      let committer = {
        let unit = unit.clone();
        tokio::spawn(async move { unit.commit(Ok(1)) })
      };
      let mut cancellers = Vec::new();
      for _ in 0..3 {
        let unit = unit.clone();
        cancellers.push(tokio::spawn(async move { unit.cancel_with_error(PoolError::Cancelled) }));
      }

      let mut winners = usize::from(committer.await.unwrap());
      for canceller in cancellers {
        winners += usize::from(canceller.await.unwrap());
      }

      assert_eq!(winners, 1, "exactly one side must complete the unit");
      tokio::time::timeout(Duration::from_secs(1), unit.wait())
        .await
        .expect("unit must complete once a side wins");
      match unit.result() {
        Some(Ok(1)) | Some(Err(PoolError::Cancelled)) => {}
        other => panic!("unexpected outcome {:?}", other),
      }
    }
  }
}
