use thiserror::Error;

/// Boxed error returned by task bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur within the `batch_pool` pool.
#[derive(Error, Debug)]
pub enum PoolError {
  #[error("Work unit cancelled")]
  Cancelled,

  #[error("Work unit added or run after the pool had been closed or cancelled")]
  Closed,

  #[error("Work unit failed due to a recoverable panic: '{message}'\nStack trace:\n{trace}")]
  Recovery { message: String, trace: String },

  #[error("Work unit returned an error: {0}")]
  Task(BoxError),

  #[error("Pool must be configured with at least one worker")]
  ZeroWorkers,

  #[error("Batch results stream was already taken")]
  ResultsTaken,
}

impl PoolError {
  /// Wraps an arbitrary error returned by a task body.
  pub fn task<E: Into<BoxError>>(err: E) -> Self {
    PoolError::Task(err.into())
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(self, PoolError::Cancelled)
  }

  pub fn is_closed(&self) -> bool {
    matches!(self, PoolError::Closed)
  }

  pub fn is_recovery(&self) -> bool {
    matches!(self, PoolError::Recovery { .. })
  }
}
