use crate::error::BoxError;
use crate::unit::WorkUnit;

use std::future::Future;
use std::pin::Pin;

/// What a task body resolves to.
pub type TaskResult<T> = Result<T, BoxError>;

/// The boxed future a task body produces. It must be `Send` and `'static`.
pub type TaskToExecute<T> = Pin<Box<dyn Future<Output = TaskResult<T>> + Send + 'static>>;

pub(crate) type WorkFn<T> = Box<dyn FnOnce(WorkUnit<T>) -> TaskToExecute<T> + Send + 'static>;

/// Internal representation of a unit sitting in the pool's queue.
pub(crate) struct QueuedWork<T> {
  pub(crate) unit: WorkUnit<T>,
  pub(crate) func: WorkFn<T>,
}

impl<T: Send + Sync + 'static> QueuedWork<T> {
  pub(crate) fn new<F, Fut>(unit: WorkUnit<T>, func: F) -> Self
  where
    F: FnOnce(WorkUnit<T>) -> Fut + Send + 'static,
    Fut: Future<Output = TaskResult<T>> + Send + 'static,
  {
    Self {
      unit,
      func: Box::new(move |unit| -> TaskToExecute<T> { Box::pin(func(unit)) }),
    }
  }

  /// Turns the body into a future. The body itself is only invoked on first
  /// poll, so a panic in its synchronous prologue is caught with the rest.
  pub(crate) fn into_future(self) -> TaskToExecute<T> {
    let QueuedWork { unit, func } = self;
    Box::pin(async move { func(unit).await })
  }
}
