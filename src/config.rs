use crate::error::PoolError;

/// Construction-time settings for a [`LimitedPool`](crate::LimitedPool).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
  /// Number of worker executors. Fixed for the lifetime of the pool.
  pub workers: usize,
  /// Queue capacity. `None` means twice the worker count.
  pub queue_capacity: Option<usize>,
  /// Name used in log fields.
  pub name: String,
}

impl PoolConfig {
  pub fn new(workers: usize) -> Self {
    Self {
      workers,
      queue_capacity: None,
      name: "limited_pool".to_string(),
    }
  }

  pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
    self.queue_capacity = Some(capacity);
    self
  }

  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }

  /// The capacity the pool's queue will be created with.
  pub fn effective_queue_capacity(&self) -> usize {
    self
      .queue_capacity
      .unwrap_or_else(|| self.workers.saturating_mul(2))
      .max(1)
  }

  pub fn validate(&self) -> Result<(), PoolError> {
    if self.workers == 0 {
      return Err(PoolError::ZeroWorkers);
    }
    Ok(())
  }
}
