use crate::batch::Batch;
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::fault;
use crate::task::{QueuedWork, TaskResult};
use crate::task_queue::{QueueConsumer, QueueProducer, TryEnqueue, WorkQueue};
use crate::unit::WorkUnit;

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Lifecycle state, replaced wholesale on `reset`.
struct PoolState<T> {
  producer: QueueProducer<T>,
  consumer: QueueConsumer<T>,
  shutdown_token: CancellationToken,
  closed: bool,
}

impl<T> PoolState<T> {
  fn open(queue_capacity: usize) -> Self {
    let (producer, consumer) = WorkQueue::new(queue_capacity).split();
    Self {
      producer,
      consumer,
      shutdown_token: CancellationToken::new(),
      closed: false,
    }
  }
}

struct PoolInner<T> {
  pool_name: Arc<String>,
  workers: usize,
  queue_capacity: usize,
  tokio_handle: TokioHandle,
  state: Mutex<PoolState<T>>,
}

/// A pool of a fixed number of workers executing queued units of work.
///
/// Cloning the pool is cheap and yields another handle to the same workers.
/// When the last handle is dropped the pool is closed as if by [`close`](Self::close).
pub struct LimitedPool<T> {
  inner: Arc<PoolInner<T>>,
}

impl<T> Clone for LimitedPool<T> {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
    }
  }
}

impl<T> fmt::Debug for LimitedPool<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.inner.state.lock();
    f.debug_struct("LimitedPool")
      .field("name", &*self.inner.pool_name)
      .field("workers", &self.inner.workers)
      .field("queue", &state.producer)
      .field("closed", &state.closed)
      .finish()
  }
}

impl<T: Send + Sync + 'static> LimitedPool<T> {
  /// Creates a pool with `workers` executors spawned on `tokio_handle`.
  ///
  /// # Panics
  /// Panics if `workers` is zero. Use [`with_config`](Self::with_config) to get
  /// an error instead.
  pub fn new(workers: usize, tokio_handle: TokioHandle, pool_name: &str) -> Self {
    match Self::with_config(PoolConfig::new(workers).with_name(pool_name), tokio_handle) {
      Ok(pool) => pool,
      Err(err) => panic!("invalid configuration for pool '{}': {}", pool_name, err),
    }
  }

  /// Creates a pool from `config`.
  ///
  /// # Errors
  /// Returns `PoolError::ZeroWorkers` if `config.workers` is zero.
  pub fn with_config(config: PoolConfig, tokio_handle: TokioHandle) -> Result<Self, PoolError> {
    config.validate()?;
    fault::install_trace_hook();

    let queue_capacity = config.effective_queue_capacity();
    let inner = Arc::new(PoolInner {
      pool_name: Arc::new(config.name),
      workers: config.workers,
      queue_capacity,
      tokio_handle,
      state: Mutex::new(PoolState::open(queue_capacity)),
    });

    {
      let state = inner.state.lock();
      inner.start_workers(&state);
    }
    info!(
      pool_name = %*inner.pool_name,
      workers = inner.workers,
      queue_capacity,
      "Pool started."
    );

    Ok(Self { inner })
  }

  /// Queues `func` to run on the pool and returns its unit immediately.
  ///
  /// This never waits: if the queue is full, the enqueue continues on a
  /// background task. If the pool is closed the returned unit has already
  /// completed with `PoolError::Closed`.
  pub fn queue<F, Fut>(&self, func: F) -> WorkUnit<T>
  where
    F: FnOnce(WorkUnit<T>) -> Fut + Send + 'static,
    Fut: Future<Output = TaskResult<T>> + Send + 'static,
  {
    let unit = WorkUnit::new();

    let producer = {
      let state = self.inner.state.lock();
      if state.closed {
        None
      } else {
        Some(state.producer.clone())
      }
    };
    let Some(producer) = producer else {
      warn!(pool_name = %*self.inner.pool_name, unit_id = %unit.id(), "Queue: pool is closed, failing unit.");
      unit.fail_unexecuted(PoolError::Closed);
      return unit;
    };

    match producer.try_send(QueuedWork::new(unit.clone(), func)) {
      TryEnqueue::Queued => {
        trace!(pool_name = %*self.inner.pool_name, unit_id = %unit.id(), "Unit queued.");
      }
      TryEnqueue::Closed(work) => {
        debug!(pool_name = %*self.inner.pool_name, unit_id = %unit.id(), "Queue: closed during enqueue, failing unit.");
        work.unit.fail_unexecuted(PoolError::Closed);
      }
      TryEnqueue::Full(work) => {
        trace!(pool_name = %*self.inner.pool_name, unit_id = %unit.id(), "Queue full. Deferring enqueue to background task.");
        let pool_name = self.inner.pool_name.clone();
        self.inner.tokio_handle.spawn(async move {
          if let Err(work) = producer.send(work).await {
            debug!(pool_name = %*pool_name, unit_id = %work.unit.id(), "Deferred enqueue rejected: pool closed.");
            work.unit.fail_unexecuted(PoolError::Closed);
          }
        });
      }
    }

    unit
  }

  /// Revives a closed pool with a fresh queue and a full set of workers.
  /// Does nothing while the pool is open.
  pub fn reset(&self) {
    let mut state = self.inner.state.lock();
    if !state.closed {
      trace!(pool_name = %*self.inner.pool_name, "Reset ignored: pool is still open.");
      return;
    }

    *state = PoolState::open(self.inner.queue_capacity);
    self.inner.start_workers(&state);
    info!(pool_name = %*self.inner.pool_name, workers = self.inner.workers, "Pool reset.");
  }

  /// Creates a new batch whose units run on this pool.
  pub fn batch(&self) -> Batch<T> {
    Batch::new(self.clone())
  }

  pub(crate) fn tokio_handle(&self) -> &TokioHandle {
    &self.inner.tokio_handle
  }
}

impl<T> LimitedPool<T> {
  /// Closes the pool, cancelling every unit still waiting in the queue with
  /// `PoolError::Cancelled`. Units already running are left to finish.
  pub fn cancel(&self) {
    let drained = self.inner.close_with_error(|| PoolError::Cancelled);
    debug!(pool_name = %*self.inner.pool_name, drained, "Pool cancelled.");
  }

  /// Closes the pool, failing every unit still waiting in the queue with
  /// `PoolError::Closed`. Units already running are left to finish.
  pub fn close(&self) {
    let drained = self.inner.close_with_error(|| PoolError::Closed);
    debug!(pool_name = %*self.inner.pool_name, drained, "Pool closed.");
  }

  pub fn name(&self) -> &str {
    &self.inner.pool_name
  }

  /// The configured worker count.
  pub fn workers(&self) -> usize {
    self.inner.workers
  }

  pub fn queue_capacity(&self) -> usize {
    self.inner.queue_capacity
  }

  /// Returns the number of units waiting in the queue.
  pub fn queued_count(&self) -> usize {
    self.inner.state.lock().producer.len()
  }

  pub fn is_closed(&self) -> bool {
    self.inner.state.lock().closed
  }
}

impl<T: Send + Sync + 'static> PoolInner<T> {
  fn start_workers(&self, state: &PoolState<T>) {
    let ctx = WorkerContext {
      pool_name: self.pool_name.clone(),
      consumer: state.consumer.clone(),
      shutdown_token: state.shutdown_token.clone(),
      tokio_handle: self.tokio_handle.clone(),
    };
    for worker_id in 0..self.workers {
      spawn_worker(ctx.clone(), worker_id);
    }
  }
}

impl<T> PoolInner<T> {
  /// Shuts the pool down and fails every still-queued unit with `make_error()`.
  /// Returns how many units were drained.
  fn close_with_error(&self, make_error: fn() -> PoolError) -> usize {
    let mut state = self.state.lock();

    if !state.closed {
      state.shutdown_token.cancel();
      state.producer.close();
      state.closed = true;
      info!(pool_name = %*self.pool_name, "Shutdown signal sent and work queue closed.");
    }

    let mut drained = 0;
    for work in state.consumer.drain() {
      trace!(pool_name = %*self.pool_name, unit_id = %work.unit.id(), "Draining queued unit.");
      work.unit.fail_unexecuted(make_error());
      drained += 1;
    }
    drained
  }
}

impl<T> Drop for PoolInner<T> {
  fn drop(&mut self) {
    if !self.state.get_mut().closed {
      info!(pool_name = %*self.pool_name, "LimitedPool dropped. Closing implicitly.");
      self.close_with_error(|| PoolError::Closed);
    } else {
      trace!(pool_name = %*self.pool_name, "Drop: pool already closed.");
    }
  }
}

/// Everything a worker needs; shared with its replacement after a panic.
struct WorkerContext<T> {
  pool_name: Arc<String>,
  consumer: QueueConsumer<T>,
  shutdown_token: CancellationToken,
  tokio_handle: TokioHandle,
}

impl<T> Clone for WorkerContext<T> {
  fn clone(&self) -> Self {
    Self {
      pool_name: self.pool_name.clone(),
      consumer: self.consumer.clone(),
      shutdown_token: self.shutdown_token.clone(),
      tokio_handle: self.tokio_handle.clone(),
    }
  }
}

fn spawn_worker<T: Send + Sync + 'static>(ctx: WorkerContext<T>, worker_id: usize) {
  let span = info_span!("limited_pool_worker", pool_name = %*ctx.pool_name, worker_id);
  let tokio_handle = ctx.tokio_handle.clone();
  tokio_handle.spawn(run_worker_loop(ctx, worker_id).instrument(span));
}

// Boxed because a panicking worker spawns its own replacement.
fn run_worker_loop<T: Send + Sync + 'static>(ctx: WorkerContext<T>, worker_id: usize) -> BoxFuture<'static, ()> {
  async move {
    trace!("Worker started.");

    loop {
      let work = tokio::select! {
        biased;

        _ = ctx.shutdown_token.cancelled() => {
          debug!("Shutdown signal received. Worker terminating.");
          break;
        }

        received = ctx.consumer.recv() => match received {
          Some(work) => work,
          None => {
            debug!("Work queue closed and empty. Worker terminating.");
            break;
          }
        },
      };

      let unit = work.unit.clone();
      if unit.was_cancelled() {
        trace!(unit_id = %unit.id(), "Dequeued unit already cancelled. Skipping.");
        continue;
      }

      trace!(unit_id = %unit.id(), "Executing unit.");
      match AssertUnwindSafe(fault::traced(work.into_future())).catch_unwind().await {
        Ok(result) => {
          if !unit.commit(result.map_err(PoolError::Task)) {
            debug!(unit_id = %unit.id(), "Unit was cancelled while running. Result discarded.");
          }
        }
        Err(payload) => {
          let recovery = fault::recovery_error(payload);
          error!(unit_id = %unit.id(), error = %recovery, "Unit panicked during execution. Replacing worker.");
          if !unit.commit(Err(recovery)) {
            warn!(unit_id = %unit.id(), "Panicked unit had already been cancelled.");
          }
          spawn_worker(ctx.clone(), worker_id);
          return;
        }
      }
    }
  }
  .boxed()
}
