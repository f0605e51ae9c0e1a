use crate::error::PoolError;
use crate::pool::LimitedPool;
use crate::task::TaskResult;
use crate::unit::WorkUnit;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, trace_span, Instrument};

lazy_static::lazy_static! {
  static ref NEXT_BATCH_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

struct BatchState<T> {
  units: Vec<WorkUnit<T>>,
  // Dropped on seal; the stream ends once this and every watcher's clone are gone.
  results_tx: Option<mpsc::UnboundedSender<WorkUnit<T>>>,
  sealed: bool,
}

struct BatchInner<T> {
  batch_id: u64,
  pool: LimitedPool<T>,
  state: Mutex<BatchState<T>>,
  results_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkUnit<T>>>>,
  outstanding: Arc<AtomicUsize>,
}

/// A group of units queued on one pool, with a shared result stream and a
/// single cancellation switch.
///
/// A batch is single use: once sealed by [`queue_complete`](Self::queue_complete)
/// or [`cancel`](Self::cancel), further calls to [`queue`](Self::queue) are ignored.
pub struct Batch<T> {
  inner: Arc<BatchInner<T>>,
}

impl<T> Clone for Batch<T> {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
    }
  }
}

impl<T> fmt::Debug for Batch<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.inner.state.lock();
    f.debug_struct("Batch")
      .field("id", &self.inner.batch_id)
      .field("pool", &self.inner.pool.name())
      .field("units", &state.units.len())
      .field("outstanding", &self.outstanding())
      .field("sealed", &state.sealed)
      .finish()
  }
}

impl<T: Send + Sync + 'static> Batch<T> {
  pub(crate) fn new(pool: LimitedPool<T>) -> Self {
    let (results_tx, results_rx) = mpsc::unbounded_channel();
    let batch_id = NEXT_BATCH_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
    debug!(pool_name = %pool.name(), batch_id, "Batch created.");

    Self {
      inner: Arc::new(BatchInner {
        batch_id,
        pool,
        state: Mutex::new(BatchState {
          units: Vec::new(),
          results_tx: Some(results_tx),
          sealed: false,
        }),
        results_rx: Mutex::new(Some(results_rx)),
        outstanding: Arc::new(AtomicUsize::new(0)),
      }),
    }
  }

  /// Queues `func` on the owning pool as part of this batch.
  ///
  /// Ignored once the batch is sealed.
  pub fn queue<F, Fut>(&self, func: F)
  where
    F: FnOnce(WorkUnit<T>) -> Fut + Send + 'static,
    Fut: Future<Output = TaskResult<T>> + Send + 'static,
  {
    let batch_id = self.inner.batch_id;
    let mut state = self.inner.state.lock();
    let results_tx = match (&state.results_tx, state.sealed) {
      (Some(tx), false) => tx.clone(),
      _ => {
        trace!(batch_id, "Queue ignored: batch is sealed.");
        return;
      }
    };

    let unit = self.inner.pool.queue(func);
    state.units.push(unit.clone());
    self.inner.outstanding.fetch_add(1, AtomicOrdering::AcqRel);
    drop(state);

    let outstanding = self.inner.outstanding.clone();
    let unit_id = unit.id();
    self.inner.pool.tokio_handle().spawn(
      async move {
        unit.wait().await;
        trace!("Unit completed. Republishing on batch results.");
        if results_tx.send(unit).is_err() {
          trace!("Batch results stream dropped. Completion not delivered.");
        }
        outstanding.fetch_sub(1, AtomicOrdering::AcqRel);
      }
      .instrument(trace_span!("batch_watcher", batch_id, unit_id)),
    );
  }

  /// Waits until every unit of this batch has completed.
  ///
  /// This drains the batch's results stream, so it fails with
  /// `PoolError::ResultsTaken` if [`results`](Self::results) was already
  /// called. It only returns once the batch is sealed.
  pub async fn wait_all(&self) -> Result<(), PoolError> {
    let mut results = self.results()?;
    while results.recv().await.is_some() {}
    Ok(())
  }
}

impl<T> Batch<T> {
  /// Seals the batch: no more units will be added, and the results stream
  /// ends once the ones already queued have completed.
  pub fn queue_complete(&self) {
    let mut state = self.inner.state.lock();
    if state.sealed {
      return;
    }
    state.sealed = true;
    state.results_tx = None;
    debug!(batch_id = self.inner.batch_id, units = state.units.len(), "Batch sealed.");
  }

  /// Seals the batch and cancels every unit queued through it, newest first.
  pub fn cancel(&self) {
    self.queue_complete();

    let state = self.inner.state.lock();
    for unit in state.units.iter().rev() {
      unit.cancel();
    }
    info!(batch_id = self.inner.batch_id, units = state.units.len(), "Batch cancelled.");
  }

  /// Takes the stream of this batch's units, each yielded once as it completes.
  ///
  /// The stream ends after the batch is sealed and all of its units are done.
  ///
  /// # Errors
  /// Returns `PoolError::ResultsTaken` if the stream was already taken.
  pub fn results(&self) -> Result<BatchResults<T>, PoolError> {
    self
      .inner
      .results_rx
      .lock()
      .take()
      .map(|rx| BatchResults { rx })
      .ok_or(PoolError::ResultsTaken)
  }

  pub fn id(&self) -> u64 {
    self.inner.batch_id
  }

  /// Number of units queued through this batch so far.
  pub fn len(&self) -> usize {
    self.inner.state.lock().units.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Units queued through this batch that have not been republished yet.
  pub fn outstanding(&self) -> usize {
    self.inner.outstanding.load(AtomicOrdering::Acquire)
  }

  pub fn is_sealed(&self) -> bool {
    self.inner.state.lock().sealed
  }
}

/// Completion-ordered stream of a batch's units.
pub struct BatchResults<T> {
  rx: mpsc::UnboundedReceiver<WorkUnit<T>>,
}

impl<T> fmt::Debug for BatchResults<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BatchResults").finish_non_exhaustive()
  }
}

impl<T> BatchResults<T> {
  /// Receives the next completed unit, or `None` once the batch is finished.
  pub async fn recv(&mut self) -> Option<WorkUnit<T>> {
    self.rx.recv().await
  }
}

impl<T> Stream for BatchResults<T> {
  type Item = WorkUnit<T>;

  fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    self.rx.poll_recv(cx)
  }
}
