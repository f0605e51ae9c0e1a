use crate::task::QueuedWork;

use async_channel::{Receiver, Sender, TrySendError};
use std::fmt;

/// A bounded, multi-producer, multi-consumer queue of pending work.
///
/// Every worker holds its own clone of the consumer half, so no lock is taken
/// on the dequeue path. Closing the queue rejects further sends while keeping
/// already-buffered work available for draining.
pub(crate) struct WorkQueue<T> {
  tx: Sender<QueuedWork<T>>,
  rx: Receiver<QueuedWork<T>>,
}

impl<T> WorkQueue<T> {
  /// Creates a new `WorkQueue` holding at most `capacity` units.
  pub(crate) fn new(capacity: usize) -> Self {
    let (tx, rx) = async_channel::bounded(capacity.max(1));
    Self { tx, rx }
  }

  /// Splits the queue into its producer and consumer halves.
  pub(crate) fn split(self) -> (QueueProducer<T>, QueueConsumer<T>) {
    (QueueProducer { tx: self.tx }, QueueConsumer { rx: self.rx })
  }
}

/// Outcome of a non-blocking enqueue attempt.
pub(crate) enum TryEnqueue<T> {
  Queued,
  Full(QueuedWork<T>),
  Closed(QueuedWork<T>),
}

/// The producer handle. Cloned into every background enqueue.
pub(crate) struct QueueProducer<T> {
  tx: Sender<QueuedWork<T>>,
}

impl<T> Clone for QueueProducer<T> {
  fn clone(&self) -> Self {
    Self { tx: self.tx.clone() }
  }
}

impl<T> fmt::Debug for QueueProducer<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueProducer")
      .field("len", &self.len())
      .field("capacity", &self.tx.capacity())
      .field("closed", &self.is_closed())
      .finish()
  }
}

impl<T> QueueProducer<T> {
  /// Tries to enqueue without waiting for room.
  pub(crate) fn try_send(&self, work: QueuedWork<T>) -> TryEnqueue<T> {
    match self.tx.try_send(work) {
      Ok(()) => TryEnqueue::Queued,
      Err(TrySendError::Full(work)) => TryEnqueue::Full(work),
      Err(TrySendError::Closed(work)) => TryEnqueue::Closed(work),
    }
  }

  /// Enqueues, waiting for room if the queue is full.
  ///
  /// If the queue is closed before room frees up, the work is handed back so
  /// the caller can fail its unit.
  pub(crate) async fn send(&self, work: QueuedWork<T>) -> Result<(), QueuedWork<T>> {
    self.tx.send(work).await.map_err(|rejected| rejected.into_inner())
  }

  /// Closes the queue. Returns `true` if this call closed it.
  pub(crate) fn close(&self) -> bool {
    self.tx.close()
  }

  /// Returns `true` if the queue has been closed.
  pub(crate) fn is_closed(&self) -> bool {
    self.tx.is_closed()
  }

  /// Returns the number of units waiting in the queue.
  pub(crate) fn len(&self) -> usize {
    self.tx.len()
  }
}

/// The consumer handle. Each worker owns a clone.
pub(crate) struct QueueConsumer<T> {
  rx: Receiver<QueuedWork<T>>,
}

impl<T> Clone for QueueConsumer<T> {
  fn clone(&self) -> Self {
    Self { rx: self.rx.clone() }
  }
}

impl<T> fmt::Debug for QueueConsumer<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueConsumer").field("len", &self.rx.len()).finish()
  }
}

impl<T> QueueConsumer<T> {
  /// Receives the next unit. Returns `None` once the queue is closed and empty.
  pub(crate) async fn recv(&self) -> Option<QueuedWork<T>> {
    self.rx.recv().await.ok()
  }

  /// Removes every unit still buffered, without waiting for new ones.
  pub(crate) fn drain(&self) -> impl Iterator<Item = QueuedWork<T>> + '_ {
    std::iter::from_fn(move || self.rx.try_recv().ok())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::unit::WorkUnit;
  use std::time::Duration;
  use tokio::time::timeout;

  fn dummy_work(value: u64) -> QueuedWork<u64> {
    QueuedWork::new(WorkUnit::new(), move |_unit| async move { Ok(value) })
  }

  #[tokio::test]
  async fn test_queue_send_recv() {
    let (producer, consumer) = WorkQueue::<u64>::new(2).split();

    let work = dummy_work(1);
    let unit_id = work.unit.id();
    producer.send(work).await.ok().unwrap();
    assert_eq!(producer.len(), 1);

    let received = consumer.recv().await.unwrap();
    assert_eq!(received.unit.id(), unit_id);
    assert_eq!(received.into_future().await.unwrap(), 1);
    assert_eq!(producer.len(), 0);
  }

  #[tokio::test]
  async fn test_try_send_reports_full() {
    let (producer, _consumer) = WorkQueue::<u64>::new(1).split();

    assert!(matches!(producer.try_send(dummy_work(1)), TryEnqueue::Queued));
    assert!(matches!(producer.try_send(dummy_work(2)), TryEnqueue::Full(_)));
  }

  #[tokio::test]
  async fn test_full_queue_holds_sender_until_recv() {
    let (producer, consumer) = WorkQueue::<u64>::new(1).split();
    producer.send(dummy_work(1)).await.ok().unwrap();

    let pending = producer.send(dummy_work(2));
    tokio::pin!(pending);
    assert!(
      timeout(Duration::from_millis(40), &mut pending).await.is_err(),
      "a full queue must hold the sender back"
    );
    assert_eq!(producer.len(), 1);

    let first = consumer.recv().await.unwrap();
    assert_eq!(first.into_future().await.unwrap(), 1);
    assert!(matches!(timeout(Duration::from_millis(40), pending).await, Ok(Ok(()))));
    assert_eq!(producer.len(), 1);
  }

  #[tokio::test]
  async fn test_close_hands_back_pending_send() {
    let (producer, _consumer) = WorkQueue::<u64>::new(1).split();
    producer.send(dummy_work(1)).await.ok().unwrap();

    let blocked = {
      let producer = producer.clone();
      tokio::spawn(async move { producer.send(dummy_work(2)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(producer.close());
    assert!(!producer.close());
    let rejected = blocked.await.unwrap().err().expect("send should be rejected after close");
    assert!(!rejected.unit.is_done());
    assert!(matches!(producer.try_send(dummy_work(3)), TryEnqueue::Closed(_)));
  }

  #[tokio::test]
  async fn test_drain_after_close_returns_buffered_work() {
    let (producer, consumer) = WorkQueue::<u64>::new(4).split();
    for i in 0..3 {
      producer.send(dummy_work(i)).await.ok().unwrap();
    }
    producer.close();

    assert_eq!(consumer.drain().count(), 3);
    assert!(consumer.recv().await.is_none());
  }
}
