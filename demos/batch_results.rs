use batch_pool::{LimitedPool, PoolError, WorkUnit};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{info, warn};

async fn send_mail(unit: WorkUnit<bool>, recipient: u64) -> bool {
  tokio::time::sleep(Duration::from_millis(200)).await;
  // Simulate a recipient that has to be aborted.
  if recipient == 17 {
    unit.cancel();
  }
  if unit.is_cancelled() {
    return false;
  }
  info!("Sent mail to recipient {}", recipient);
  true
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();
  info!("--- Batch Results Example ---");

  let pool = LimitedPool::<bool>::new(20, Handle::current(), "mail_pool");
  let batch = pool.batch();

  let producer = {
    let batch = batch.clone();
    tokio::spawn(async move {
      for recipient in 0..100 {
        batch.queue(move |unit| async move { Ok(send_mail(unit, recipient).await) });
      }
      batch.queue_complete();
    })
  };

  // Take the stream once, outside the receive loop.
  let mut results = batch.results().expect("results are taken only here");
  let deadline = tokio::time::sleep(Duration::from_secs(10));
  tokio::pin!(deadline);

  let mut sent = 0;
  loop {
    tokio::select! {
      _ = &mut deadline => {
        warn!("Batch timed out. Cancelling remaining units.");
        batch.cancel();
        break;
      }
      next = results.recv() => match next {
        Some(unit) => match unit.error() {
          None => sent += 1,
          Some(PoolError::Cancelled) => info!("Unit {} was cancelled.", unit.id()),
          Some(e) => warn!("Unit {} failed: {}", unit.id(), e),
        },
        None => {
          info!("Batch finished.");
          break;
        }
      },
    }
  }

  let _ = producer.await;
  info!("{} mails sent.", sent);
  pool.close();
  info!("--- Batch Results Example End ---");
}
