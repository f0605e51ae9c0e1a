use batch_pool::LimitedPool;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();
  info!("--- Pool Shutdown Example ---");

  let pool = LimitedPool::<u64>::new(2, Handle::current(), "shutdown_pool");

  let units: Vec<_> = (0..8u64)
    .map(|i| {
      pool.queue(move |_unit| async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(i)
      })
    })
    .collect();

  tokio::time::sleep(Duration::from_millis(100)).await;
  info!("Queued {} units; {} still waiting. Cancelling pool.", units.len(), pool.queued_count());
  pool.cancel();

  for unit in &units {
    unit.wait().await;
    match unit.result() {
      Some(Ok(value)) => info!("Unit {} ran to completion with {}", unit.id(), value),
      Some(Err(e)) => info!("Unit {} was drained: {}", unit.id(), e),
      None => unreachable!("wait() returned before completion"),
    }
  }

  info!("Resetting pool.");
  pool.reset();
  let unit = pool.queue(|_unit| async move { Ok(42) });
  unit.wait().await;
  info!("Unit {} after reset returned {:?}", unit.id(), unit.value());

  pool.close();
  info!("--- Pool Shutdown Example End ---");
}
