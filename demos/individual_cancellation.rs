use batch_pool::{LimitedPool, PoolError, WorkUnit};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{info, warn};

// Checks its unit between steps and stops early once cancellation is requested.
async fn example_task(unit: WorkUnit<String>, id_str: &str, steps: u64) -> Result<String, String> {
  info!("Task ({}) starting, {} steps of 100ms.", id_str, steps);
  for step in 0..steps {
    if unit.is_cancel_requested() {
      warn!("Task ({}) noticed a cancellation request at step {}.", id_str, step);
      return Err(format!("Task ({}) stopped early.", id_str));
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
  }
  Ok(format!("Task ({}) finished normally.", id_str))
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();
  info!("--- Individual Cancellation Example ---");

  let pool = LimitedPool::<String>::new(1, Handle::current(), "cancellation_pool");

  let running = pool.queue(|unit| async move { Ok(example_task(unit, "running", 20).await?) });
  let pending = pool.queue(|unit| async move { Ok(example_task(unit, "pending", 5).await?) });
  info!("Queued units {} (running) and {} (pending).", running.id(), pending.id());

  tokio::time::sleep(Duration::from_millis(500)).await;

  // The pending unit has not started, so it never runs.
  pending.cancel();
  // The running unit has not committed yet, so cancellation wins here too.
  running.cancel();

  for (label, unit) in [("pending", &pending), ("running", &running)] {
    unit.wait().await;
    match unit.error() {
      Some(PoolError::Cancelled) => info!("Unit {} ({}) correctly resulted in PoolError::Cancelled.", unit.id(), label),
      Some(e) => warn!("Unit {} ({}) resulted in unexpected error: {}", unit.id(), label, e),
      None => warn!("Unit {} ({}) completed with UNEXPECTED value: {:?}", unit.id(), label, unit.value()),
    }
  }

  info!("Closing pool.");
  pool.close();
  info!("--- Individual Cancellation Example End ---");
}
