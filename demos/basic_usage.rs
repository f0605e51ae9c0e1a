use batch_pool::{LimitedPool, WorkUnit};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

async fn my_task_fn(id: usize, delay_ms: u64) -> String {
  info!("Task {} starting, will sleep for {}ms", id, delay_ms);
  tokio::time::sleep(Duration::from_millis(delay_ms)).await;
  let result = format!("Task {} finished successfully after {}ms", id, delay_ms);
  info!("{}", result);
  result
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false) // Disable module paths for cleaner example output
    .init();

  info!("--- Basic Usage Example ---");

  let pool = LimitedPool::<String>::new(2, Handle::current(), "basic_pool");

  let mut units: Vec<WorkUnit<String>> = Vec::new();
  for i in 0..5 {
    // Alternate sleep times for variety
    let sleep_duration: u64 = 500 + (i as u64 % 3 * 250);
    let unit = pool.queue(move |_unit| async move { Ok(my_task_fn(i, sleep_duration).await) });
    info!("Queued task {} as unit {}", i, unit.id());
    units.push(unit);
  }

  info!("All tasks queued. Awaiting results...");

  for unit in &units {
    unit.wait().await;
    match unit.result() {
      Some(Ok(result)) => info!("Result for unit {}: {}", unit.id(), result),
      Some(Err(e)) => info!("Error for unit {}: {}", unit.id(), e),
      None => unreachable!("wait() returned before completion"),
    }
  }

  info!("All results processed. Closing pool.");
  pool.close();
  info!("--- Basic Usage Example End ---");
}
