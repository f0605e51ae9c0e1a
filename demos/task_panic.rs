use batch_pool::{LimitedPool, PoolError};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();
  info!("--- Task Panic Example ---");

  let pool = LimitedPool::<String>::new(1, Handle::current(), "panic_pool");

  let should_panic = true;
  let panicking = pool.queue(move |_unit| async move {
    info!("Panicking Task: Starting...");
    tokio::time::sleep(Duration::from_millis(100)).await;
    if should_panic {
      info!("Panicking Task: About to panic!");
      panic!("This task is designed to panic!");
    }
    Ok("This will not be returned".to_string())
  });

  panicking.wait().await;
  match panicking.error() {
    Some(PoolError::Recovery { message, trace }) => {
      info!("Unit {} correctly resulted in a recovery error: {}", panicking.id(), message);
      info!("Captured {} bytes of stack trace.", trace.len());
    }
    other => info!("Unit {} resulted in unexpected outcome: {:?}", panicking.id(), other),
  }

  // The worker slot was replaced, so the pool keeps serving.
  let after = pool.queue(|_unit| async move { Ok("still serving".to_string()) });
  after.wait().await;
  info!("Follow-up unit {} returned {:?}", after.id(), after.value());

  info!("Closing pool.");
  pool.close();
  info!("--- Task Panic Example End ---");
}
