//! A Tokio-based bounded worker pool with per-unit cancellation, panic
//! containment, and batches that deliver their units' results on one stream.

mod batch;
mod config;
mod error;
mod fault;
mod pool;
mod task;
mod task_queue;
mod unit;

pub use batch::{Batch, BatchResults};
pub use config::PoolConfig;
pub use error::{BoxError, PoolError};
pub use fault::MAX_TRACE_BYTES;
pub use pool::LimitedPool;
pub use task::{TaskResult, TaskToExecute};
pub use unit::WorkUnit;
