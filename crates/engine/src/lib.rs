//! Dispatch core: fan-out, retries, status aggregation and the adapters behind it.

pub mod aggregator;
pub mod dispatch;
pub mod fanout;
pub mod idempotency;
pub mod inbox;
pub mod memory;
pub mod ports;
pub mod queue;
pub mod retention;
pub mod retry;
pub mod store;

pub use dispatch::{DispatchService, TaskOutcome};
pub use retry::RetryPolicy;
