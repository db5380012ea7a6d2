//! Durable timer substrate.
//!
//! Timers outlive process restarts: a scheduled timer sits in the store until
//! it comes due, and on restart the executor simply resumes polling the same
//! store. Delivery is at-least-once; handlers are expected to be idempotent.

mod executor;
mod store;
mod types;

pub use executor::{TimerExecutor, TimerHandler};
pub use store::{InMemoryTimerStore, TimerStore, TimerStoreError};
pub use types::{
    DeadLetterEntry, RetryPolicy, Timer, TimerId, TimerKind, TimerResult, TimerStats, TimerStatus,
};
