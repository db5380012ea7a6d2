//! Process-wide tracing setup.

mod tracing;

pub use tracing::{TracingConfig, init_tracing};
