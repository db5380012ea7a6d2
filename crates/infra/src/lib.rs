//! Infrastructure layer: event store, dispatchers, timers, collaborators.
//!
//! Everything here is behind a trait; the in-memory implementations are the
//! tests/dev backends and the seams for real storage engines.

pub mod dispatch;
pub mod event_store;
pub mod index;
pub mod interest;
pub mod notify;
pub mod service;
pub mod timers;

#[cfg(test)]
mod integration_tests;
