//! Append-only event store boundary.
//!
//! Streams are keyed by `StreamId` (one per entity instance). A transaction
//! commits batches to several streams atomically, which is what makes a
//! partial transfer or sign-up structurally unreachable.

pub mod in_memory;
pub mod store;

pub use in_memory::InMemoryEventStore;
pub use store::{EventStore, EventStoreError, StoredEvent, StreamBatch, UncommittedEvent};
