//! Event-sourcing mechanics: events, envelopes, pub/sub, projections.
//!
//! Domain-agnostic plumbing only; business rules live in `coffer-bank`.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;
pub mod projection;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::InMemoryEventBus;
pub use projection::Projection;
