use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use coffer_core::{ExpectedVersion, StreamId};

/// An event ready to be appended to a stream (no sequence number yet).
///
/// The store assigns sequence numbers during append. Build one from a typed
/// domain event with [`UncommittedEvent::from_typed`], which serializes the
/// payload and captures the event metadata needed for later deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: Uuid,
    pub stream_id: StreamId,
    pub aggregate_type: String,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

/// A stored event in an append-only stream.
///
/// Sequence numbers are stream-scoped, start at 1, increase monotonically
/// and never change once assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub stream_id: StreamId,
    pub aggregate_type: String,

    /// Monotonically increasing position in the stream.
    pub sequence_number: u64,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl StoredEvent {
    pub fn stream_version(&self) -> u64 {
        self.sequence_number
    }

    /// Convert a stored event into an event envelope for publication.
    pub fn to_envelope(&self) -> coffer_events::EventEnvelope<JsonValue> {
        coffer_events::EventEnvelope::new(
            self.event_id,
            self.stream_id,
            self.aggregate_type.clone(),
            self.sequence_number,
            self.payload.clone(),
        )
    }
}

/// A batch of events destined for one stream, with its concurrency check.
#[derive(Debug, Clone)]
pub struct StreamBatch {
    pub expected_version: ExpectedVersion,
    pub events: Vec<UncommittedEvent>,
}

/// Event store operation error (infrastructure, not domain).
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("aggregate type mismatch: {0}")]
    AggregateTypeMismatch(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),
}

/// Append-only event store.
///
/// Implementations must:
/// - assign sequence numbers monotonically per stream (no gaps, no reuse)
/// - enforce optimistic concurrency against the current stream version
/// - keep `aggregate_type` stable across a stream's lifetime
/// - commit transactions atomically: every batch is validated against its
///   stream before any stream is mutated, and either all batches land or
///   none do
pub trait EventStore: Send + Sync {
    /// Append events to a single stream (append-only).
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.append_transaction(vec![StreamBatch {
            expected_version,
            events,
        }])
    }

    /// Atomically append batches to several streams (all-or-nothing).
    ///
    /// Returned events are ordered batch by batch, in input order.
    fn append_transaction(
        &self,
        batches: Vec<StreamBatch>,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Load the full stream for an entity.
    fn load_stream(&self, stream_id: StreamId) -> Result<Vec<StoredEvent>, EventStoreError>;
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn append_transaction(
        &self,
        batches: Vec<StreamBatch>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append_transaction(batches)
    }

    fn load_stream(&self, stream_id: StreamId) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_stream(stream_id)
    }
}

impl UncommittedEvent {
    /// Convenience constructor from a typed domain event.
    pub fn from_typed<E>(
        stream_id: StreamId,
        aggregate_type: impl Into<String>,
        event_id: Uuid,
        event: &E,
    ) -> Result<Self, EventStoreError>
    where
        E: coffer_events::Event + Serialize,
    {
        let payload = serde_json::to_value(event).map_err(|e| {
            EventStoreError::InvalidAppend(format!("payload serialization failed: {e}"))
        })?;

        Ok(Self {
            event_id,
            stream_id,
            aggregate_type: aggregate_type.into(),
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            occurred_at: event.occurred_at(),
            payload,
        })
    }
}
