use std::collections::HashMap;
use std::sync::RwLock;

use coffer_core::StreamId;

use super::store::{EventStore, EventStoreError, StoredEvent, StreamBatch, UncommittedEvent};

/// In-memory append-only event store.
///
/// Intended for tests/dev. The whole store sits behind one lock, which makes
/// the multi-stream transaction trivially atomic.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<StreamId, Vec<StoredEvent>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_version(stream: &[StoredEvent]) -> u64 {
        stream.last().map(|e| e.sequence_number).unwrap_or(0)
    }

    /// Validate one batch against the current stream contents.
    ///
    /// Returns the batch's stream id; mutates nothing.
    fn check_batch(
        streams: &HashMap<StreamId, Vec<StoredEvent>>,
        batch: &StreamBatch,
    ) -> Result<StreamId, EventStoreError> {
        let first = batch.events.first().ok_or_else(|| {
            EventStoreError::InvalidTransaction("transaction contains an empty batch".to_string())
        })?;
        let stream_id = first.stream_id;
        let aggregate_type = &first.aggregate_type;

        for (idx, e) in batch.events.iter().enumerate() {
            if e.stream_id != stream_id {
                return Err(EventStoreError::InvalidAppend(format!(
                    "batch contains multiple stream_ids (index {idx})"
                )));
            }
            if &e.aggregate_type != aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "batch contains multiple aggregate_types (index {idx})"
                )));
            }
        }

        let stream = streams.get(&stream_id).map(Vec::as_slice).unwrap_or(&[]);
        let current = Self::current_version(stream);

        if !batch.expected_version.matches(current) {
            return Err(EventStoreError::Concurrency(format!(
                "stream {stream_id}: expected {:?}, found {current}",
                batch.expected_version
            )));
        }

        // Enforce aggregate type stability across the stream.
        if let Some(existing) = stream.first() {
            if &existing.aggregate_type != aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "stream aggregate_type is '{}', attempted append with '{}'",
                    existing.aggregate_type, aggregate_type
                )));
            }
        }

        Ok(stream_id)
    }
}

impl EventStore for InMemoryEventStore {
    fn append_transaction(
        &self,
        batches: Vec<StreamBatch>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let batches: Vec<StreamBatch> =
            batches.into_iter().filter(|b| !b.events.is_empty()).collect();
        if batches.is_empty() {
            return Ok(vec![]);
        }

        let mut streams = self
            .streams
            .write()
            .map_err(|_| EventStoreError::InvalidAppend("lock poisoned".to_string()))?;

        // Validate every batch before mutating anything (all-or-nothing).
        let mut touched: Vec<StreamId> = Vec::with_capacity(batches.len());
        for batch in &batches {
            let stream_id = Self::check_batch(&streams, batch)?;
            if touched.contains(&stream_id) {
                return Err(EventStoreError::InvalidTransaction(format!(
                    "stream {stream_id} appears in more than one batch"
                )));
            }
            touched.push(stream_id);
        }

        // Assign sequence numbers and append (append-only).
        let mut committed = Vec::new();
        for batch in batches {
            let stream_id = batch.events[0].stream_id;
            let stream = streams.entry(stream_id).or_default();
            let mut next = Self::current_version(stream) + 1;

            for e in batch.events {
                let stored = StoredEvent {
                    event_id: e.event_id,
                    stream_id: e.stream_id,
                    aggregate_type: e.aggregate_type,
                    sequence_number: next,
                    event_type: e.event_type,
                    event_version: e.event_version,
                    occurred_at: e.occurred_at,
                    payload: e.payload,
                };
                next += 1;
                stream.push(stored.clone());
                committed.push(stored);
            }
        }

        Ok(committed)
    }

    fn load_stream(&self, stream_id: StreamId) -> Result<Vec<StoredEvent>, EventStoreError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::InvalidAppend("lock poisoned".to_string()))?;

        Ok(streams.get(&stream_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use coffer_core::ExpectedVersion;
    use serde_json::json;
    use uuid::Uuid;

    fn event(stream_id: StreamId, aggregate_type: &str) -> UncommittedEvent {
        UncommittedEvent {
            event_id: Uuid::now_v7(),
            stream_id,
            aggregate_type: aggregate_type.to_string(),
            event_type: "test.event".to_string(),
            event_version: 1,
            occurred_at: Utc::now(),
            payload: json!({}),
        }
    }

    #[test]
    fn append_assigns_monotonic_sequence_numbers() {
        let store = InMemoryEventStore::new();
        let stream = StreamId::new();

        let first = store
            .append(vec![event(stream, "t"), event(stream, "t")], ExpectedVersion::Exact(0))
            .unwrap();
        assert_eq!(first[0].sequence_number, 1);
        assert_eq!(first[1].sequence_number, 2);

        let second = store
            .append(vec![event(stream, "t")], ExpectedVersion::Exact(2))
            .unwrap();
        assert_eq!(second[0].sequence_number, 3);
    }

    #[test]
    fn stale_expected_version_is_rejected() {
        let store = InMemoryEventStore::new();
        let stream = StreamId::new();

        store
            .append(vec![event(stream, "t")], ExpectedVersion::Exact(0))
            .unwrap();

        let err = store
            .append(vec![event(stream, "t")], ExpectedVersion::Exact(0))
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Concurrency(_)));
    }

    #[test]
    fn failed_transaction_mutates_no_stream() {
        let store = InMemoryEventStore::new();
        let a = StreamId::new();
        let b = StreamId::new();

        store
            .append(vec![event(b, "t")], ExpectedVersion::Exact(0))
            .unwrap();

        // Second batch carries a stale version; the first must not land.
        let err = store
            .append_transaction(vec![
                StreamBatch {
                    expected_version: ExpectedVersion::Exact(0),
                    events: vec![event(a, "t")],
                },
                StreamBatch {
                    expected_version: ExpectedVersion::Exact(0),
                    events: vec![event(b, "t")],
                },
            ])
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Concurrency(_)));

        assert!(store.load_stream(a).unwrap().is_empty());
        assert_eq!(store.load_stream(b).unwrap().len(), 1);
    }

    #[test]
    fn duplicate_stream_in_transaction_is_rejected() {
        let store = InMemoryEventStore::new();
        let stream = StreamId::new();

        let err = store
            .append_transaction(vec![
                StreamBatch {
                    expected_version: ExpectedVersion::Exact(0),
                    events: vec![event(stream, "t")],
                },
                StreamBatch {
                    expected_version: ExpectedVersion::Exact(0),
                    events: vec![event(stream, "t")],
                },
            ])
            .unwrap_err();
        assert!(matches!(err, EventStoreError::InvalidTransaction(_)));
        assert!(store.load_stream(stream).unwrap().is_empty());
    }

    #[test]
    fn aggregate_type_is_stable_per_stream() {
        let store = InMemoryEventStore::new();
        let stream = StreamId::new();

        store
            .append(vec![event(stream, "ledger.account")], ExpectedVersion::Exact(0))
            .unwrap();

        let err = store
            .append(vec![event(stream, "ledger.bank")], ExpectedVersion::Exact(1))
            .unwrap_err();
        assert!(matches!(err, EventStoreError::AggregateTypeMismatch(_)));
    }
}
