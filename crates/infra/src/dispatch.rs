//! Command execution pipeline (application-level orchestration).
//!
//! `CommandDispatcher` runs one aggregate through load → rehydrate → handle →
//! append → publish. `TransactionDispatcher` generalizes the same pipeline to
//! several entities: each participant is staged against its own stream, and a
//! single atomic multi-stream append is the only commit point, so a transfer
//! or sign-up either lands for every participant or for none — including
//! across restarts, since nothing is visible before the append.
//!
//! Events publish to the bus only after a successful append; publication is
//! at-least-once and consumers are idempotent.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use coffer_core::{Aggregate, DomainError, ExpectedVersion, StreamId};
use coffer_events::{EventBus, EventEnvelope};

use crate::event_store::{EventStore, EventStoreError, StoredEvent, StreamBatch, UncommittedEvent};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// A withdrawal would overdraw its account (domain, structured).
    #[error("insufficient funds: short by {shortfall}")]
    Overdraft { shortfall: u64 },

    /// Domain validation failure (deterministic).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Domain invariant failure (deterministic).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// Optimistic concurrency failure (stale stream version).
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    /// Domain-level not found.
    #[error("not found")]
    NotFound,

    /// Failed to deserialize historical payloads into the aggregate's event type.
    #[error("event deserialization failed: {0}")]
    Deserialize(String),

    /// Persisting to the event store failed.
    #[error("event store failure: {0}")]
    Store(EventStoreError),
}

impl From<EventStoreError> for DispatchError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency(msg) => DispatchError::Concurrency(msg),
            other => DispatchError::Store(other),
        }
    }
}

impl From<DomainError> for DispatchError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Overdraft { shortfall } => DispatchError::Overdraft { shortfall },
            DomainError::Validation(msg) => DispatchError::Validation(msg),
            DomainError::InvalidId(msg) => DispatchError::Validation(msg),
            DomainError::InvariantViolation(msg) => DispatchError::InvariantViolation(msg),
            DomainError::Conflict(msg) => DispatchError::Concurrency(msg),
            DomainError::NotFound => DispatchError::NotFound,
        }
    }
}

/// Reusable command execution engine for a single event-sourced aggregate.
///
/// Generic over store and bus so tests run against the in-memory backends and
/// production can swap in durable ones without touching domain code.
#[derive(Debug)]
pub struct CommandDispatcher<S, B> {
    store: S,
    bus: B,
}

impl<S, B> CommandDispatcher<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }
}

impl<S, B> CommandDispatcher<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Dispatch a command through the full pipeline.
    ///
    /// Loads the stream, rehydrates via `make_aggregate` + event replay,
    /// decides events, appends them with `ExpectedVersion::Exact` (optimistic
    /// concurrency: a concurrent writer makes this fail with
    /// [`DispatchError::Concurrency`] and the caller retries), then publishes
    /// the committed events.
    pub fn dispatch<A>(
        &self,
        stream_id: StreamId,
        aggregate_type: &str,
        command: &A::Command,
        make_aggregate: impl FnOnce(StreamId) -> A,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: coffer_events::Event + Serialize + DeserializeOwned,
    {
        let history = self.store.load_stream(stream_id)?;
        validate_loaded_stream(stream_id, &history)?;
        let expected = ExpectedVersion::Exact(stream_version(&history));

        let mut aggregate = make_aggregate(stream_id);
        apply_history::<A>(&mut aggregate, &history)?;

        let decided = aggregate.handle(command).map_err(DispatchError::from)?;
        if decided.is_empty() {
            return Ok(vec![]);
        }

        let uncommitted = decided
            .iter()
            .map(|ev| UncommittedEvent::from_typed(stream_id, aggregate_type, Uuid::now_v7(), ev))
            .collect::<Result<Vec<_>, _>>()?;

        let committed = self.store.append(uncommitted, expected)?;
        publish_committed(&self.bus, &committed);
        Ok(committed)
    }
}

/// Cross-entity transaction coordinator.
///
/// Usage: `begin()`, then `stage` each participant, then `commit()`.
#[derive(Debug)]
pub struct TransactionDispatcher<S, B> {
    store: S,
    bus: B,
}

impl<S, B> TransactionDispatcher<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }
}

impl<S, B> TransactionDispatcher<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn begin(&self) -> Transaction<'_, S, B> {
        Transaction {
            store: &self.store,
            bus: &self.bus,
            batches: Vec::new(),
            staged: Vec::new(),
        }
    }
}

/// An in-flight multi-entity transaction.
///
/// Staging rehydrates a participant and runs its commands, but nothing is
/// persisted or published until `commit`. The per-stream expected versions
/// captured at staging time make the commit abort if any participant moved
/// in between.
#[derive(Debug)]
pub struct Transaction<'a, S, B> {
    store: &'a S,
    bus: &'a B,
    batches: Vec<StreamBatch>,
    staged: Vec<StreamId>,
}

impl<S, B> Transaction<'_, S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Stage one participant: run `commands` against its rehydrated state.
    ///
    /// Returns the number of events staged for this participant. Zero means
    /// the commands were accepted but changed nothing (idempotent no-ops).
    pub fn stage<A>(
        &mut self,
        stream_id: StreamId,
        aggregate_type: &str,
        commands: &[A::Command],
        make_aggregate: impl FnOnce(StreamId) -> A,
    ) -> Result<usize, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: coffer_events::Event + Serialize + DeserializeOwned,
    {
        if self.staged.contains(&stream_id) {
            return Err(DispatchError::Validation(format!(
                "stream {stream_id} staged twice in one transaction"
            )));
        }
        self.staged.push(stream_id);

        let history = self.store.load_stream(stream_id)?;
        validate_loaded_stream(stream_id, &history)?;
        let expected = ExpectedVersion::Exact(stream_version(&history));

        let mut aggregate = make_aggregate(stream_id);
        apply_history::<A>(&mut aggregate, &history)?;

        let mut uncommitted = Vec::new();
        for command in commands {
            let decided = aggregate.handle(command).map_err(DispatchError::from)?;
            for ev in &decided {
                aggregate.apply(ev);
            }
            for ev in &decided {
                uncommitted.push(UncommittedEvent::from_typed(
                    stream_id,
                    aggregate_type,
                    Uuid::now_v7(),
                    ev,
                )?);
            }
        }

        let count = uncommitted.len();
        if count > 0 {
            self.batches.push(StreamBatch {
                expected_version: expected,
                events: uncommitted,
            });
        }
        Ok(count)
    }

    /// Commit every staged batch atomically, then publish.
    pub fn commit(self) -> Result<Vec<StoredEvent>, DispatchError> {
        if self.batches.is_empty() {
            return Ok(vec![]);
        }

        let committed = self.store.append_transaction(self.batches)?;
        publish_committed(self.bus, &committed);
        Ok(committed)
    }
}

/// Publish committed events to the bus.
///
/// The store is the source of truth; a publication failure cannot un-commit
/// the append, so it is logged and the operation still succeeds. Consumers
/// that miss a delivery catch up by replaying the stream.
fn publish_committed<B>(bus: &B, committed: &[StoredEvent])
where
    B: EventBus<EventEnvelope<JsonValue>>,
{
    for stored in committed {
        if let Err(e) = bus.publish(stored.to_envelope()) {
            warn!(
                stream_id = %stored.stream_id,
                sequence_number = stored.sequence_number,
                error = ?e,
                "event publication failed after commit"
            );
        }
    }
}

pub(crate) fn stream_version(stream: &[StoredEvent]) -> u64 {
    stream.last().map(|e| e.sequence_number).unwrap_or(0)
}

pub(crate) fn validate_loaded_stream(
    stream_id: StreamId,
    stream: &[StoredEvent],
) -> Result<(), DispatchError> {
    // Guard against a buggy backend returning foreign or disordered events.
    let mut last = 0u64;
    for (idx, e) in stream.iter().enumerate() {
        if e.stream_id != stream_id {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(format!(
                "loaded stream contains wrong stream_id at index {idx}"
            ))));
        }
        if e.sequence_number <= last {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(format!(
                "non-monotonic sequence_number in loaded stream (last={last}, found={})",
                e.sequence_number
            ))));
        }
        last = e.sequence_number;
    }
    Ok(())
}

pub(crate) fn apply_history<A>(aggregate: &mut A, history: &[StoredEvent]) -> Result<(), DispatchError>
where
    A: Aggregate,
    A::Event: DeserializeOwned,
{
    // Ensure deterministic ordering.
    let mut sorted = history.to_vec();
    sorted.sort_by_key(|e| e.sequence_number);

    for stored in sorted {
        let ev: A::Event = serde_json::from_value(stored.payload)
            .map_err(|e| DispatchError::Deserialize(e.to_string()))?;
        aggregate.apply(&ev);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use coffer_bank::{
        ACCOUNT_AGGREGATE_TYPE, AccountCommand, DepositFunds, LedgerAccount, OpenAccount,
        WithdrawFunds, account_stream_id,
    };
    use coffer_core::AccountId;
    use coffer_events::{EventEnvelope, InMemoryEventBus};

    use super::*;
    use crate::event_store::InMemoryEventStore;

    type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;

    fn setup() -> (Arc<InMemoryEventStore>, Bus) {
        (Arc::new(InMemoryEventStore::new()), Arc::new(InMemoryEventBus::new()))
    }

    fn account(name: &str) -> AccountId {
        AccountId::new(name).unwrap()
    }

    #[test]
    fn dispatch_persists_and_publishes() {
        let (store, bus) = setup();
        let sub = bus.subscribe();
        let dispatcher = CommandDispatcher::new(store.clone(), bus);

        let alice = account("alice");
        let stream = account_stream_id(&alice);

        let committed = dispatcher
            .dispatch::<LedgerAccount>(
                stream,
                ACCOUNT_AGGREGATE_TYPE,
                &AccountCommand::Open(OpenAccount { occurred_at: Utc::now() }),
                |_| LedgerAccount::empty(alice.clone()),
            )
            .unwrap();

        assert_eq!(committed.len(), 1);
        assert_eq!(store.load_stream(stream).unwrap().len(), 1);
        assert_eq!(sub.try_recv().unwrap().sequence_number(), 1);
    }

    struct DeadBus;

    impl EventBus<EventEnvelope<JsonValue>> for DeadBus {
        type Error = String;

        fn publish(&self, _message: EventEnvelope<JsonValue>) -> Result<(), Self::Error> {
            Err("bus unavailable".to_string())
        }

        fn subscribe(&self) -> coffer_events::Subscription<EventEnvelope<JsonValue>> {
            let (_tx, rx) = std::sync::mpsc::channel();
            coffer_events::Subscription::new(rx)
        }
    }

    #[test]
    fn publish_failure_does_not_fail_a_committed_dispatch() {
        let store = Arc::new(InMemoryEventStore::new());
        let dispatcher = CommandDispatcher::new(store.clone(), DeadBus);

        let alice = account("alice");
        let stream = account_stream_id(&alice);

        dispatcher
            .dispatch::<LedgerAccount>(
                stream,
                ACCOUNT_AGGREGATE_TYPE,
                &AccountCommand::Open(OpenAccount { occurred_at: Utc::now() }),
                |_| LedgerAccount::empty(alice.clone()),
            )
            .unwrap();

        // The append is the commit point; the event is durable.
        assert_eq!(store.load_stream(stream).unwrap().len(), 1);
    }

    #[test]
    fn no_op_command_appends_nothing() {
        let (store, bus) = setup();
        let dispatcher = CommandDispatcher::new(store.clone(), bus);

        let alice = account("alice");
        let stream = account_stream_id(&alice);
        let open = AccountCommand::Open(OpenAccount { occurred_at: Utc::now() });

        for _ in 0..2 {
            dispatcher
                .dispatch::<LedgerAccount>(stream, ACCOUNT_AGGREGATE_TYPE, &open, |_| {
                    LedgerAccount::empty(alice.clone())
                })
                .unwrap();
        }

        assert_eq!(store.load_stream(stream).unwrap().len(), 1);
    }

    #[test]
    fn failed_transaction_leaves_all_participants_untouched() {
        let (store, bus) = setup();
        let transactions = TransactionDispatcher::new(store.clone(), bus.clone());
        let dispatcher = CommandDispatcher::new(store.clone(), bus);

        let alice = account("alice");
        let bob = account("bob");
        for (id, amount) in [(&alice, 10u64)] {
            dispatcher
                .dispatch::<LedgerAccount>(
                    account_stream_id(id),
                    ACCOUNT_AGGREGATE_TYPE,
                    &AccountCommand::Open(OpenAccount { occurred_at: Utc::now() }),
                    |_| LedgerAccount::empty(id.clone()),
                )
                .unwrap();
            dispatcher
                .dispatch::<LedgerAccount>(
                    account_stream_id(id),
                    ACCOUNT_AGGREGATE_TYPE,
                    &AccountCommand::Deposit(DepositFunds { amount, occurred_at: Utc::now() }),
                    |_| LedgerAccount::empty(id.clone()),
                )
                .unwrap();
        }

        let mut txn = transactions.begin();
        let err = txn
            .stage::<LedgerAccount>(
                account_stream_id(&alice),
                ACCOUNT_AGGREGATE_TYPE,
                &[AccountCommand::Withdraw(WithdrawFunds { amount: 50, occurred_at: Utc::now() })],
                |_| LedgerAccount::empty(alice.clone()),
            )
            .unwrap_err();
        assert!(matches!(err, DispatchError::Overdraft { shortfall: 40 }));

        // Nothing committed for either party.
        assert_eq!(store.load_stream(account_stream_id(&alice)).unwrap().len(), 2);
        assert!(store.load_stream(account_stream_id(&bob)).unwrap().is_empty());
    }

    #[test]
    fn transaction_commits_both_streams_together() {
        let (store, bus) = setup();
        let transactions = TransactionDispatcher::new(store.clone(), bus);

        let alice = account("alice");
        let bob = account("bob");

        let mut txn = transactions.begin();
        for id in [&alice, &bob] {
            txn.stage::<LedgerAccount>(
                account_stream_id(id),
                ACCOUNT_AGGREGATE_TYPE,
                &[
                    AccountCommand::Open(OpenAccount { occurred_at: Utc::now() }),
                    AccountCommand::Deposit(DepositFunds { amount: 5, occurred_at: Utc::now() }),
                ],
                |_| LedgerAccount::empty(id.clone()),
            )
            .unwrap();
        }
        let committed = txn.commit().unwrap();

        assert_eq!(committed.len(), 4);
        assert_eq!(store.load_stream(account_stream_id(&alice)).unwrap().len(), 2);
        assert_eq!(store.load_stream(account_stream_id(&bob)).unwrap().len(), 2);
    }
}
