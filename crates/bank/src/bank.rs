use std::collections::BTreeSet;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use coffer_core::{Aggregate, AggregateRoot, AccountId, DomainError, StreamId};
use coffer_events::Event;

/// Aggregate type tag stored on the bank stream.
pub const BANK_AGGREGATE_TYPE: &str = "ledger.bank";

/// The bank is a singleton with a distinguished, well-known stream.
pub fn bank_stream_id() -> StreamId {
    StreamId::from_name("bank")
}

/// Identifier of the bank's account index (assigned once, lazily).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountIndexId(Uuid);

impl AccountIndexId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for AccountIndexId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for AccountIndexId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Ordered account-index key: time-ordered, globally unique, sortable.
///
/// UUIDv7 gives millisecond time ordering; byte order equals time order, so
/// `Ord` on the wrapped uuid is sign-up order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndexKey(Uuid);

impl IndexKey {
    /// Allocate the next key.
    ///
    /// Keys must stay strictly increasing even when several sign-ups land in
    /// the same millisecond, so a process-wide high-water mark nudges
    /// colliding values forward. Keys are never reused.
    pub fn new() -> Self {
        static LAST: Mutex<u128> = Mutex::new(0);

        let candidate = Uuid::now_v7().as_u128();
        let mut last = LAST.lock().unwrap_or_else(|e| e.into_inner());
        let value = if candidate > *last { candidate } else { *last + 1 };
        *last = value;
        Self(Uuid::from_u128(value))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for IndexKey {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for IndexKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Aggregate root: the bank singleton.
///
/// Holds no balance of its own; it owns the account-index reference and the
/// authoritative record of which accounts have signed up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bank {
    id: StreamId,
    account_index_id: Option<AccountIndexId>,
    indexed: BTreeSet<AccountId>,
    version: u64,
}

impl Bank {
    /// Empty aggregate for rehydration.
    pub fn empty(id: StreamId) -> Self {
        Self {
            id,
            account_index_id: None,
            indexed: BTreeSet::new(),
            version: 0,
        }
    }

    pub fn account_index_id(&self) -> Option<AccountIndexId> {
        self.account_index_id
    }

    pub fn is_indexed(&self, account_id: &AccountId) -> bool {
        self.indexed.contains(account_id)
    }
}

impl AggregateRoot for Bank {
    type Id = StreamId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: one-time bootstrap; assigns the account index.
///
/// The candidate `index_id` is generated by the caller so that `handle`
/// stays deterministic; it is ignored when an index is already assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateBank {
    pub index_id: AccountIndexId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: record a completed sign-up in the account index.
///
/// `key` is the pre-allocated index key; `index_id` is the candidate used
/// only when the index has not yet been assigned (lazy initialization at
/// first need).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSignUp {
    pub key: IndexKey,
    pub account_id: AccountId,
    pub index_id: AccountIndexId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BankCommand {
    Create(CreateBank),
    RecordSignUp(RecordSignUp),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BankEvent {
    AccountIndexAssigned {
        index_id: AccountIndexId,
        occurred_at: DateTime<Utc>,
    },
    AccountIndexed {
        key: IndexKey,
        account_id: AccountId,
        occurred_at: DateTime<Utc>,
    },
}

impl Event for BankEvent {
    fn event_type(&self) -> &'static str {
        match self {
            BankEvent::AccountIndexAssigned { .. } => "ledger.bank.account_index_assigned",
            BankEvent::AccountIndexed { .. } => "ledger.bank.account_indexed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            BankEvent::AccountIndexAssigned { occurred_at, .. }
            | BankEvent::AccountIndexed { occurred_at, .. } => *occurred_at,
        }
    }
}

impl Aggregate for Bank {
    type Command = BankCommand;
    type Event = BankEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            BankEvent::AccountIndexAssigned { index_id, .. } => {
                if self.account_index_id.is_none() {
                    self.account_index_id = Some(*index_id);
                }
            }
            BankEvent::AccountIndexed { account_id, .. } => {
                self.indexed.insert(account_id.clone());
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            BankCommand::Create(cmd) => self.handle_create(cmd),
            BankCommand::RecordSignUp(cmd) => self.handle_record_sign_up(cmd),
        }
    }
}

impl Bank {
    fn handle_create(&self, cmd: &CreateBank) -> Result<Vec<BankEvent>, DomainError> {
        if self.account_index_id.is_some() {
            // Bootstrap may run on every start; a second create is a no-op.
            return Ok(vec![]);
        }

        Ok(vec![BankEvent::AccountIndexAssigned {
            index_id: cmd.index_id,
            occurred_at: cmd.occurred_at,
        }])
    }

    fn handle_record_sign_up(&self, cmd: &RecordSignUp) -> Result<Vec<BankEvent>, DomainError> {
        if self.indexed.contains(&cmd.account_id) {
            // Sign-up retry for an account that is already fully visible.
            return Ok(vec![]);
        }

        let mut events = Vec::with_capacity(2);
        if self.account_index_id.is_none() {
            events.push(BankEvent::AccountIndexAssigned {
                index_id: cmd.index_id,
                occurred_at: cmd.occurred_at,
            });
        }
        events.push(BankEvent::AccountIndexed {
            key: cmd.key,
            account_id: cmd.account_id.clone(),
            occurred_at: cmd.occurred_at,
        });

        Ok(events)
    }
}
