//! Account index read model.
//!
//! The index is an ordered map from [`IndexKey`] to account id. Keys are
//! time-ordered, so iterating the map in key order yields accounts in the
//! order their sign-ups committed. The projection that feeds the map is an
//! idempotent upsert keyed by `(key, account_id)`, so replaying or
//! double-delivering an event cannot produce a second entry.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

use coffer_bank::{BANK_AGGREGATE_TYPE, BankEvent, IndexKey};
use coffer_core::AccountId;
use coffer_events::{EventEnvelope, Projection};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index storage failure: {0}")]
    Storage(String),
}

/// One row of the account index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: IndexKey,
    pub account_id: AccountId,
}

/// Ordered key-range store holding the account index.
pub trait AccountIndex: Send + Sync {
    /// Insert entries. Re-inserting an existing pair is a no-op (upsert).
    fn insert(&self, entries: BTreeMap<IndexKey, AccountId>) -> Result<(), IndexError>;

    /// The first `limit` entries in ascending key order.
    fn range(&self, limit: usize) -> Result<Vec<IndexEntry>, IndexError>;

    fn len(&self) -> Result<usize, IndexError>;

    fn is_empty(&self) -> Result<bool, IndexError> {
        Ok(self.len()? == 0)
    }
}

impl<I> AccountIndex for Arc<I>
where
    I: AccountIndex + ?Sized,
{
    fn insert(&self, entries: BTreeMap<IndexKey, AccountId>) -> Result<(), IndexError> {
        (**self).insert(entries)
    }

    fn range(&self, limit: usize) -> Result<Vec<IndexEntry>, IndexError> {
        (**self).range(limit)
    }

    fn len(&self) -> Result<usize, IndexError> {
        (**self).len()
    }
}

/// In-memory index backed by a `BTreeMap` (keys iterate in sorted order).
#[derive(Debug, Default)]
pub struct InMemoryAccountIndex {
    entries: RwLock<BTreeMap<IndexKey, AccountId>>,
}

impl InMemoryAccountIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AccountIndex for InMemoryAccountIndex {
    fn insert(&self, entries: BTreeMap<IndexKey, AccountId>) -> Result<(), IndexError> {
        let mut map = self
            .entries
            .write()
            .map_err(|e| IndexError::Storage(e.to_string()))?;
        map.extend(entries);
        Ok(())
    }

    fn range(&self, limit: usize) -> Result<Vec<IndexEntry>, IndexError> {
        let map = self
            .entries
            .read()
            .map_err(|e| IndexError::Storage(e.to_string()))?;

        Ok(map
            .iter()
            .take(limit)
            .map(|(key, account_id)| IndexEntry {
                key: *key,
                account_id: account_id.clone(),
            })
            .collect())
    }

    fn len(&self) -> Result<usize, IndexError> {
        let map = self
            .entries
            .read()
            .map_err(|e| IndexError::Storage(e.to_string()))?;
        Ok(map.len())
    }
}

/// Projection that maintains the account index from committed bank events.
///
/// Safe to apply the same envelope more than once.
#[derive(Debug)]
pub struct AccountIndexProjection<I> {
    index: I,
}

impl<I> AccountIndexProjection<I> {
    pub fn new(index: I) -> Self {
        Self { index }
    }
}

impl<I> Projection<EventEnvelope<JsonValue>> for AccountIndexProjection<I>
where
    I: AccountIndex,
{
    type Error = IndexError;

    fn apply(&self, message: &EventEnvelope<JsonValue>) -> Result<(), Self::Error> {
        if message.aggregate_type() != BANK_AGGREGATE_TYPE {
            return Ok(());
        }

        let event: BankEvent = match serde_json::from_value(message.payload().clone()) {
            Ok(event) => event,
            Err(e) => {
                return Err(IndexError::Storage(format!(
                    "undecodable bank event payload: {e}"
                )));
            }
        };

        if let BankEvent::AccountIndexed { key, account_id, .. } = event {
            debug!(%account_id, "indexing account");
            self.index.insert(BTreeMap::from([(key, account_id)]))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(name: &str) -> AccountId {
        AccountId::new(name).unwrap()
    }

    fn one(key: IndexKey, name: &str) -> BTreeMap<IndexKey, AccountId> {
        BTreeMap::from([(key, account(name))])
    }

    #[test]
    fn range_returns_entries_in_key_order() {
        let index = InMemoryAccountIndex::new();

        let keys: Vec<IndexKey> = (0..5).map(|_| IndexKey::new()).collect();
        // Insert out of order.
        for i in [3usize, 0, 4, 1, 2] {
            index.insert(one(keys[i], &format!("acct{i}"))).unwrap();
        }

        let entries = index.range(10).unwrap();
        let scanned: Vec<IndexKey> = entries.iter().map(|e| e.key).collect();
        assert_eq!(scanned, keys);
    }

    #[test]
    fn range_caps_at_the_limit() {
        let index = InMemoryAccountIndex::new();

        let keys: Vec<IndexKey> = (0..6).map(|_| IndexKey::new()).collect();
        for (i, key) in keys.iter().enumerate() {
            index.insert(one(*key, &format!("acct{i}"))).unwrap();
        }

        let page = index.range(4).unwrap();
        assert_eq!(page.len(), 4);
        assert_eq!(page[0].key, keys[0]);
        assert_eq!(page[3].key, keys[3]);
    }

    #[test]
    fn insert_is_idempotent() {
        let index = InMemoryAccountIndex::new();
        let key = IndexKey::new();

        index.insert(one(key, "alice")).unwrap();
        index.insert(one(key, "alice")).unwrap();

        assert_eq!(index.len().unwrap(), 1);
    }
}
