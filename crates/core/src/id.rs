//! Strongly-typed identifiers used across the domain.

use core::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Fixed namespace for deriving stream ids from well-known names.
///
/// Derivation must be stable across releases: a retried sign-up for "alice"
/// has to address the same event stream as the first attempt.
const STREAM_NAMESPACE: Uuid = Uuid::from_u128(0x8b2f_41d6_0c5e_4a8f_9d31_7e06_52ab_c914);

/// Identifier of an event stream (one stream per entity instance).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(Uuid);

impl StreamId {
    /// Create a fresh identifier (UUIDv7, time-ordered).
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Derive a deterministic identifier from a well-known name (UUIDv5).
    pub fn from_name(name: &str) -> Self {
        Self(Uuid::new_v5(&STREAM_NAMESPACE, name.as_bytes()))
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for StreamId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for StreamId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<StreamId> for Uuid {
    fn from(value: StreamId) -> Self {
        value.0
    }
}

impl FromStr for StreamId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::from_str(s)
            .map_err(|e| DomainError::invalid_id(format!("StreamId: {e}")))?;
        Ok(Self(uuid))
    }
}

/// Identifier of a customer account (stable, human-assigned string).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    /// Validate and wrap a raw account id.
    ///
    /// Ids are non-empty, at most 128 bytes, and free of whitespace so they
    /// can double as stream-name components and email local parts.
    pub fn new(raw: impl Into<String>) -> Result<Self, DomainError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(DomainError::invalid_id("AccountId: must not be empty"));
        }
        if raw.len() > 128 {
            return Err(DomainError::invalid_id("AccountId: longer than 128 bytes"));
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(DomainError::invalid_id("AccountId: must not contain whitespace"));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for AccountId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AccountId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_from_name_is_deterministic() {
        assert_eq!(StreamId::from_name("account/alice"), StreamId::from_name("account/alice"));
        assert_ne!(StreamId::from_name("account/alice"), StreamId::from_name("account/bob"));
    }

    #[test]
    fn account_id_rejects_bad_input() {
        assert!(AccountId::new("").is_err());
        assert!(AccountId::new("has space").is_err());
        assert!(AccountId::new("a".repeat(200)).is_err());
        assert_eq!(AccountId::new("alice").unwrap().as_str(), "alice");
    }
}
