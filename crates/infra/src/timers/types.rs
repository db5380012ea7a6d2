use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use coffer_core::AccountId;

/// Namespace for deterministic timer ids.
const TIMER_NAMESPACE: Uuid = Uuid::from_bytes([
    0x4b, 0x1f, 0x6c, 0x2d, 0x8a, 0x01, 0x4e, 0x59, 0x9b, 0x77, 0x3e, 0x12, 0xd4, 0x8f, 0xa6,
    0xc3,
]);

/// Timer identifier.
///
/// Built deterministically from the timer's kind, so scheduling "the same"
/// timer twice produces the same id and the store can detect the duplicate.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimerId(Uuid);

impl TimerId {
    pub fn from_kind(kind: &TimerKind) -> Self {
        let name = match kind {
            TimerKind::InterestAccrual { account_id, sequence } => {
                format!("interest/{account_id}/{sequence}")
            }
            TimerKind::Custom { kind } => format!("custom/{kind}/{}", Uuid::now_v7()),
        };
        Self(Uuid::new_v5(&TIMER_NAMESPACE, name.as_bytes()))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl core::fmt::Display for TimerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// What a timer does when it fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimerKind {
    /// One firing of an account's recurring interest chain.
    InterestAccrual { account_id: AccountId, sequence: u64 },

    /// Escape hatch for ad-hoc scheduled work.
    Custom { kind: String },
}

impl TimerKind {
    pub fn name(&self) -> &str {
        match self {
            TimerKind::InterestAccrual { .. } => "interest_accrual",
            TimerKind::Custom { kind } => kind,
        }
    }
}

/// Live states only; a finished timer is removed from the store and shows
/// up in [`TimerStats::done`] instead.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerStatus {
    Scheduled,
    Running,
    DeadLettered,
}

/// Outcome reported by a timer handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerResult {
    /// Completed; the timer is finished.
    Done,

    /// Failed permanently or transiently; the retry policy decides what
    /// happens next.
    Fail(String),

    /// Not ready yet; run again after the given delay without consuming a
    /// retry attempt.
    RetryAfter(Duration),
}

/// Backoff schedule for failed timers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Same delay between every attempt.
    Fixed { delay_ms: u64, max_attempts: u32 },

    /// Delay grows by `increment_ms` per attempt.
    Linear {
        base_ms: u64,
        increment_ms: u64,
        max_attempts: u32,
    },

    /// Delay doubles per attempt, capped at `cap_ms`.
    Exponential {
        base_ms: u64,
        cap_ms: u64,
        max_attempts: u32,
    },
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        match self {
            RetryPolicy::Fixed { max_attempts, .. }
            | RetryPolicy::Linear { max_attempts, .. }
            | RetryPolicy::Exponential { max_attempts, .. } => *max_attempts,
        }
    }

    /// Delay before the given attempt (1-based), or `None` when attempts are
    /// exhausted and the timer should dead-letter.
    ///
    /// A deterministic jitter derived from the timer id spreads retries of
    /// simultaneously-failed timers without relying on a RNG.
    pub fn delay_for(&self, attempt: u32, timer_id: TimerId) -> Option<Duration> {
        if attempt > self.max_attempts() {
            return None;
        }

        let base_ms = match self {
            RetryPolicy::Fixed { delay_ms, .. } => *delay_ms,
            RetryPolicy::Linear { base_ms, increment_ms, .. } => {
                base_ms.saturating_add(increment_ms.saturating_mul(attempt.saturating_sub(1) as u64))
            }
            RetryPolicy::Exponential { base_ms, cap_ms, .. } => {
                let shift = attempt.saturating_sub(1).min(32);
                base_ms.saturating_mul(1u64 << shift).min(*cap_ms)
            }
        };

        let jitter = (timer_id.as_uuid().as_u128() as u64 ^ attempt as u64) % (base_ms / 10 + 1);
        Some(Duration::from_millis(base_ms.saturating_add(jitter)))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Exponential {
            base_ms: 100,
            cap_ms: 30_000,
            max_attempts: 8,
        }
    }
}

/// A scheduled timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timer {
    pub id: TimerId,
    pub kind: TimerKind,
    pub status: TimerStatus,
    pub due_at: DateTime<Utc>,
    pub attempt: u32,
    pub retry_policy: RetryPolicy,
    pub scheduled_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl Timer {
    pub fn new(kind: TimerKind, due_at: DateTime<Utc>, retry_policy: RetryPolicy) -> Self {
        Self {
            id: TimerId::from_kind(&kind),
            kind,
            status: TimerStatus::Scheduled,
            due_at,
            attempt: 0,
            retry_policy,
            scheduled_at: Utc::now(),
            last_error: None,
        }
    }
}

/// A timer that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub timer: Timer,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Counters for monitoring.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerStats {
    pub scheduled: usize,
    pub running: usize,
    pub done: usize,
    pub dead_lettered: usize,
}
