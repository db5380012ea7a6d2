//! Self-perpetuating interest accrual.
//!
//! Opening an account schedules the first accrual timer. Each firing
//! dispatches an `AccrueInterest` command and then schedules the next firing,
//! so the chain keeps itself alive without a central scheduler.
//!
//! Exactly-once effect under at-least-once delivery: firings carry a
//! sequence number the account aggregate deduplicates, and timer ids are
//! deterministic in `(account, sequence)` so a duplicate schedule of the same
//! firing is detected at the store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use coffer_bank::{
    ACCOUNT_AGGREGATE_TYPE, AccountCommand, AccountEvent, AccrueInterest, LedgerAccount,
    account_stream_id,
};
use coffer_core::AccountId;
use coffer_events::{EventBus, EventEnvelope, Projection};

use crate::dispatch::{CommandDispatcher, DispatchError};
use crate::event_store::EventStore;
use crate::timers::{
    RetryPolicy, Timer, TimerExecutor, TimerKind, TimerResult, TimerStore, TimerStoreError,
};

/// Interest accrual settings.
#[derive(Debug, Clone)]
pub struct InterestConfig {
    /// Base time unit of the accrual schedule. Each firing waits between one
    /// and four units.
    pub unit: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for InterestConfig {
    fn default() -> Self {
        Self {
            unit: Duration::from_secs(1),
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Units to wait before firing `sequence`.
///
/// Deterministic spread in 1..=4 so accounts opened together do not all fire
/// in the same instant forever.
fn accrual_delay_units(account_id: &AccountId, sequence: u64) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in account_id.as_str().bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(0x100_0000_01b3);
    }
    h ^= sequence;
    h = h.wrapping_mul(0x100_0000_01b3);
    1 + (h % 4)
}

fn accrual_timer(
    account_id: AccountId,
    sequence: u64,
    config: &InterestConfig,
) -> Timer {
    let units = accrual_delay_units(&account_id, sequence);
    let delay = config.unit.saturating_mul(units as u32);
    let due_at = Utc::now() + ChronoDuration::from_std(delay).unwrap_or(ChronoDuration::zero());
    Timer::new(
        TimerKind::InterestAccrual { account_id, sequence },
        due_at,
        config.retry_policy.clone(),
    )
}

fn schedule_firing<T: TimerStore>(
    timers: &T,
    account_id: AccountId,
    sequence: u64,
    config: &InterestConfig,
) -> Result<(), TimerStoreError> {
    match timers.schedule(accrual_timer(account_id.clone(), sequence, config)) {
        Ok(_) => {
            debug!(%account_id, sequence, "scheduled interest firing");
            Ok(())
        }
        // The chain already holds this firing.
        Err(TimerStoreError::AlreadyScheduled(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Projection that starts an account's accrual chain when it opens.
///
/// Applying the same `Opened` event twice schedules the same deterministic
/// timer twice, which the store collapses, so replays cannot fork the chain.
pub struct InterestScheduler<T> {
    timers: T,
    config: InterestConfig,
}

impl<T> InterestScheduler<T> {
    pub fn new(timers: T, config: InterestConfig) -> Self {
        Self { timers, config }
    }
}

impl<T> Projection<EventEnvelope<JsonValue>> for InterestScheduler<T>
where
    T: TimerStore,
{
    type Error = TimerStoreError;

    fn apply(&self, message: &EventEnvelope<JsonValue>) -> Result<(), Self::Error> {
        if message.aggregate_type() != ACCOUNT_AGGREGATE_TYPE {
            return Ok(());
        }

        let event: AccountEvent = match serde_json::from_value(message.payload().clone()) {
            Ok(event) => event,
            Err(e) => {
                return Err(TimerStoreError::Storage(format!(
                    "undecodable account event payload: {e}"
                )));
            }
        };

        if let AccountEvent::Opened { account_id, .. } = event {
            schedule_firing(&self.timers, account_id, 1, &self.config)?;
        }

        Ok(())
    }
}

/// Register the accrual handler on a timer executor.
///
/// Each firing dispatches `AccrueInterest` and, on success, schedules firing
/// `sequence + 1`. A concurrency conflict is a transient collision with a
/// customer command and retries shortly without consuming an attempt.
pub fn register_accrual_handler<S, B, T, X>(
    executor: &TimerExecutor<X>,
    dispatcher: Arc<CommandDispatcher<S, B>>,
    timers: T,
    config: InterestConfig,
) where
    S: EventStore + 'static,
    B: EventBus<EventEnvelope<JsonValue>> + 'static,
    T: TimerStore + Clone + Send + Sync + 'static,
    X: TimerStore,
{
    executor.register(
        "interest_accrual",
        Arc::new(move |timer: &Timer| {
            let TimerKind::InterestAccrual { account_id, sequence } = &timer.kind else {
                return TimerResult::Fail("wrong kind routed to accrual handler".into());
            };

            let command = AccountCommand::AccrueInterest(AccrueInterest {
                sequence: *sequence,
                occurred_at: Utc::now(),
            });

            let dispatched = dispatcher.dispatch::<LedgerAccount>(
                account_stream_id(account_id),
                ACCOUNT_AGGREGATE_TYPE,
                &command,
                |_| LedgerAccount::empty(account_id.clone()),
            );

            match dispatched {
                Ok(_) => {}
                Err(DispatchError::Concurrency(_)) => {
                    return TimerResult::RetryAfter(Duration::from_millis(10));
                }
                Err(e) => {
                    warn!(%account_id, sequence, error = %e, "interest firing failed");
                    return TimerResult::Fail(e.to_string());
                }
            }

            match schedule_firing(&timers, account_id.clone(), sequence + 1, &config) {
                Ok(()) => TimerResult::Done,
                Err(e) => TimerResult::Fail(format!("could not schedule next firing: {e}")),
            }
        }),
    );
}
