use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::types::{DeadLetterEntry, Timer, TimerId, TimerStats, TimerStatus};

#[derive(Debug, Error)]
pub enum TimerStoreError {
    /// A timer with this id already exists and has not dead-lettered.
    ///
    /// With deterministic ids this is the duplicate-schedule signal: the
    /// work is already queued (or already ran), so callers usually treat it
    /// as success.
    #[error("timer {0} is already scheduled")]
    AlreadyScheduled(TimerId),

    #[error("timer {0} not found")]
    NotFound(TimerId),

    #[error("timer storage failure: {0}")]
    Storage(String),
}

/// Persistence for timers.
///
/// `claim_due` atomically transitions due timers to `Running`, so two
/// executor threads polling the same store never claim the same timer.
pub trait TimerStore: Send + Sync {
    fn schedule(&self, timer: Timer) -> Result<TimerId, TimerStoreError>;

    fn get(&self, id: TimerId) -> Result<Option<Timer>, TimerStoreError>;

    fn update(&self, timer: Timer) -> Result<(), TimerStoreError>;

    /// Finish a timer: remove it from the live set.
    ///
    /// Finished timers are not retained (the accrual chain creates one timer
    /// per firing forever, so the live set must only hold pending work);
    /// completions are tallied in [`TimerStats::done`].
    fn complete(&self, id: TimerId) -> Result<(), TimerStoreError>;

    /// Claim up to `limit` due timers, marking them `Running`.
    fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Timer>, TimerStoreError>;

    fn dead_letter(&self, timer: Timer, reason: String) -> Result<(), TimerStoreError>;

    fn list_dead_letters(&self) -> Result<Vec<DeadLetterEntry>, TimerStoreError>;

    /// Move a dead-lettered timer back to `Scheduled` with a fresh attempt
    /// counter.
    fn retry_dead_letter(&self, id: TimerId) -> Result<(), TimerStoreError>;

    fn stats(&self) -> Result<TimerStats, TimerStoreError>;
}

impl<T> TimerStore for Arc<T>
where
    T: TimerStore + ?Sized,
{
    fn schedule(&self, timer: Timer) -> Result<TimerId, TimerStoreError> {
        (**self).schedule(timer)
    }

    fn get(&self, id: TimerId) -> Result<Option<Timer>, TimerStoreError> {
        (**self).get(id)
    }

    fn update(&self, timer: Timer) -> Result<(), TimerStoreError> {
        (**self).update(timer)
    }

    fn complete(&self, id: TimerId) -> Result<(), TimerStoreError> {
        (**self).complete(id)
    }

    fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Timer>, TimerStoreError> {
        (**self).claim_due(now, limit)
    }

    fn dead_letter(&self, timer: Timer, reason: String) -> Result<(), TimerStoreError> {
        (**self).dead_letter(timer, reason)
    }

    fn list_dead_letters(&self) -> Result<Vec<DeadLetterEntry>, TimerStoreError> {
        (**self).list_dead_letters()
    }

    fn retry_dead_letter(&self, id: TimerId) -> Result<(), TimerStoreError> {
        (**self).retry_dead_letter(id)
    }

    fn stats(&self) -> Result<TimerStats, TimerStoreError> {
        (**self).stats()
    }
}

#[derive(Debug, Default)]
struct Inner {
    timers: HashMap<TimerId, Timer>,
    dead_letters: Vec<DeadLetterEntry>,
    completed: usize,
}

/// In-memory timer store.
#[derive(Debug, Default)]
pub struct InMemoryTimerStore {
    inner: RwLock<Inner>,
}

impl InMemoryTimerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InMemoryTimerStore {
    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, TimerStoreError> {
        self.inner.write().map_err(|e| TimerStoreError::Storage(e.to_string()))
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, TimerStoreError> {
        self.inner.read().map_err(|e| TimerStoreError::Storage(e.to_string()))
    }
}

impl TimerStore for InMemoryTimerStore {
    fn schedule(&self, timer: Timer) -> Result<TimerId, TimerStoreError> {
        let mut inner = self.write()?;

        if let Some(existing) = inner.timers.get(&timer.id) {
            if existing.status != TimerStatus::DeadLettered {
                return Err(TimerStoreError::AlreadyScheduled(timer.id));
            }
        }

        let id = timer.id;
        inner.timers.insert(id, timer);
        Ok(id)
    }

    fn get(&self, id: TimerId) -> Result<Option<Timer>, TimerStoreError> {
        Ok(self.read()?.timers.get(&id).cloned())
    }

    fn update(&self, timer: Timer) -> Result<(), TimerStoreError> {
        let mut inner = self.write()?;
        if !inner.timers.contains_key(&timer.id) {
            return Err(TimerStoreError::NotFound(timer.id));
        }
        inner.timers.insert(timer.id, timer);
        Ok(())
    }

    fn complete(&self, id: TimerId) -> Result<(), TimerStoreError> {
        let mut inner = self.write()?;
        inner.timers.remove(&id).ok_or(TimerStoreError::NotFound(id))?;
        inner.completed += 1;
        Ok(())
    }

    fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Timer>, TimerStoreError> {
        let mut inner = self.write()?;

        let mut due: Vec<TimerId> = inner
            .timers
            .values()
            .filter(|t| t.status == TimerStatus::Scheduled && t.due_at <= now)
            .map(|t| t.id)
            .collect();
        // Earliest due first; id breaks ties for a stable order.
        due.sort_by_key(|id| {
            let t = &inner.timers[id];
            (t.due_at, t.id)
        });
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            let timer = inner.timers.get_mut(&id).ok_or(TimerStoreError::NotFound(id))?;
            timer.status = TimerStatus::Running;
            timer.attempt += 1;
            claimed.push(timer.clone());
        }
        Ok(claimed)
    }

    fn dead_letter(&self, mut timer: Timer, reason: String) -> Result<(), TimerStoreError> {
        let mut inner = self.write()?;

        timer.status = TimerStatus::DeadLettered;
        timer.last_error = Some(reason.clone());
        inner.timers.insert(timer.id, timer.clone());
        inner.dead_letters.push(DeadLetterEntry {
            timer,
            reason,
            dead_lettered_at: Utc::now(),
        });
        Ok(())
    }

    fn list_dead_letters(&self) -> Result<Vec<DeadLetterEntry>, TimerStoreError> {
        Ok(self.read()?.dead_letters.clone())
    }

    fn retry_dead_letter(&self, id: TimerId) -> Result<(), TimerStoreError> {
        let mut inner = self.write()?;

        let timer = inner.timers.get_mut(&id).ok_or(TimerStoreError::NotFound(id))?;
        if timer.status != TimerStatus::DeadLettered {
            return Err(TimerStoreError::Storage(format!(
                "timer {id} is not dead-lettered"
            )));
        }
        timer.status = TimerStatus::Scheduled;
        timer.attempt = 0;
        timer.due_at = Utc::now();
        timer.last_error = None;

        inner.dead_letters.retain(|entry| entry.timer.id != id);
        Ok(())
    }

    fn stats(&self) -> Result<TimerStats, TimerStoreError> {
        let inner = self.read()?;
        let mut stats = TimerStats {
            done: inner.completed,
            ..TimerStats::default()
        };
        for timer in inner.timers.values() {
            match timer.status {
                TimerStatus::Scheduled => stats.scheduled += 1,
                TimerStatus::Running => stats.running += 1,
                TimerStatus::DeadLettered => stats.dead_lettered += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use coffer_core::AccountId;

    use super::super::types::{RetryPolicy, TimerKind};
    use super::*;

    fn interest_timer(name: &str, sequence: u64, due_at: DateTime<Utc>) -> Timer {
        Timer::new(
            TimerKind::InterestAccrual {
                account_id: AccountId::new(name).unwrap(),
                sequence,
            },
            due_at,
            RetryPolicy::default(),
        )
    }

    #[test]
    fn duplicate_schedule_is_rejected() {
        let store = InMemoryTimerStore::new();
        let timer = interest_timer("alice", 1, Utc::now());

        store.schedule(timer.clone()).unwrap();
        let err = store.schedule(timer).unwrap_err();
        assert!(matches!(err, TimerStoreError::AlreadyScheduled(_)));
    }

    #[test]
    fn claim_due_skips_future_timers() {
        let store = InMemoryTimerStore::new();
        let now = Utc::now();

        store.schedule(interest_timer("alice", 1, now - ChronoDuration::seconds(1))).unwrap();
        store.schedule(interest_timer("bob", 1, now + ChronoDuration::seconds(60))).unwrap();

        let claimed = store.claim_due(now, 10).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, TimerStatus::Running);
        assert_eq!(claimed[0].attempt, 1);
    }

    #[test]
    fn claimed_timers_are_not_claimed_twice() {
        let store = InMemoryTimerStore::new();
        let now = Utc::now();
        store.schedule(interest_timer("alice", 1, now)).unwrap();

        assert_eq!(store.claim_due(now, 10).unwrap().len(), 1);
        assert!(store.claim_due(now, 10).unwrap().is_empty());
    }

    #[test]
    fn complete_removes_the_timer_from_the_live_set() {
        let store = InMemoryTimerStore::new();

        // One timer per firing, completed as it goes; the live set must not
        // retain history.
        for sequence in 1..=100u64 {
            let id = store.schedule(interest_timer("alice", sequence, Utc::now())).unwrap();
            store.claim_due(Utc::now(), 10).unwrap();
            store.complete(id).unwrap();
        }

        let stats = store.stats().unwrap();
        assert_eq!(stats.done, 100);
        assert_eq!(stats.scheduled + stats.running, 0);
        assert!(store.claim_due(Utc::now(), 1000).unwrap().is_empty());
    }

    #[test]
    fn dead_letter_then_retry_reschedules() {
        let store = InMemoryTimerStore::new();
        let timer = interest_timer("alice", 1, Utc::now());
        let id = store.schedule(timer.clone()).unwrap();

        store.dead_letter(timer, "boom".into()).unwrap();
        assert_eq!(store.list_dead_letters().unwrap().len(), 1);
        assert_eq!(store.stats().unwrap().dead_lettered, 1);

        store.retry_dead_letter(id).unwrap();
        assert!(store.list_dead_letters().unwrap().is_empty());

        let timer = store.get(id).unwrap().unwrap();
        assert_eq!(timer.status, TimerStatus::Scheduled);
        assert_eq!(timer.attempt, 0);
    }

    #[test]
    fn dead_lettered_id_can_be_rescheduled() {
        let store = InMemoryTimerStore::new();
        let timer = interest_timer("alice", 1, Utc::now());
        store.schedule(timer.clone()).unwrap();
        store.dead_letter(timer.clone(), "boom".into()).unwrap();

        // Same deterministic id is reusable once the old run dead-lettered.
        store.schedule(timer).unwrap();
    }
}
