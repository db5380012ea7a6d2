use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, error, info, warn};

use super::store::{TimerStore, TimerStoreError};
use super::types::{Timer, TimerResult, TimerStats, TimerStatus};

/// Handler invoked when a timer of a given kind fires.
///
/// Delivery is at-least-once; handlers must tolerate redelivery.
pub type TimerHandler = Arc<dyn Fn(&Timer) -> TimerResult + Send + Sync>;

/// Polls the timer store and runs due timers.
///
/// One handler per kind name (see `TimerKind::name`). A timer with no
/// registered handler fails and goes through its retry policy, so registering
/// the handler late does not lose the timer.
pub struct TimerExecutor<S> {
    store: S,
    handlers: Mutex<HashMap<String, TimerHandler>>,
    poll_interval: Duration,
    batch_size: usize,
    shutdown: AtomicBool,
}

impl<S> TimerExecutor<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            handlers: Mutex::new(HashMap::new()),
            poll_interval: Duration::from_millis(50),
            batch_size: 16,
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn register(&self, kind: impl Into<String>, handler: TimerHandler) {
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(kind.into(), handler);
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

impl<S> TimerExecutor<S>
where
    S: TimerStore,
{
    /// Run one poll cycle: claim due timers and execute each.
    ///
    /// Returns the number of timers executed. Tests drive this directly
    /// instead of spawning the poll loop.
    pub fn tick(&self) -> Result<usize, TimerStoreError> {
        let claimed = self.store.claim_due(Utc::now(), self.batch_size)?;
        let count = claimed.len();
        for timer in claimed {
            self.execute_one(timer)?;
        }
        Ok(count)
    }

    /// Execute a single claimed timer and persist the outcome.
    pub fn execute_one(&self, timer: Timer) -> Result<(), TimerStoreError> {
        let handler = {
            let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            handlers.get(timer.kind.name()).cloned()
        };

        let result = match handler {
            Some(handler) => {
                // A panicking handler must not kill the poll loop or strand
                // the timer in `Running`.
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(&timer)))
                    .unwrap_or_else(|panic| {
                        let msg = panic
                            .downcast_ref::<&str>()
                            .map(|s| (*s).to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "handler panicked".to_string());
                        TimerResult::Fail(format!("handler panicked: {msg}"))
                    })
            }
            None => TimerResult::Fail(format!("no handler for kind {}", timer.kind.name())),
        };

        match result {
            TimerResult::Done => {
                debug!(timer_id = %timer.id, kind = timer.kind.name(), "timer done");
                self.store.complete(timer.id)
            }
            TimerResult::RetryAfter(delay) => {
                let mut timer = timer;
                timer.status = TimerStatus::Scheduled;
                timer.due_at = Utc::now()
                    + ChronoDuration::from_std(delay).unwrap_or(ChronoDuration::zero());
                // Not a failure; the attempt is handed back.
                timer.attempt = timer.attempt.saturating_sub(1);
                self.store.update(timer)
            }
            TimerResult::Fail(reason) => self.handle_failure(timer, reason),
        }
    }

    fn handle_failure(&self, mut timer: Timer, reason: String) -> Result<(), TimerStoreError> {
        match timer.retry_policy.delay_for(timer.attempt + 1, timer.id) {
            Some(delay) => {
                warn!(
                    timer_id = %timer.id,
                    kind = timer.kind.name(),
                    attempt = timer.attempt,
                    %reason,
                    retry_in_ms = delay.as_millis() as u64,
                    "timer failed, will retry"
                );
                timer.status = TimerStatus::Scheduled;
                timer.due_at = Utc::now()
                    + ChronoDuration::from_std(delay).unwrap_or(ChronoDuration::zero());
                timer.last_error = Some(reason);
                self.store.update(timer)
            }
            None => {
                error!(
                    timer_id = %timer.id,
                    kind = timer.kind.name(),
                    attempt = timer.attempt,
                    %reason,
                    "timer exhausted retries, dead-lettering"
                );
                self.store.dead_letter(timer, reason)
            }
        }
    }

    pub fn stats(&self) -> Result<TimerStats, TimerStoreError> {
        self.store.stats()
    }
}

impl<S> TimerExecutor<S>
where
    S: TimerStore + 'static,
{
    /// Spawn the poll loop on a background thread.
    ///
    /// The loop runs until [`TimerExecutor::shutdown`] is called, then drains
    /// one final tick and exits.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        thread::spawn(move || {
            info!(poll_ms = self.poll_interval.as_millis() as u64, "timer executor started");
            while !self.shutdown.load(Ordering::SeqCst) {
                match self.tick() {
                    Ok(0) => thread::sleep(self.poll_interval),
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "timer poll cycle failed");
                        thread::sleep(self.poll_interval);
                    }
                }
            }
            if let Err(e) = self.tick() {
                error!(error = %e, "final timer drain failed");
            }
            info!("timer executor stopped");
        })
    }
}
