//! Ledger daemon: wires the in-memory backends together and runs a short
//! demonstration workload.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use coffer_core::AccountId;
use coffer_events::{EventBus, EventEnvelope, InMemoryEventBus, Projection};
use coffer_infra::dispatch::CommandDispatcher;
use coffer_infra::event_store::InMemoryEventStore;
use coffer_infra::index::{AccountIndexProjection, InMemoryAccountIndex};
use coffer_infra::interest::{InterestConfig, InterestScheduler, register_accrual_handler};
use coffer_infra::notify::{
    InMemorySecretStore, NOTIFIER_CREDENTIAL_SECRET, NotifierConfig, RecordingNotifier, Secret,
};
use coffer_infra::service::BankService;
use coffer_infra::timers::{InMemoryTimerStore, TimerExecutor};
use coffer_observability::{TracingConfig, init_tracing};

fn main() -> Result<()> {
    init_tracing(&TracingConfig::default());

    let store = Arc::new(InMemoryEventStore::new());
    let bus = Arc::new(InMemoryEventBus::<EventEnvelope<JsonValue>>::new());
    let index = Arc::new(InMemoryAccountIndex::new());
    let timers = Arc::new(InMemoryTimerStore::new());

    let secrets = Arc::new(InMemorySecretStore::new());
    secrets.insert(NOTIFIER_CREDENTIAL_SECRET, Secret::new("demo-key"));
    let notifier = Arc::new(RecordingNotifier::new(secrets, NotifierConfig::default()));

    let service = BankService::new(store.clone(), bus.clone(), index.clone(), notifier.clone());
    service.create().context("bank bootstrap failed")?;

    // Background consumers: index maintenance and interest chain starts.
    let interest_config = InterestConfig {
        unit: Duration::from_millis(200),
        ..InterestConfig::default()
    };
    let subscription = bus.subscribe();
    let consumer = {
        let index_projection = AccountIndexProjection::new(index);
        let scheduler = InterestScheduler::new(timers.clone(), interest_config.clone());
        thread::spawn(move || {
            while let Ok(envelope) = subscription.recv() {
                if let Err(e) = index_projection.apply(&envelope) {
                    warn!(error = %e, "index projection failed");
                }
                if let Err(e) = scheduler.apply(&envelope) {
                    warn!(error = %e, "interest scheduling failed");
                }
            }
        })
    };

    let executor = Arc::new(TimerExecutor::new(timers.clone()));
    let dispatcher = Arc::new(CommandDispatcher::new(store, bus));
    register_accrual_handler(&executor, dispatcher, timers, interest_config);
    let executor_thread = executor.clone().spawn();

    // Demonstration workload.
    let alice = AccountId::new("alice")?;
    let bob = AccountId::new("bob")?;
    service.sign_up(&alice, 100).context("sign-up failed")?;
    service.sign_up(&bob, 25).context("sign-up failed")?;
    service.transfer(&alice, &bob, 40).context("transfer failed")?;

    // Let a few interest firings land.
    thread::sleep(Duration::from_secs(2));

    for balance in service.account_balances().context("balance report failed")? {
        info!(account = %balance.account_id, amount = balance.amount, "balance");
    }

    executor.shutdown();
    executor_thread
        .join()
        .map_err(|_| anyhow::anyhow!("timer executor panicked"))?;
    drop(service);
    // Detached; the process is exiting.
    drop(consumer);

    info!("done");
    Ok(())
}
