//! End-to-end tests over the in-memory backends.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;

use coffer_bank::Balance;
use coffer_core::AccountId;
use coffer_events::{EventBus, EventEnvelope, InMemoryEventBus, Projection};

use crate::dispatch::CommandDispatcher;
use crate::event_store::InMemoryEventStore;
use crate::index::InMemoryAccountIndex;
use crate::interest::{InterestConfig, InterestScheduler, register_accrual_handler};
use crate::notify::{
    FailingNotifier, InMemorySecretStore, NOTIFIER_CREDENTIAL_SECRET, Notifier, NotifierConfig,
    RecordingNotifier, Secret,
};
use crate::service::{BankService, ServiceError};
use crate::timers::{InMemoryTimerStore, RetryPolicy, TimerExecutor};

type Store = Arc<InMemoryEventStore>;
type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;
type Service = BankService<Store, Bus>;

struct Harness {
    service: Service,
    store: Store,
    bus: Bus,
    notifier: Arc<RecordingNotifier<Arc<InMemorySecretStore>>>,
}

fn harness() -> Harness {
    let store: Store = Arc::new(InMemoryEventStore::new());
    let bus: Bus = Arc::new(InMemoryEventBus::new());

    let secrets = Arc::new(InMemorySecretStore::new());
    secrets.insert(NOTIFIER_CREDENTIAL_SECRET, Secret::new("test-key"));
    let notifier = Arc::new(RecordingNotifier::new(secrets, NotifierConfig::default()));

    let index = Arc::new(InMemoryAccountIndex::new());
    let service = BankService::new(store.clone(), bus.clone(), index, notifier.clone());
    service.create().unwrap();

    Harness { service, store, bus, notifier }
}

fn account(name: &str) -> AccountId {
    AccountId::new(name).unwrap()
}

#[test]
fn create_is_idempotent() {
    let h = harness();
    // First create already ran in the harness.
    h.service.create().unwrap();
    h.service.create().unwrap();
}

#[test]
fn sign_up_opens_deposits_and_notifies() {
    let h = harness();
    let alice = account("alice");

    h.service.sign_up(&alice, 100).unwrap();

    assert_eq!(h.service.balance(&alice).unwrap(), 100);
    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].account_id, alice);
}

#[test]
fn sign_up_retry_changes_nothing() {
    let h = harness();
    let alice = account("alice");

    h.service.sign_up(&alice, 100).unwrap();
    h.service.sign_up(&alice, 999).unwrap();

    assert_eq!(h.service.balance(&alice).unwrap(), 100);
    assert_eq!(h.service.account_balances().unwrap().len(), 1);
    // The retry sends no second welcome.
    assert_eq!(h.notifier.sent().len(), 1);
}

#[test]
fn notifier_failure_does_not_fail_sign_up() {
    let store: Store = Arc::new(InMemoryEventStore::new());
    let bus: Bus = Arc::new(InMemoryEventBus::new());
    let index = Arc::new(InMemoryAccountIndex::new());
    let notifier: Arc<dyn Notifier> = Arc::new(FailingNotifier);
    let service = BankService::new(store, bus, index, notifier);
    service.create().unwrap();

    let alice = account("alice");
    service.sign_up(&alice, 50).unwrap();
    assert_eq!(service.balance(&alice).unwrap(), 50);
}

#[test]
fn transfer_moves_funds_atomically() {
    let h = harness();
    let alice = account("alice");
    let bob = account("bob");
    h.service.sign_up(&alice, 100).unwrap();
    h.service.sign_up(&bob, 10).unwrap();

    h.service.transfer(&alice, &bob, 30).unwrap();

    assert_eq!(h.service.balance(&alice).unwrap(), 70);
    assert_eq!(h.service.balance(&bob).unwrap(), 40);
}

#[test]
fn overdrawn_transfer_reports_shortfall_and_changes_nothing() {
    let h = harness();
    let alice = account("alice");
    let bob = account("bob");
    h.service.sign_up(&alice, 10).unwrap();

    // Bob never signed up; the transfer aborts before touching him.
    let err = h.service.transfer(&alice, &bob, 50).unwrap_err();
    assert!(matches!(err, ServiceError::Overdraft { shortfall: 40 }));

    assert_eq!(h.service.balance(&alice).unwrap(), 10);
    assert_eq!(h.service.balance(&bob).unwrap(), 0);
}

#[test]
fn self_transfer_is_rejected() {
    let h = harness();
    let alice = account("alice");
    h.service.sign_up(&alice, 100).unwrap();

    let err = h.service.transfer(&alice, &alice, 10).unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));
    assert_eq!(h.service.balance(&alice).unwrap(), 100);
}

#[test]
fn balance_of_unknown_account_reads_as_zero() {
    let h = harness();
    assert_eq!(h.service.balance(&account("nobody")).unwrap(), 0);
}

#[test]
fn deposit_and_withdraw_round_trip() {
    let h = harness();
    let alice = account("alice");
    h.service.sign_up(&alice, 0).unwrap();

    h.service.deposit(&alice, 25).unwrap();
    h.service.withdraw(&alice, 10).unwrap();

    assert_eq!(h.service.balance(&alice).unwrap(), 15);
}

#[test]
fn account_balances_returns_the_first_page_in_sign_up_order() {
    let h = harness();

    // More accounts than one report page.
    let names: Vec<AccountId> = (0..40).map(|i| account(&format!("acct{i:02}"))).collect();
    for (i, name) in names.iter().enumerate() {
        h.service.sign_up(name, i as u64).unwrap();
    }

    let balances = h.service.account_balances().unwrap();
    assert_eq!(balances.len(), 32);
    for (i, Balance { account_id, amount }) in balances.iter().enumerate() {
        assert_eq!(account_id, &names[i]);
        assert_eq!(*amount, i as i64);
    }
}

#[test]
fn interest_accrues_and_the_chain_renews_itself() {
    let h = harness();
    let alice = account("alice");

    // Subscribe before signing up so the opened event is captured.
    let sub = h.bus.subscribe();
    h.service.sign_up(&alice, 0).unwrap();

    // Zero-length unit makes every firing due immediately.
    let config = InterestConfig {
        unit: Duration::ZERO,
        retry_policy: RetryPolicy::Fixed { delay_ms: 0, max_attempts: 3 },
    };

    let timers = Arc::new(InMemoryTimerStore::new());
    let scheduler = InterestScheduler::new(timers.clone(), config.clone());
    while let Ok(envelope) = sub.try_recv() {
        scheduler.apply(&envelope).unwrap();
    }

    let executor = TimerExecutor::new(timers.clone());
    let dispatcher = Arc::new(CommandDispatcher::new(h.store.clone(), h.bus.clone()));
    register_accrual_handler(&executor, dispatcher, timers, config);

    // Each tick fires one due accrual and schedules the next.
    for _ in 0..5 {
        assert_eq!(executor.tick().unwrap(), 1);
    }

    assert_eq!(h.service.balance(&alice).unwrap(), 5);
    assert!(executor.stats().unwrap().dead_lettered == 0);
}

#[test]
fn accrual_chain_retains_only_the_pending_firing() {
    let h = harness();
    let alice = account("alice");

    let sub = h.bus.subscribe();
    h.service.sign_up(&alice, 0).unwrap();

    let config = InterestConfig {
        unit: Duration::ZERO,
        retry_policy: RetryPolicy::Fixed { delay_ms: 0, max_attempts: 3 },
    };

    let timers = Arc::new(InMemoryTimerStore::new());
    let scheduler = InterestScheduler::new(timers.clone(), config.clone());
    while let Ok(envelope) = sub.try_recv() {
        scheduler.apply(&envelope).unwrap();
    }

    let executor = TimerExecutor::new(timers.clone());
    let dispatcher = Arc::new(CommandDispatcher::new(h.store.clone(), h.bus.clone()));
    register_accrual_handler(&executor, dispatcher, timers, config);

    // A long-running chain keeps exactly one live timer (the next firing);
    // past firings are not retained.
    for _ in 0..100 {
        executor.tick().unwrap();
    }

    let stats = executor.stats().unwrap();
    assert_eq!(stats.done, 100);
    assert_eq!(stats.scheduled + stats.running, 1);
    assert_eq!(h.service.balance(&alice).unwrap(), 100);
}

#[test]
fn duplicate_firing_delivery_accrues_once() {
    let h = harness();
    let alice = account("alice");
    h.service.sign_up(&alice, 0).unwrap();

    let dispatcher = CommandDispatcher::new(h.store.clone(), h.bus.clone());
    let command = coffer_bank::AccountCommand::AccrueInterest(coffer_bank::AccrueInterest {
        sequence: 1,
        occurred_at: chrono::Utc::now(),
    });

    for _ in 0..3 {
        dispatcher
            .dispatch::<coffer_bank::LedgerAccount>(
                coffer_bank::account_stream_id(&alice),
                coffer_bank::ACCOUNT_AGGREGATE_TYPE,
                &command,
                |_| coffer_bank::LedgerAccount::empty(alice.clone()),
            )
            .unwrap();
    }

    assert_eq!(h.service.balance(&alice).unwrap(), 1);
}
