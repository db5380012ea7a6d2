//! Application service: the operations callers actually invoke.
//!
//! `BankService` wires the dispatchers, the account index, and the notifier
//! into the public operations: bootstrap (`create`), `sign_up`, `transfer`,
//! `balance`, and the paginated `account_balances` report.

use std::sync::Arc;
use std::thread;

use chrono::Utc;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, instrument, warn};

use coffer_bank::{
    ACCOUNT_AGGREGATE_TYPE, AccountCommand, AccountIndexId, BANK_AGGREGATE_TYPE, Balance, Bank,
    BankCommand, CreateBank, DepositFunds, IndexKey, LedgerAccount, OpenAccount, RecordSignUp,
    WithdrawFunds, account_stream_id, bank_stream_id,
};
use coffer_core::AccountId;
use coffer_events::{EventBus, EventEnvelope, Projection};

use crate::dispatch::{
    CommandDispatcher, DispatchError, TransactionDispatcher, apply_history, validate_loaded_stream,
};
use crate::event_store::EventStore;
use crate::index::{AccountIndex, AccountIndexProjection, IndexError};
use crate::notify::{Notifier, WelcomeEmail};

/// Page size of the balance report fan-out.
pub const BALANCE_PAGE_SIZE: usize = 32;

/// Attempts per command before a concurrency conflict is surfaced.
const MAX_CONFLICT_RETRIES: usize = 8;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("insufficient funds: short by {shortfall}")]
    Overdraft { shortfall: u64 },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("account not found")]
    AccountNotFound,

    #[error("persistent concurrency conflict: {0}")]
    Contention(String),

    #[error("index failure: {0}")]
    Index(String),

    #[error("internal failure: {0}")]
    Internal(String),
}

impl From<DispatchError> for ServiceError {
    fn from(value: DispatchError) -> Self {
        match value {
            DispatchError::Overdraft { shortfall } => ServiceError::Overdraft { shortfall },
            DispatchError::Validation(msg) => ServiceError::Validation(msg),
            DispatchError::NotFound => ServiceError::AccountNotFound,
            DispatchError::Concurrency(msg) => ServiceError::Contention(msg),
            other => ServiceError::Internal(other.to_string()),
        }
    }
}

impl From<IndexError> for ServiceError {
    fn from(value: IndexError) -> Self {
        ServiceError::Index(value.to_string())
    }
}

/// The bank application service.
pub struct BankService<S, B> {
    store: S,
    commands: CommandDispatcher<S, B>,
    transactions: TransactionDispatcher<S, B>,
    index: Arc<dyn AccountIndex>,
    index_projection: AccountIndexProjection<Arc<dyn AccountIndex>>,
    notifier: Arc<dyn Notifier>,
}

impl<S, B> BankService<S, B>
where
    S: EventStore + Clone,
    B: EventBus<EventEnvelope<JsonValue>> + Clone,
{
    pub fn new(store: S, bus: B, index: Arc<dyn AccountIndex>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            commands: CommandDispatcher::new(store.clone(), bus.clone()),
            transactions: TransactionDispatcher::new(store.clone(), bus),
            store,
            index_projection: AccountIndexProjection::new(index.clone()),
            index,
            notifier,
        }
    }
}

impl<S, B> BankService<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Bootstrap the bank singleton. Safe to call on every start.
    #[instrument(skip(self))]
    pub fn create(&self) -> Result<(), ServiceError> {
        let command = BankCommand::Create(CreateBank {
            index_id: AccountIndexId::new(),
            occurred_at: Utc::now(),
        });

        let committed = self.retry_on_conflict(|| {
            self.commands.dispatch::<Bank>(
                bank_stream_id(),
                BANK_AGGREGATE_TYPE,
                &command,
                Bank::empty,
            )
        })?;

        if !committed.is_empty() {
            info!("bank created");
        }
        Ok(())
    }

    /// Sign up an account: open it, seed the initial deposit, and index it,
    /// in one atomic transaction. Retrying a completed sign-up is a no-op.
    ///
    /// The welcome email is best effort and never fails the sign-up.
    #[instrument(skip(self), fields(account = %account_id))]
    pub fn sign_up(&self, account_id: &AccountId, initial_deposit: u64) -> Result<(), ServiceError> {
        let committed = self.retry_on_conflict(|| {
            let now = Utc::now();
            let mut txn = self.transactions.begin();

            // The bank decides idempotency: zero staged events means this
            // account already signed up, and the retry must change nothing.
            let staged = txn.stage::<Bank>(
                bank_stream_id(),
                BANK_AGGREGATE_TYPE,
                &[BankCommand::RecordSignUp(RecordSignUp {
                    key: IndexKey::new(),
                    account_id: account_id.clone(),
                    index_id: AccountIndexId::new(),
                    occurred_at: now,
                })],
                Bank::empty,
            )?;
            if staged == 0 {
                return Ok(vec![]);
            }

            let mut account_commands = vec![AccountCommand::Open(OpenAccount { occurred_at: now })];
            if initial_deposit > 0 {
                account_commands.push(AccountCommand::Deposit(DepositFunds {
                    amount: initial_deposit,
                    occurred_at: now,
                }));
            }
            txn.stage::<LedgerAccount>(
                account_stream_id(account_id),
                ACCOUNT_AGGREGATE_TYPE,
                &account_commands,
                |_| LedgerAccount::empty(account_id.clone()),
            )?;

            txn.commit()
        })?;

        if committed.is_empty() {
            info!("sign-up retry ignored");
            return Ok(());
        }

        self.project_committed(&committed)?;
        info!(initial_deposit, "account signed up");

        let email = WelcomeEmail::for_account(account_id.clone());
        if let Err(e) = self.notifier.send_welcome(&email) {
            warn!(error = %e, "welcome email failed, continuing");
        }

        Ok(())
    }

    /// Move funds between two accounts atomically.
    ///
    /// Both legs commit together or neither does; an overdraft on the source
    /// aborts the whole transfer with the shortfall.
    #[instrument(skip(self), fields(from = %from, to = %to, amount))]
    pub fn transfer(&self, from: &AccountId, to: &AccountId, amount: u64) -> Result<(), ServiceError> {
        if from == to {
            return Err(ServiceError::Validation(
                "transfer source and destination must differ".into(),
            ));
        }

        let committed = self.retry_on_conflict(|| {
            let now = Utc::now();
            let mut txn = self.transactions.begin();

            txn.stage::<LedgerAccount>(
                account_stream_id(from),
                ACCOUNT_AGGREGATE_TYPE,
                &[AccountCommand::Withdraw(WithdrawFunds { amount, occurred_at: now })],
                |_| LedgerAccount::empty(from.clone()),
            )?;
            txn.stage::<LedgerAccount>(
                account_stream_id(to),
                ACCOUNT_AGGREGATE_TYPE,
                &[AccountCommand::Deposit(DepositFunds { amount, occurred_at: now })],
                |_| LedgerAccount::empty(to.clone()),
            )?;

            txn.commit()
        })?;

        self.project_committed(&committed)?;
        info!(amount, "transfer committed");
        Ok(())
    }

    /// Deposit into an account.
    #[instrument(skip(self), fields(account = %account_id, amount))]
    pub fn deposit(&self, account_id: &AccountId, amount: u64) -> Result<(), ServiceError> {
        let command = AccountCommand::Deposit(DepositFunds { amount, occurred_at: Utc::now() });
        self.retry_on_conflict(|| {
            self.commands.dispatch::<LedgerAccount>(
                account_stream_id(account_id),
                ACCOUNT_AGGREGATE_TYPE,
                &command,
                |_| LedgerAccount::empty(account_id.clone()),
            )
        })?;
        Ok(())
    }

    /// Withdraw from an account.
    #[instrument(skip(self), fields(account = %account_id, amount))]
    pub fn withdraw(&self, account_id: &AccountId, amount: u64) -> Result<(), ServiceError> {
        let command = AccountCommand::Withdraw(WithdrawFunds { amount, occurred_at: Utc::now() });
        self.retry_on_conflict(|| {
            self.commands.dispatch::<LedgerAccount>(
                account_stream_id(account_id),
                ACCOUNT_AGGREGATE_TYPE,
                &command,
                |_| LedgerAccount::empty(account_id.clone()),
            )
        })?;
        Ok(())
    }

    /// Current balance of one account. An account with no history reads as
    /// zero; this never fails on a missing account.
    pub fn balance(&self, account_id: &AccountId) -> Result<i64, ServiceError> {
        Ok(self.load_account(account_id)?.balance())
    }

    /// Balances of the first index page of accounts, in sign-up order.
    ///
    /// Reads one page of [`BALANCE_PAGE_SIZE`] entries in ascending key
    /// order and fans out the per-account reads. Any failed read fails the
    /// whole report.
    pub fn account_balances(&self) -> Result<Vec<Balance>, ServiceError> {
        let page = self.index.range(BALANCE_PAGE_SIZE)?;

        // Fan out; results keep index order.
        thread::scope(|scope| {
            let handles: Vec<_> = page
                .iter()
                .map(|entry| {
                    let account_id = entry.account_id.clone();
                    scope.spawn(move || self.balance_snapshot(&account_id))
                })
                .collect();

            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .map_err(|_| ServiceError::Internal("balance reader panicked".into()))?
                })
                .collect::<Result<Vec<Balance>, ServiceError>>()
        })
    }

    fn balance_snapshot(&self, account_id: &AccountId) -> Result<Balance, ServiceError> {
        let account = self.load_account(account_id)?;
        if !account.is_opened() {
            // Indexed but unopened would mean a torn sign-up.
            return Err(ServiceError::Internal(format!(
                "account {account_id} is indexed but not open"
            )));
        }
        Ok(account.balance_snapshot())
    }

    fn load_account(&self, account_id: &AccountId) -> Result<LedgerAccount, ServiceError> {
        let stream_id = account_stream_id(account_id);
        let history = self
            .store
            .load_stream(stream_id)
            .map_err(DispatchError::from)?;
        validate_loaded_stream(stream_id, &history)?;

        let mut account = LedgerAccount::empty(account_id.clone());
        apply_history::<LedgerAccount>(&mut account, &history)?;
        Ok(account)
    }

    /// Apply the index projection to just-committed events so the caller's
    /// next read observes its own sign-up. The bus delivers the same events
    /// to background consumers; the projection upsert is idempotent.
    fn project_committed(
        &self,
        committed: &[crate::event_store::StoredEvent],
    ) -> Result<(), ServiceError> {
        for stored in committed {
            self.index_projection.apply(&stored.to_envelope())?;
        }
        Ok(())
    }

    fn retry_on_conflict<T>(
        &self,
        mut op: impl FnMut() -> Result<T, DispatchError>,
    ) -> Result<T, ServiceError> {
        let mut last = None;
        for _ in 0..MAX_CONFLICT_RETRIES {
            match op() {
                Err(DispatchError::Concurrency(msg)) => last = Some(msg),
                other => return other.map_err(ServiceError::from),
            }
        }
        Err(ServiceError::Contention(last.unwrap_or_default()))
    }
}
