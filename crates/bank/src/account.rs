use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use coffer_core::{Aggregate, AggregateRoot, AccountId, DomainError, StreamId, ValueObject};
use coffer_events::Event;

/// Aggregate type tag stored on every account stream.
pub const ACCOUNT_AGGREGATE_TYPE: &str = "ledger.account";

/// Amount credited per interest firing.
pub const INTEREST_AMOUNT: u64 = 1;

/// Derive the event stream for an account.
///
/// Deterministic so that a retried operation addresses the same stream as
/// the original attempt.
pub fn account_stream_id(account_id: &AccountId) -> StreamId {
    StreamId::from_name(&format!("account/{account_id}"))
}

/// Read-only balance snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub account_id: AccountId,
    pub amount: i64,
}

impl ValueObject for Balance {}

/// Aggregate root: a single customer account.
///
/// Balances only move through committed events, and `handle` refuses any
/// command that would take the balance below zero, so every reachable state
/// satisfies `balance >= 0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerAccount {
    id: AccountId,
    balance: i64,
    opened: bool,
    /// Highest interest firing applied so far (dedup under at-least-once
    /// timer delivery).
    interest_sequence: u64,
    version: u64,
}

impl LedgerAccount {
    /// Empty aggregate for rehydration.
    pub fn empty(id: AccountId) -> Self {
        Self {
            id,
            balance: 0,
            opened: false,
            interest_sequence: 0,
            version: 0,
        }
    }

    pub fn balance(&self) -> i64 {
        self.balance
    }

    pub fn is_opened(&self) -> bool {
        self.opened
    }

    pub fn interest_sequence(&self) -> u64 {
        self.interest_sequence
    }

    pub fn balance_snapshot(&self) -> Balance {
        Balance {
            account_id: self.id.clone(),
            amount: self.balance,
        }
    }
}

impl AggregateRoot for LedgerAccount {
    type Id = AccountId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: open the account (idempotent).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenAccount {
    pub occurred_at: DateTime<Utc>,
}

/// Command: credit the account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositFunds {
    pub amount: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: debit the account; refused if it would overdraw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawFunds {
    pub amount: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: apply one firing of the recurring interest chain.
///
/// `sequence` is the firing's position in the chain; firings already applied
/// are ignored, which makes redelivery of the same firing a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccrueInterest {
    pub sequence: u64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountCommand {
    Open(OpenAccount),
    Deposit(DepositFunds),
    Withdraw(WithdrawFunds),
    AccrueInterest(AccrueInterest),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountEvent {
    Opened {
        account_id: AccountId,
        occurred_at: DateTime<Utc>,
    },
    FundsDeposited {
        amount: u64,
        occurred_at: DateTime<Utc>,
    },
    FundsWithdrawn {
        amount: u64,
        occurred_at: DateTime<Utc>,
    },
    InterestAccrued {
        sequence: u64,
        amount: u64,
        occurred_at: DateTime<Utc>,
    },
}

impl Event for AccountEvent {
    fn event_type(&self) -> &'static str {
        match self {
            AccountEvent::Opened { .. } => "ledger.account.opened",
            AccountEvent::FundsDeposited { .. } => "ledger.account.funds_deposited",
            AccountEvent::FundsWithdrawn { .. } => "ledger.account.funds_withdrawn",
            AccountEvent::InterestAccrued { .. } => "ledger.account.interest_accrued",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            AccountEvent::Opened { occurred_at, .. }
            | AccountEvent::FundsDeposited { occurred_at, .. }
            | AccountEvent::FundsWithdrawn { occurred_at, .. }
            | AccountEvent::InterestAccrued { occurred_at, .. } => *occurred_at,
        }
    }
}

impl Aggregate for LedgerAccount {
    type Command = AccountCommand;
    type Event = AccountEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            AccountEvent::Opened { account_id, .. } => {
                self.id = account_id.clone();
                self.opened = true;
            }
            AccountEvent::FundsDeposited { amount, .. } => {
                self.balance += *amount as i64;
            }
            AccountEvent::FundsWithdrawn { amount, .. } => {
                self.balance -= *amount as i64;
            }
            AccountEvent::InterestAccrued { sequence, amount, .. } => {
                self.balance += *amount as i64;
                self.interest_sequence = self.interest_sequence.max(*sequence);
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            AccountCommand::Open(cmd) => self.handle_open(cmd),
            AccountCommand::Deposit(cmd) => self.handle_deposit(cmd),
            AccountCommand::Withdraw(cmd) => self.handle_withdraw(cmd),
            AccountCommand::AccrueInterest(cmd) => self.handle_accrue(cmd),
        }
    }
}

impl LedgerAccount {
    fn handle_open(&self, cmd: &OpenAccount) -> Result<Vec<AccountEvent>, DomainError> {
        if self.opened {
            // Already open: nothing to do, and no second accrual chain.
            return Ok(vec![]);
        }

        Ok(vec![AccountEvent::Opened {
            account_id: self.id.clone(),
            occurred_at: cmd.occurred_at,
        }])
    }

    fn handle_deposit(&self, cmd: &DepositFunds) -> Result<Vec<AccountEvent>, DomainError> {
        check_amount(cmd.amount)?;
        self.check_credit(cmd.amount)?;

        Ok(vec![AccountEvent::FundsDeposited {
            amount: cmd.amount,
            occurred_at: cmd.occurred_at,
        }])
    }

    fn handle_withdraw(&self, cmd: &WithdrawFunds) -> Result<Vec<AccountEvent>, DomainError> {
        check_amount(cmd.amount)?;

        let available = self.balance as u64;
        if cmd.amount > available {
            return Err(DomainError::overdraft(cmd.amount - available));
        }

        Ok(vec![AccountEvent::FundsWithdrawn {
            amount: cmd.amount,
            occurred_at: cmd.occurred_at,
        }])
    }

    fn handle_accrue(&self, cmd: &AccrueInterest) -> Result<Vec<AccountEvent>, DomainError> {
        if !self.opened {
            return Ok(vec![]);
        }
        if cmd.sequence <= self.interest_sequence {
            // Duplicate delivery of an already-applied firing.
            return Ok(vec![]);
        }
        self.check_credit(INTEREST_AMOUNT)?;

        Ok(vec![AccountEvent::InterestAccrued {
            sequence: cmd.sequence,
            amount: INTEREST_AMOUNT,
            occurred_at: cmd.occurred_at,
        }])
    }

    /// Refuse a credit that would push the balance past `i64::MAX`; `apply`
    /// must never be handed an event it cannot apply losslessly.
    fn check_credit(&self, amount: u64) -> Result<(), DomainError> {
        let headroom = (i64::MAX - self.balance) as u64;
        if amount > headroom {
            return Err(DomainError::validation("amount would overflow balance"));
        }
        Ok(())
    }
}

fn check_amount(amount: u64) -> Result<(), DomainError> {
    if amount == 0 {
        return Err(DomainError::validation("amount must be positive"));
    }
    if amount > i64::MAX as u64 {
        return Err(DomainError::validation("amount out of range"));
    }
    Ok(())
}
