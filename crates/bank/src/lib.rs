//! Banking domain (event-sourced ledger of customer accounts).
//!
//! Pure domain logic only: no IO, no persistence concerns.

pub mod account;
pub mod bank;

pub use account::{
    ACCOUNT_AGGREGATE_TYPE, AccountCommand, AccountEvent, AccrueInterest, Balance, DepositFunds,
    LedgerAccount, OpenAccount, WithdrawFunds, account_stream_id,
};
pub use bank::{
    AccountIndexId, BANK_AGGREGATE_TYPE, Bank, BankCommand, BankEvent, CreateBank, IndexKey,
    RecordSignUp, bank_stream_id,
};
