//! arb-ledger: points ledger for the research dataset marketplace
//!
//! Participants earn points for signing up, uploading and reviewing datasets
//! and for verified datasets. Points are withdrawn as ARB tokens: the
//! withdrawal debits the ledger immediately and a reconciler settles the
//! on-chain transfer, reversing the debit if the transfer can never happen.
//!
//! - [`rules::RewardEngine`] - pure event -> point delta computation
//! - [`ledger::Ledger`] - atomic append, balances, history, settlement claims
//! - [`settlement::Reconciler`] - drives withdrawals to a terminal state
//! - [`api`] - HTTP surface for the front end

pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod ledger;
pub mod models;
pub mod rules;
pub mod settlement;

pub use config::Config;
pub use error::{LedgerError, Result};
pub use ledger::{EntryPage, Ledger};
pub use models::{
    Account, AccountStatus, AppendOutcome, Breakdown, EntryKind, LedgerEntry, RewardEvent,
    SettlementRecord, SettlementState,
};
pub use rules::RewardEngine;
