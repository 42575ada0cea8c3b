//! Loyalty Ledger Core
//!
//! Points ledger with cashback rules, multi-level referral commission and a
//! durable retry queue for writes that hit a transient storage failure.
//!
//! # Architecture
//!
//! - **Single Writer**: One actor serializes every balance mutation
//! - **Atomic Commit**: Balance, history entry and receipt land in one write
//! - **Idempotent Replay**: Every mutation carries an operation ID
//! - **Degrade, don't fail**: Missing or broken configuration resolves to
//!   defaults instead of refusing a purchase
//!
//! # Invariants
//!
//! - Balance == Σ committed canonical amounts, and never negative
//! - Commission items of a purchase sum exactly to its fund
//! - History entries are never modified or deleted
//! - A validation failure is never queued

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod types;
pub mod error;
pub mod config;
pub mod registry;
pub mod storage;
pub mod currency;
pub mod rules;
pub mod limits;
pub mod partners;
pub mod referral;
pub mod commission;
pub mod actor;
pub mod ledger;
pub mod queue;
pub mod processor;
pub mod metrics;

// Re-exports
pub use error::{Error, Resolution, Result};
pub use types::{
    Account, AccountId, CommissionItem, CommissionTier, CommitReceipt, CommitRequest,
    CurrencyCode, EntryKind, LedgerEntry, PendingOperation,
};
pub use config::Config;
pub use ledger::Ledger;
pub use storage::Storage;
pub use queue::{DrainReport, Replayer, RetryQueue};
pub use processor::{AccrualRequest, TransactionOutcome, TransactionProcessor};
