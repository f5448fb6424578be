//! Delivery account ledger.
//!
//! Tracks per-account usage counters and selects the least-loaded healthy
//! account for each upload.

pub mod probe;
pub mod service;
pub mod store;

pub use probe::AccountProbe;
pub use service::{
    AccountHandle, AccountLedger, LedgerConfig, LedgerError, load_account_specs, pick_least_used,
};
pub use store::{AccountSpec, AccountStore, InMemoryAccountStore};
