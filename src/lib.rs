//! mktplace-ledger - Core Library
//! Trade lifecycle engine for an OTC instrument marketplace over a key-value ledger

// Public modules
pub mod core;
pub mod genesis;
pub mod identity;
pub mod instruments;
pub mod ledger;
pub mod orchestrator;
pub mod registry;
pub mod sequence;
pub mod transactions;

// Re-exports
pub use core::{Config, Error, Result};
pub use identity::{LedgerIdentity, StaticIdentity};
pub use ledger::{FileLedger, MemoryLedger};
pub use orchestrator::Engine;
