//! Ledger store - backends for the `Ledger` trait and the staged invocation view

pub mod file;
pub mod memory;
pub mod stage;

pub use file::FileLedger;
pub use memory::MemoryLedger;
pub use stage::Stage;
