//! Error handling - one flat taxonomy shared by every component

use rust_decimal::Decimal;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Marketplace error hierarchy
#[derive(Debug, Error)]
pub enum Error {
    /// Positional argument count does not match the dispatch table
    #[error("Incorrect number of arguments for {function}: expecting {expected}, got {got}")]
    InvalidArgumentCount {
        function: String,
        expected: usize,
        got: usize,
    },

    /// An argument could not be parsed into its typed form
    #[error("Invalid argument {name}: {reason}")]
    InvalidArgument { name: &'static str, reason: String },

    /// Missing ledger key
    #[error("Not found: {0}")]
    NotFound(String),

    /// Stored bytes do not decode
    #[error("Corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// Counter key was never seeded
    #[error("Counter not initialized: {0}")]
    NotInitialized(String),

    /// Key already holds a record
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Quantity {requested} exceeds available {available}")]
    QuantityExceeded { requested: u64, available: u64 },

    #[error("Trade ID mismatch: expected {expected}, quote carries {actual}")]
    TradeIdMismatch { expected: String, actual: String },

    #[error("Settlement date {settlement} has passed (today {today})")]
    SettlementExpired { settlement: String, today: String },

    #[error("Insufficient funds for {entity}: balance {balance}, change {delta}")]
    InsufficientFunds {
        entity: String,
        balance: Decimal,
        delta: Decimal,
    },

    /// Instrument status change outside the lifecycle graph
    #[error("Invalid transition for {symbol}: {from} -> {to}")]
    InvalidTransition {
        symbol: String,
        from: String,
        to: String,
    },

    #[error("Instrument {0} is not callable")]
    NotCallable(String),

    /// Caller's identity or role does not permit the operation
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Received unknown function invocation: {0}")]
    UnknownFunction(String),

    #[error("Identity unavailable: {0}")]
    IdentityUnavailable(String),

    /// Optimistic write lost against a concurrent writer
    #[error("Version conflict on {0}")]
    VersionConflict(String),

    /// Ledger backend failure
    #[error("Storage: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn invalid_argument(name: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidArgument {
            name,
            reason: reason.into(),
        }
    }

    pub fn corrupt(key: impl Into<String>, reason: impl ToString) -> Self {
        Error::Corrupt {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}
