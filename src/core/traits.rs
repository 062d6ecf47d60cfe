//! Core traits - the seams to the ledger host, the identity provider and time

use chrono::{DateTime, NaiveDate, Utc};

use crate::core::{Caller, Result};

/// Stored value plus the per-key version it was written at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: Vec<u8>,
    pub version: u64,
}

/// Replicated key-value store of record.
///
/// Versions start at 1 for a key's first write and increase by one on every
/// subsequent write of that key.
pub trait Ledger: Send + Sync {
    /// Read a key; `None` when absent
    fn get_state(&self, key: &str) -> Result<Option<Versioned>>;

    /// Unconditional overwrite; returns the new version
    fn put_state(&self, key: &str, value: Vec<u8>) -> Result<u64>;

    /// Write only if the key is still at `expected` (`None` = absent).
    /// Returns the new version, or `None` when another writer got there first.
    fn compare_and_swap(&self, key: &str, expected: Option<u64>, value: Vec<u8>) -> Result<Option<u64>>;
}

/// Resolves who is invoking. Credential parsing lives entirely behind this trait.
pub trait IdentityResolver: Send + Sync {
    fn resolve_caller(&self, ledger: &dyn Ledger) -> Result<Caller>;
}

/// Source of "now" for timestamps and settlement-date checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to one instant, for deterministic replays and tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl FixedClock {
    /// Midnight UTC on `date`
    pub fn on(date: NaiveDate) -> Self {
        Self(date.and_time(chrono::NaiveTime::MIN).and_utc())
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
