//! In-process ledger backed by a versioned hash map

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::core::{Ledger, Result, Versioned};

/// Versioned key-value store guarded by a single `RwLock`.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: RwLock<HashMap<String, Versioned>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: HashMap<String, Versioned>) -> Self {
        Self {
            state: RwLock::new(snapshot),
        }
    }

    /// Clone of the full key space
    pub fn snapshot(&self) -> HashMap<String, Versioned> {
        self.state.read().clone()
    }

    pub fn len(&self) -> usize {
        self.state.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().is_empty()
    }
}

impl Ledger for MemoryLedger {
    fn get_state(&self, key: &str) -> Result<Option<Versioned>> {
        Ok(self.state.read().get(key).cloned())
    }

    fn put_state(&self, key: &str, value: Vec<u8>) -> Result<u64> {
        let mut state = self.state.write();
        let version = state.get(key).map(|v| v.version + 1).unwrap_or(1);
        state.insert(key.to_string(), Versioned { value, version });
        Ok(version)
    }

    fn compare_and_swap(&self, key: &str, expected: Option<u64>, value: Vec<u8>) -> Result<Option<u64>> {
        let mut state = self.state.write();
        let current = state.get(key).map(|v| v.version);
        if current != expected {
            return Ok(None);
        }
        let version = current.map(|v| v + 1).unwrap_or(1);
        state.insert(key.to_string(), Versioned { value, version });
        Ok(Some(version))
    }
}
