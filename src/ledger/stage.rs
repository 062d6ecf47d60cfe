//! Per-invocation view over the ledger.
//!
//! Reads go through to the ledger (or to a value written earlier in the same
//! invocation); writes are buffered in first-write order and applied by
//! `commit` as independent per-key puts. There is no multi-key atomicity:
//! a commit that fails half way leaves the earlier puts in place.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;

use crate::core::{Error, Ledger, Result};

pub struct Stage<'a> {
    ledger: &'a dyn Ledger,
    /// Version observed on first read of each key (`None` = absent)
    read_versions: HashMap<String, Option<u64>>,
    order: Vec<String>,
    writes: HashMap<String, Vec<u8>>,
}

impl<'a> Stage<'a> {
    pub fn new(ledger: &'a dyn Ledger) -> Self {
        Self {
            ledger,
            read_versions: HashMap::new(),
            order: Vec::new(),
            writes: HashMap::new(),
        }
    }

    /// Underlying ledger, for writes that must bypass staging
    pub fn ledger(&self) -> &'a dyn Ledger {
        self.ledger
    }

    pub fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.writes.get(key) {
            return Ok(Some(value.clone()));
        }
        let stored = self.ledger.get_state(key)?;
        self.read_versions
            .entry(key.to_string())
            .or_insert(stored.as_ref().map(|v| v.version));
        Ok(stored.map(|v| v.value))
    }

    pub fn put(&mut self, key: &str, value: Vec<u8>) {
        if !self.writes.contains_key(key) {
            self.order.push(key.to_string());
        }
        self.writes.insert(key.to_string(), value);
    }

    pub fn exists(&mut self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Decode a JSON record; `None` when absent, `Corrupt` when undecodable
    pub fn get_json<T: DeserializeOwned>(&mut self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| Error::corrupt(key, e)),
            None => Ok(None),
        }
    }

    /// Decode a JSON record that must exist
    pub fn require_json<T: DeserializeOwned>(&mut self, key: &str) -> Result<T> {
        self.get_json(key)?.ok_or_else(|| Error::NotFound(key.to_string()))
    }

    pub fn put_json<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.put(key, bytes);
        Ok(())
    }

    /// Keys written so far, in first-write order
    pub fn pending(&self) -> &[String] {
        &self.order
    }

    /// Apply buffered writes in order. With `optimistic`, each key that was
    /// read before being written is stored only if it is still at the version
    /// read; the first mismatch stops the commit with `VersionConflict`.
    pub fn commit(self, optimistic: bool) -> Result<usize> {
        let Stage {
            ledger,
            read_versions,
            order,
            mut writes,
        } = self;

        let mut applied = 0;
        for key in order {
            let Some(value) = writes.remove(&key) else {
                continue;
            };
            match read_versions.get(&key) {
                Some(expected) if optimistic => {
                    if ledger.compare_and_swap(&key, *expected, value)?.is_none() {
                        tracing::warn!(key = %key, applied, "optimistic commit lost a race");
                        return Err(Error::VersionConflict(key));
                    }
                }
                _ => {
                    ledger.put_state(&key, value)?;
                }
            }
            applied += 1;
        }
        Ok(applied)
    }

    /// Drop every buffered write
    pub fn discard(self) -> usize {
        self.order.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;

    #[test]
    fn test_reads_see_own_writes_before_commit() {
        let ledger = MemoryLedger::new();
        ledger.put_state("k", b"old".to_vec()).unwrap();

        let mut stage = Stage::new(&ledger);
        assert_eq!(stage.get("k").unwrap(), Some(b"old".to_vec()));
        stage.put("k", b"new".to_vec());
        assert_eq!(stage.get("k").unwrap(), Some(b"new".to_vec()));
        assert_eq!(ledger.get_state("k").unwrap().unwrap().value, b"old");

        assert_eq!(stage.commit(false).unwrap(), 1);
        assert_eq!(ledger.get_state("k").unwrap().unwrap().value, b"new");
    }

    #[test]
    fn test_commit_preserves_first_write_order_and_collapses_repeats() {
        let ledger = MemoryLedger::new();
        let mut stage = Stage::new(&ledger);
        stage.put("b", b"1".to_vec());
        stage.put("a", b"1".to_vec());
        stage.put("b", b"2".to_vec());
        assert_eq!(stage.pending(), &["b".to_string(), "a".to_string()]);

        assert_eq!(stage.commit(false).unwrap(), 2);
        assert_eq!(ledger.get_state("b").unwrap().unwrap().value, b"2");
        assert_eq!(ledger.get_state("b").unwrap().unwrap().version, 1);
    }

    #[test]
    fn test_discard_writes_nothing() {
        let ledger = MemoryLedger::new();
        let mut stage = Stage::new(&ledger);
        stage.put("a", b"1".to_vec());
        assert_eq!(stage.discard(), 1);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_optimistic_commit_detects_concurrent_writer() {
        let ledger = MemoryLedger::new();
        ledger.put_state("balance", b"10".to_vec()).unwrap();

        let mut stage = Stage::new(&ledger);
        stage.get("balance").unwrap();
        stage.put("balance", b"5".to_vec());

        ledger.put_state("balance", b"7".to_vec()).unwrap();

        assert!(matches!(stage.commit(true), Err(Error::VersionConflict(k)) if k == "balance"));
        assert_eq!(ledger.get_state("balance").unwrap().unwrap().value, b"7");
    }

    #[test]
    fn test_last_writer_wins_without_optimistic_commit() {
        let ledger = MemoryLedger::new();
        ledger.put_state("balance", b"10".to_vec()).unwrap();

        let mut stage = Stage::new(&ledger);
        stage.get("balance").unwrap();
        stage.put("balance", b"5".to_vec());
        ledger.put_state("balance", b"7".to_vec()).unwrap();

        stage.commit(false).unwrap();
        assert_eq!(ledger.get_state("balance").unwrap().unwrap().value, b"5");
    }

    #[test]
    fn test_undecodable_record_is_corrupt() {
        let ledger = MemoryLedger::new();
        ledger.put_state("ISS1", b"{broken".to_vec()).unwrap();
        let mut stage = Stage::new(&ledger);

        let res: Result<serde_json::Value> = stage.require_json("ISS1");
        assert!(matches!(res, Err(Error::Corrupt { .. })));
        let res: Result<serde_json::Value> = stage.require_json("nope");
        assert!(matches!(res, Err(Error::NotFound(_))));
    }
}
