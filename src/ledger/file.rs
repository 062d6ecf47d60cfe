//! JSON snapshot ledger for the command-line front end

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::core::{Error, Ledger, Result, Versioned};
use crate::ledger::MemoryLedger;

#[derive(Debug, Serialize, Deserialize)]
struct StoredValue {
    version: u64,
    value: String,
}

/// `MemoryLedger` loaded from and flushed to a JSON file.
///
/// Writes land in memory; nothing reaches disk until `flush`.
#[derive(Debug)]
pub struct FileLedger {
    path: PathBuf,
    inner: MemoryLedger,
}

impl FileLedger {
    /// Open `path`, starting empty when the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "ledger file absent, starting empty");
            return Ok(Self {
                path,
                inner: MemoryLedger::new(),
            });
        }

        let raw = std::fs::read(&path)?;
        let stored: BTreeMap<String, StoredValue> =
            serde_json::from_slice(&raw).map_err(|e| Error::corrupt(path.display().to_string(), e))?;
        let snapshot: HashMap<String, Versioned> = stored
            .into_iter()
            .map(|(key, v)| {
                (
                    key,
                    Versioned {
                        value: v.value.into_bytes(),
                        version: v.version,
                    },
                )
            })
            .collect();

        tracing::debug!(path = %path.display(), keys = snapshot.len(), "ledger file loaded");
        Ok(Self {
            path,
            inner: MemoryLedger::from_snapshot(snapshot),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the whole key space, replacing the file atomically.
    pub fn flush(&self) -> Result<()> {
        let mut stored = BTreeMap::new();
        for (key, v) in self.inner.snapshot() {
            let value = String::from_utf8(v.value)
                .map_err(|e| Error::Storage(format!("value at {} is not UTF-8: {}", key, e)))?;
            stored.insert(key, StoredValue { version: v.version, value });
        }

        let body = serde_json::to_vec_pretty(&stored)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Ledger for FileLedger {
    fn get_state(&self, key: &str) -> Result<Option<Versioned>> {
        self.inner.get_state(key)
    }

    fn put_state(&self, key: &str, value: Vec<u8>) -> Result<u64> {
        self.inner.put_state(key, value)
    }

    fn compare_and_swap(&self, key: &str, expected: Option<u64>, value: Vec<u8>) -> Result<Option<u64>> {
        self.inner.compare_and_swap(key, expected, value)
    }
}
