//! Sequence allocator - monotonically increasing IDs per named counter

use crate::core::config::SequenceMode;
use crate::core::{Error, Ledger, Result};
use crate::ledger::Stage;

/// Independently persisted counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sequence {
    Transaction,
    Trade,
    Ioi,
    Instrument,
}

impl Sequence {
    pub const ALL: [Sequence; 4] = [
        Sequence::Transaction,
        Sequence::Trade,
        Sequence::Ioi,
        Sequence::Instrument,
    ];

    /// Ledger key holding the counter
    pub fn key(&self) -> &'static str {
        match self {
            Sequence::Transaction => "currentTransactionNum",
            Sequence::Trade => "currentTradeNum",
            Sequence::Ioi => "currentIoiNum",
            Sequence::Instrument => "currentInstrumentNum",
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            Sequence::Transaction => "trans",
            Sequence::Trade => "trade",
            Sequence::Ioi => "ioi",
            Sequence::Instrument => "INST",
        }
    }

    pub fn format_id(&self, n: u64) -> String {
        format!("{}{}", self.prefix(), n)
    }

    /// True when `key` is this counter's key or an ID it could hand out.
    pub fn claims(&self, key: &str) -> bool {
        if key == self.key() {
            return true;
        }
        key.strip_prefix(self.prefix())
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
    }
}

/// An ID handed out to an operation.
///
/// Under `SequenceMode::Deferred` the counter is not advanced until
/// `SequenceAllocator::confirm` stages the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub sequence: Sequence,
    pub value: u64,
    pub id: String,
}

#[derive(Debug, Clone, Copy)]
pub struct SequenceAllocator {
    mode: SequenceMode,
    max_retries: u32,
}

fn decode_counter(key: &str, bytes: &[u8]) -> Result<u64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .ok_or_else(|| Error::corrupt(key, "counter is not an integer"))
}

impl SequenceAllocator {
    pub fn new(mode: SequenceMode, max_retries: u32) -> Self {
        Self {
            mode,
            max_retries: max_retries.max(1),
        }
    }

    pub fn mode(&self) -> SequenceMode {
        self.mode
    }

    /// Write every counter at `baseline`, overwriting.
    pub fn seed(ledger: &dyn Ledger, baseline: u64) -> Result<()> {
        for seq in Sequence::ALL {
            ledger.put_state(seq.key(), baseline.to_string().into_bytes())?;
        }
        Ok(())
    }

    /// Current stored value
    pub fn current(&self, stage: &mut Stage<'_>, seq: Sequence) -> Result<u64> {
        let bytes = stage
            .get(seq.key())?
            .ok_or_else(|| Error::NotInitialized(seq.key().to_string()))?;
        decode_counter(seq.key(), &bytes)
    }

    /// Stored value + 1, without storing anything.
    pub fn next(&self, stage: &mut Stage<'_>, seq: Sequence) -> Result<u64> {
        Ok(self.current(stage, seq)? + 1)
    }

    /// Stage the store of `value` under the counter key.
    pub fn commit(&self, stage: &mut Stage<'_>, seq: Sequence, value: u64) {
        stage.put(seq.key(), value.to_string().into_bytes());
    }

    /// Read, increment and store in one version-checked step against the ledger.
    pub fn allocate(&self, ledger: &dyn Ledger, seq: Sequence) -> Result<u64> {
        let key = seq.key();
        for attempt in 1..=self.max_retries {
            let current = ledger
                .get_state(key)?
                .ok_or_else(|| Error::NotInitialized(key.to_string()))?;
            let next = decode_counter(key, &current.value)? + 1;
            if ledger
                .compare_and_swap(key, Some(current.version), next.to_string().into_bytes())?
                .is_some()
            {
                return Ok(next);
            }
            tracing::debug!(counter = key, attempt, "counter CAS lost, retrying");
        }
        Err(Error::VersionConflict(key.to_string()))
    }

    /// Hand out the next ID according to the configured mode.
    pub fn reserve(&self, stage: &mut Stage<'_>, seq: Sequence) -> Result<Reservation> {
        let value = match self.mode {
            SequenceMode::Deferred => self.next(stage, seq)?,
            SequenceMode::Atomic => self.allocate(stage.ledger(), seq)?,
        };
        let id = seq.format_id(value);
        tracing::debug!(counter = seq.key(), id = %id, "reserved");
        Ok(Reservation {
            sequence: seq,
            value,
            id,
        })
    }

    /// Persist a reservation once the operation's own writes are staged.
    pub fn confirm(&self, stage: &mut Stage<'_>, reservation: &Reservation) {
        if self.mode == SequenceMode::Deferred {
            self.commit(stage, reservation.sequence, reservation.value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;

    fn seeded() -> MemoryLedger {
        let ledger = MemoryLedger::new();
        SequenceAllocator::seed(&ledger, 1000).unwrap();
        ledger
    }

    #[test]
    fn test_claims_own_key_and_ids() {
        assert!(Sequence::Transaction.claims("currentTransactionNum"));
        assert!(Sequence::Transaction.claims(&Sequence::Transaction.format_id(1001)));
        assert!(!Sequence::Transaction.claims("trans"));
        assert!(!Sequence::Transaction.claims("trans1001a"));
        assert!(!Sequence::Trade.claims("trans1001"));
        assert!(Sequence::Instrument.claims("INST7"));
    }

    #[test]
    fn test_unseeded_counter_is_not_initialized() {
        let ledger = MemoryLedger::new();
        let alloc = SequenceAllocator::new(SequenceMode::Atomic, 3);
        assert!(matches!(
            alloc.allocate(&ledger, Sequence::Trade),
            Err(Error::NotInitialized(k)) if k == "currentTradeNum"
        ));
    }

    #[test]
    fn test_atomic_allocations_are_gapless_and_increasing() {
        let ledger = seeded();
        let alloc = SequenceAllocator::new(SequenceMode::Atomic, 3);
        let ids: Vec<u64> = (0..5)
            .map(|_| alloc.allocate(&ledger, Sequence::Transaction).unwrap())
            .collect();
        assert_eq!(ids, vec![1001, 1002, 1003, 1004, 1005]);
        // other counters untouched
        let mut stage = Stage::new(&ledger);
        assert_eq!(alloc.current(&mut stage, Sequence::Ioi).unwrap(), 1000);
    }

    #[test]
    fn test_deferred_next_does_not_store_until_confirmed() {
        let ledger = seeded();
        let alloc = SequenceAllocator::new(SequenceMode::Deferred, 1);

        let mut first = Stage::new(&ledger);
        let a = alloc.reserve(&mut first, Sequence::Transaction).unwrap();
        let mut second = Stage::new(&ledger);
        let b = alloc.reserve(&mut second, Sequence::Transaction).unwrap();
        // read-then-later-store: both invocations see the same next value
        assert_eq!(a.id, "trans1001");
        assert_eq!(b.id, "trans1001");

        alloc.confirm(&mut first, &a);
        first.commit(false).unwrap();
        let mut third = Stage::new(&ledger);
        assert_eq!(alloc.reserve(&mut third, Sequence::Transaction).unwrap().id, "trans1002");
    }

    #[test]
    fn test_deferred_race_caught_by_optimistic_commit() {
        let ledger = seeded();
        let alloc = SequenceAllocator::new(SequenceMode::Deferred, 1);

        let mut first = Stage::new(&ledger);
        let a = alloc.reserve(&mut first, Sequence::Trade).unwrap();
        let mut second = Stage::new(&ledger);
        let b = alloc.reserve(&mut second, Sequence::Trade).unwrap();

        alloc.confirm(&mut first, &a);
        first.commit(true).unwrap();
        alloc.confirm(&mut second, &b);
        assert!(matches!(second.commit(true), Err(Error::VersionConflict(_))));
    }

    #[test]
    fn test_corrupt_counter() {
        let ledger = MemoryLedger::new();
        ledger.put_state("currentIoiNum", b"ten".to_vec()).unwrap();
        let alloc = SequenceAllocator::new(SequenceMode::Atomic, 1);
        assert!(matches!(alloc.allocate(&ledger, Sequence::Ioi), Err(Error::Corrupt { .. })));
    }

    #[test]
    fn test_formats_prefixed_ids() {
        assert_eq!(Sequence::Transaction.format_id(1001), "trans1001");
        assert_eq!(Sequence::Trade.format_id(7), "trade7");
        assert_eq!(Sequence::Ioi.format_id(1002), "ioi1002");
        assert_eq!(Sequence::Instrument.format_id(1001), "INST1001");
    }
}
