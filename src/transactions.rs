//! Transaction ledger - audit records, failure records, trade and IOI aggregates

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use crate::core::config::FailureRecordMode;
use crate::core::{Error, FailureRecord, Ioi, Ledger, Result, Trade, Transaction, TransactionKind};
use crate::ledger::Stage;
use crate::sequence::{Reservation, Sequence, SequenceAllocator};

/// Everything a transaction carries except its ID and timestamp.
#[derive(Debug, Clone, Default)]
pub struct TransactionDraft {
    pub trade_id: String,
    pub kind: TransactionKind,
    pub from_user: String,
    pub to_user: String,
    pub symbol: String,
    pub quantity: u64,
    pub price: Decimal,
    pub rate: Decimal,
    pub settlement_date: Option<NaiveDate>,
    pub status: String,
}

impl TransactionDraft {
    fn into_transaction(self, id: String, timestamp: DateTime<Utc>) -> Transaction {
        Transaction {
            id,
            trade_id: self.trade_id,
            kind: self.kind,
            from_user: self.from_user,
            to_user: self.to_user,
            symbol: self.symbol,
            quantity: self.quantity,
            price: self.price,
            rate: self.rate,
            settlement_date: self.settlement_date,
            status: self.status,
            timestamp: Some(timestamp),
        }
    }
}

pub const STATUS_SUFFIX: &str = ".status";

pub fn status_key(id: &str) -> String {
    format!("{}{}", id, STATUS_SUFFIX)
}

#[derive(Debug, Clone, Copy)]
pub struct TransactionLedger {
    allocator: SequenceAllocator,
    failure_mode: FailureRecordMode,
}

impl TransactionLedger {
    pub fn new(allocator: SequenceAllocator, failure_mode: FailureRecordMode) -> Self {
        Self {
            allocator,
            failure_mode,
        }
    }

    /// Pick the ID the next record will be written under.
    pub fn reserve(&self, stage: &mut Stage<'_>) -> Result<Reservation> {
        self.allocator.reserve(stage, Sequence::Transaction)
    }

    /// Stage the record under a reserved ID and persist the counter.
    pub fn write(
        &self,
        stage: &mut Stage<'_>,
        reservation: &Reservation,
        draft: TransactionDraft,
        timestamp: DateTime<Utc>,
    ) -> Result<Transaction> {
        let tx = draft.into_transaction(reservation.id.clone(), timestamp);
        stage.put_json(&tx.id, &tx)?;
        self.allocator.confirm(stage, reservation);
        debug!(tx = %tx.id, kind = ?tx.kind, symbol = %tx.symbol, "transaction staged");
        Ok(tx)
    }

    /// Reserve and write in one step; returns the new ID.
    pub fn record(&self, stage: &mut Stage<'_>, draft: TransactionDraft, timestamp: DateTime<Utc>) -> Result<String> {
        let reservation = self.reserve(stage)?;
        self.write(stage, &reservation, draft, timestamp)?;
        Ok(reservation.id)
    }

    /// Write `{id, status}` for an operation that failed after choosing `id`.
    /// Goes straight to the ledger; returns the key written.
    pub fn record_failure(&self, ledger: &dyn Ledger, id: &str, message: &str) -> Result<String> {
        let key = match self.failure_mode {
            FailureRecordMode::SameKey => id.to_string(),
            FailureRecordMode::StatusKey => status_key(id),
        };
        let record = FailureRecord {
            id: id.to_string(),
            status: message.to_string(),
        };
        ledger.put_state(&key, serde_json::to_vec(&record)?)?;
        Ok(key)
    }

    pub fn get(&self, stage: &mut Stage<'_>, id: &str) -> Result<Transaction> {
        stage.require_json(id)
    }

    /// Status of the record at `id`, falling back to a failure record at
    /// `<id>.status`. Under deferred allocation a failed ID can be reused by a
    /// later success, which then wins.
    pub fn status(&self, stage: &mut Stage<'_>, id: &str) -> Result<String> {
        if let Some(tx) = stage.get_json::<Transaction>(id)? {
            return Ok(tx.status);
        }
        stage
            .get_json::<FailureRecord>(&status_key(id))?
            .map(|record| record.status)
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    pub fn put_trade(&self, stage: &mut Stage<'_>, trade: &Trade) -> Result<()> {
        stage.put_json(&trade.id, trade)
    }

    pub fn get_trade(&self, stage: &mut Stage<'_>, id: &str) -> Result<Trade> {
        stage.require_json(id)
    }

    pub fn put_ioi(&self, stage: &mut Stage<'_>, ioi: &Ioi) -> Result<()> {
        stage.put_json(&ioi.id, ioi)
    }

    pub fn get_ioi(&self, stage: &mut Stage<'_>, id: &str) -> Result<Ioi> {
        stage.require_json(id)
    }
}
