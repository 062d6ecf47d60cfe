//! Entity registry - party records, balances, portfolios and history logs

use rust_decimal::Decimal;
use tracing::debug;

use crate::core::{Entity, Error, HistoryPolicy, Result};
use crate::ledger::Stage;
use crate::sequence::Sequence;
use crate::transactions::STATUS_SUFFIX;

/// Key holding the ordered list of registered party IDs
pub const ENTITY_LIST_KEY: &str = "entityList";

/// Keys the engine writes on its own schedule. A caller-chosen party ID or
/// symbol landing on one would later be overwritten.
pub fn is_reserved_key(key: &str) -> bool {
    key == ENTITY_LIST_KEY
        || key.ends_with(STATUS_SUFFIX)
        || Sequence::ALL.iter().any(|seq| seq.claims(key))
}

#[derive(Debug, Clone, Copy)]
pub struct EntityRegistry {
    instrument_policy: HistoryPolicy,
}

impl EntityRegistry {
    pub fn new(instrument_policy: HistoryPolicy) -> Self {
        Self { instrument_policy }
    }

    pub fn get(&self, stage: &mut Stage<'_>, id: &str) -> Result<Entity> {
        stage.require_json(id)
    }

    /// Full overwrite by ID
    pub fn put(&self, stage: &mut Stage<'_>, entity: &Entity) -> Result<()> {
        stage.put_json(&entity.id, entity)
    }

    /// Registered IDs in registration order; empty before genesis.
    pub fn list(&self, stage: &mut Stage<'_>) -> Result<Vec<String>> {
        Ok(stage.get_json(ENTITY_LIST_KEY)?.unwrap_or_default())
    }

    /// Write a new party and append it to the entity list.
    pub fn register(&self, stage: &mut Stage<'_>, entity: &Entity) -> Result<()> {
        if entity.id.is_empty() || is_reserved_key(&entity.id) {
            return Err(Error::invalid_argument("id", format!("{:?} is not a usable party ID", entity.id)));
        }
        if stage.exists(&entity.id)? {
            return Err(Error::AlreadyExists(entity.id.clone()));
        }
        if entity.balance < Decimal::ZERO {
            return Err(Error::InsufficientFunds {
                entity: entity.id.clone(),
                balance: Decimal::ZERO,
                delta: entity.balance,
            });
        }
        let mut ids = self.list(stage)?;
        ids.push(entity.id.clone());
        self.put(stage, entity)?;
        stage.put_json(ENTITY_LIST_KEY, &ids)?;
        debug!(entity = %entity.id, kind = %entity.kind, "entity registered");
        Ok(())
    }

    /// Read, append, write. Not idempotent: a retried call appends again.
    pub fn append_trade_history(&self, stage: &mut Stage<'_>, id: &str, transaction_id: &str) -> Result<()> {
        let mut entity = self.get(stage, id)?;
        entity
            .trade_history
            .push(transaction_id.to_string(), HistoryPolicy::Append);
        self.put(stage, &entity)
    }

    /// Append with the configured instrument-history policy.
    pub fn append_instrument_history(&self, stage: &mut Stage<'_>, id: &str, symbol: &str) -> Result<()> {
        let mut entity = self.get(stage, id)?;
        entity
            .instrument_refs
            .push(symbol.to_string(), self.instrument_policy);
        self.put(stage, &entity)
    }

    pub fn append_ioi(&self, stage: &mut Stage<'_>, id: &str, ioi_id: &str) -> Result<()> {
        let mut entity = self.get(stage, id)?;
        entity.ioi_refs.push(ioi_id.to_string(), HistoryPolicy::Append);
        self.put(stage, &entity)
    }

    /// Add `delta` to the balance. On `InsufficientFunds` nothing is written;
    /// writes staged earlier in the invocation are left alone.
    pub fn update_balance(&self, stage: &mut Stage<'_>, id: &str, delta: Decimal) -> Result<Decimal> {
        let mut entity = self.get(stage, id)?;
        let balance = entity.apply_balance_delta(delta)?;
        self.put(stage, &entity)?;
        debug!(entity = id, %delta, %balance, "balance updated");
        Ok(balance)
    }

    /// Move units of `symbol` in (positive) or out (negative) of a portfolio.
    pub fn adjust_holding(
        &self,
        stage: &mut Stage<'_>,
        id: &str,
        symbol: &str,
        counterparty: &str,
        quantity_delta: i64,
        commission: Decimal,
    ) -> Result<u64> {
        let mut entity = self.get(stage, id)?;
        let quantity = entity.adjust_holding(symbol, counterparty, quantity_delta, commission)?;
        self.put(stage, &entity)?;
        Ok(quantity)
    }
}
