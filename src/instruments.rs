//! Instrument lifecycle - instrument records, status transitions and cash maths

use chrono::NaiveDate;
use rust_decimal::Decimal;
use tracing::debug;

use crate::core::{
    Error, HistoryPolicy, Instrument, InstrumentStatus, OrderedUniqueLog, Result, Transaction,
};
use crate::ledger::Stage;

/// Terms an instrument is created with.
#[derive(Debug, Clone)]
pub struct IssueTerms {
    pub symbol: String,
    pub coupon: String,
    pub quantity: u64,
    pub price: Decimal,
    pub rate: Decimal,
    pub settlement_date: NaiveDate,
    pub issue_date: NaiveDate,
    pub callable: bool,
    pub issuer_id: String,
    pub bank_id: Option<String>,
    pub ioi_id: Option<String>,
    pub description: Option<String>,
}

fn gross(quantity: u64, price: Decimal) -> Result<Decimal> {
    Decimal::from(quantity)
        .checked_mul(price)
        .ok_or_else(|| overflow(quantity, price))
}

fn overflow(quantity: u64, price: Decimal) -> Error {
    Error::invalid_argument("price", format!("{} × {} overflows", quantity, price))
}

#[derive(Debug, Clone, Copy)]
pub struct InstrumentBook {
    commission_rate: Decimal,
}

impl InstrumentBook {
    pub fn new(commission_rate: Decimal) -> Self {
        Self { commission_rate }
    }

    pub fn get(&self, stage: &mut Stage<'_>, symbol: &str) -> Result<Instrument> {
        stage.require_json(symbol)
    }

    pub fn put(&self, stage: &mut Stage<'_>, instrument: &Instrument) -> Result<()> {
        stage.put_json(&instrument.symbol, instrument)
    }

    pub fn exists(&self, stage: &mut Stage<'_>, symbol: &str) -> Result<bool> {
        stage.exists(symbol)
    }

    /// Stage a new instrument owned by `owner` in `status`.
    pub fn create(
        &self,
        stage: &mut Stage<'_>,
        owner: &str,
        terms: IssueTerms,
        status: InstrumentStatus,
    ) -> Result<Instrument> {
        if terms.symbol.is_empty() {
            return Err(Error::invalid_argument("symbol", "must not be empty"));
        }
        if self.exists(stage, &terms.symbol)? {
            return Err(Error::AlreadyExists(terms.symbol));
        }
        if terms.quantity == 0 {
            return Err(Error::invalid_argument("quantity", "must be positive"));
        }
        if terms.price <= Decimal::ZERO {
            return Err(Error::invalid_argument("price", "must be positive"));
        }
        if terms.rate < Decimal::ZERO {
            return Err(Error::invalid_argument("rate", "must not be negative"));
        }
        if terms.settlement_date < terms.issue_date {
            return Err(Error::invalid_argument(
                "settlementDate",
                format!("{} precedes issue date {}", terms.settlement_date, terms.issue_date),
            ));
        }

        let instrument = Instrument {
            symbol: terms.symbol,
            coupon: terms.coupon,
            quantity: terms.quantity,
            price: terms.price,
            rate: terms.rate,
            settlement_date: terms.settlement_date,
            issue_date: terms.issue_date,
            callable: terms.callable,
            status,
            owner: owner.to_string(),
            issuer_id: terms.issuer_id,
            bank_id: terms.bank_id,
            trade_refs: OrderedUniqueLog::new(),
            response_quantity: 0,
            description: terms.description,
            ioi_id: terms.ioi_id,
        };
        // coupon and call-out cash derive from these; refuse terms they cannot be paid on
        self.coupon_amount(&instrument)?;
        self.put(stage, &instrument)?;
        debug!(symbol = %instrument.symbol, owner, status = %status, "instrument created");
        Ok(instrument)
    }

    /// Move to `next`, rejecting anything outside the lifecycle graph.
    pub fn transition(&self, instrument: &mut Instrument, next: InstrumentStatus) -> Result<()> {
        if !instrument.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                symbol: instrument.symbol.clone(),
                from: instrument.status.to_string(),
                to: next.to_string(),
            });
        }
        debug!(symbol = %instrument.symbol, from = %instrument.status, to = %next, "status change");
        instrument.status = next;
        Ok(())
    }

    /// Hand the instrument to `to_user` as Published and reference `transaction_id` last.
    pub fn publish(&self, instrument: &mut Instrument, to_user: &str, transaction_id: &str) -> Result<()> {
        self.transition(instrument, InstrumentStatus::Published)?;
        instrument.owner = to_user.to_string();
        instrument
            .trade_refs
            .push(transaction_id.to_string(), HistoryPolicy::MoveToEnd);
        Ok(())
    }

    /// Reference `transaction_id` as the most recent activity.
    pub fn reference(&self, instrument: &mut Instrument, transaction_id: &str) {
        instrument
            .trade_refs
            .push(transaction_id.to_string(), HistoryPolicy::MoveToEnd);
    }

    pub fn commission(&self, quantity: u64, price: Decimal) -> Result<Decimal> {
        gross(quantity, price)?
            .checked_mul(self.commission_rate)
            .ok_or_else(|| overflow(quantity, price))
    }

    /// Cash moved when a response is accepted: notional less commission.
    pub fn response_amount(&self, quantity: u64, price: Decimal) -> Result<Decimal> {
        gross(quantity, price)?
            .checked_sub(self.commission(quantity, price)?)
            .ok_or_else(|| overflow(quantity, price))
    }

    /// Coupon cash: rate × quantity × price / 100
    pub fn coupon_amount(&self, instrument: &Instrument) -> Result<Decimal> {
        instrument
            .rate
            .checked_mul(instrument.notional()?)
            .and_then(|v| v.checked_div(Decimal::ONE_HUNDRED))
            .ok_or_else(|| Error::invalid_argument("rate", format!("coupon on {} overflows", instrument.symbol)))
    }

    pub fn call_out_amount(&self, instrument: &Instrument) -> Result<Decimal> {
        instrument.notional()
    }

    /// Latest offer (publish or IOI issue) among the instrument's references.
    pub fn active_offer(&self, stage: &mut Stage<'_>, instrument: &Instrument) -> Result<Transaction> {
        for id in instrument.trade_refs.iter().rev() {
            let Some(tx) = stage.get_json::<Transaction>(id)? else {
                continue;
            };
            if tx.kind.is_offer() {
                return Ok(tx);
            }
        }
        Err(Error::NotFound(format!("open offer for {}", instrument.symbol)))
    }
}
