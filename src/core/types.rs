//! Core types - ledger records and their enums

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::core::error::{Error, Result};
use crate::core::history::{HistoryPolicy, OrderedUniqueLog};

/// Marketplace party type. Also used as the caller's role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityType {
    Issuer,
    Bank,
    Investor,
    Regulator,
}

impl EntityType {
    /// Issuers and banks earn commission; investors pay it.
    pub fn earns_commission(&self) -> bool {
        matches!(self, EntityType::Issuer | EntityType::Bank)
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EntityType::Issuer => "Issuer",
            EntityType::Bank => "Bank",
            EntityType::Investor => "Investor",
            EntityType::Regulator => "Regulator",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for EntityType {
    type Err = Error;

    /// Accepts the type name or the numeric affiliation code (1-4).
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "issuer" | "1" => Ok(EntityType::Issuer),
            "bank" | "2" => Ok(EntityType::Bank),
            "investor" | "3" => Ok(EntityType::Investor),
            "regulator" | "regbody" | "4" => Ok(EntityType::Regulator),
            other => Err(Error::invalid_argument("type", format!("unknown entity type {:?}", other))),
        }
    }
}

/// Resolved identity of the party invoking an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub username: String,
    pub role: EntityType,
}

impl Caller {
    pub fn new(username: impl Into<String>, role: EntityType) -> Self {
        Self {
            username: username.into(),
            role,
        }
    }
}

/// One instrument position inside an entity's portfolio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Holding {
    pub symbol: String,
    #[serde(rename = "counterpartyID")]
    pub counterparty_id: String,
    pub quantity: u64,
    pub accrued_commission: Decimal,
}

/// Marketplace party record, keyed by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntityType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credit_rating: Option<String>,
    pub balance: Decimal,
    #[serde(default)]
    pub portfolio: Vec<Holding>,
    #[serde(default)]
    pub instrument_refs: OrderedUniqueLog<String>,
    #[serde(default)]
    pub trade_history: OrderedUniqueLog<String>,
    #[serde(default)]
    pub ioi_refs: OrderedUniqueLog<String>,
}

impl Entity {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: EntityType, balance: Decimal) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            address: None,
            credit_rating: None,
            balance,
            portfolio: Vec::new(),
            instrument_refs: OrderedUniqueLog::new(),
            trade_history: OrderedUniqueLog::new(),
            ioi_refs: OrderedUniqueLog::new(),
        }
    }

    /// Apply a signed cash change. The balance is left untouched on failure.
    pub fn apply_balance_delta(&mut self, delta: Decimal) -> Result<Decimal> {
        let next = self
            .balance
            .checked_add(delta)
            .ok_or_else(|| Error::invalid_argument("balance", format!("{} + {} overflows", self.balance, delta)))?;
        if next < Decimal::ZERO {
            return Err(Error::InsufficientFunds {
                entity: self.id.clone(),
                balance: self.balance,
                delta,
            });
        }
        self.balance = next;
        Ok(next)
    }

    pub fn holding(&self, symbol: &str) -> Option<&Holding> {
        self.portfolio.iter().find(|h| h.symbol == symbol)
    }

    /// Move `quantity_delta` units of `symbol` in or out of the portfolio and
    /// accrue `commission`. The holding records the latest counterparty.
    pub fn adjust_holding(
        &mut self,
        symbol: &str,
        counterparty: &str,
        quantity_delta: i64,
        commission: Decimal,
    ) -> Result<u64> {
        let idx = match self.portfolio.iter().position(|h| h.symbol == symbol) {
            Some(idx) => idx,
            None => {
                self.portfolio.push(Holding {
                    symbol: symbol.to_string(),
                    counterparty_id: counterparty.to_string(),
                    quantity: 0,
                    accrued_commission: Decimal::ZERO,
                });
                self.portfolio.len() - 1
            }
        };

        let holding = &mut self.portfolio[idx];
        let magnitude = quantity_delta.unsigned_abs();
        let quantity = if quantity_delta >= 0 {
            holding.quantity + magnitude
        } else {
            holding
                .quantity
                .checked_sub(magnitude)
                .ok_or(Error::QuantityExceeded {
                    requested: magnitude,
                    available: holding.quantity,
                })?
        };

        holding.quantity = quantity;
        holding.counterparty_id = counterparty.to_string();
        holding.accrued_commission += commission;
        Ok(quantity)
    }
}

/// Instrument lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstrumentStatus {
    #[serde(rename = "New Issue")]
    NewIssue,
    #[serde(rename = "PublishedToBank")]
    PublishedToBank,
    #[serde(rename = "Published")]
    Published,
    #[serde(rename = "Responded")]
    Responded,
    #[serde(rename = "Trade Executed")]
    TradeExecuted,
    #[serde(rename = "Trade Settled")]
    TradeSettled,
    #[serde(rename = "Trade Exercised")]
    TradeExercised,
    #[serde(rename = "Trade Cancelled")]
    TradeCancelled,
    #[serde(rename = "Trade Expired")]
    TradeExpired,
    #[serde(rename = "Expired")]
    Expired,
}

impl InstrumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentStatus::NewIssue => "New Issue",
            InstrumentStatus::PublishedToBank => "PublishedToBank",
            InstrumentStatus::Published => "Published",
            InstrumentStatus::Responded => "Responded",
            InstrumentStatus::TradeExecuted => "Trade Executed",
            InstrumentStatus::TradeSettled => "Trade Settled",
            InstrumentStatus::TradeExercised => "Trade Exercised",
            InstrumentStatus::TradeCancelled => "Trade Cancelled",
            InstrumentStatus::TradeExpired => "Trade Expired",
            InstrumentStatus::Expired => "Expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstrumentStatus::TradeSettled
                | InstrumentStatus::TradeExercised
                | InstrumentStatus::TradeCancelled
                | InstrumentStatus::TradeExpired
                | InstrumentStatus::Expired
        )
    }

    /// Lifecycle graph. Call-out (`Expired`) retires anything that is not
    /// already retired or cancelled.
    pub fn can_transition_to(&self, next: InstrumentStatus) -> bool {
        use InstrumentStatus::*;
        match (self, next) {
            (Expired | TradeCancelled, Expired) => false,
            (_, Expired) => true,
            (NewIssue, Published) => true,
            (Published, Published) => true,
            (Published | PublishedToBank, Responded | TradeCancelled) => true,
            (Responded, TradeExecuted | TradeCancelled) => true,
            (TradeExecuted, TradeSettled | TradeExpired | TradeCancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for InstrumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Issued asset record, keyed by `symbol`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instrument {
    pub symbol: String,
    pub coupon: String,
    pub quantity: u64,
    pub price: Decimal,
    pub rate: Decimal,
    pub settlement_date: NaiveDate,
    pub issue_date: NaiveDate,
    pub callable: bool,
    pub status: InstrumentStatus,
    pub owner: String,
    #[serde(rename = "issuerID")]
    pub issuer_id: String,
    #[serde(rename = "bankID", default, skip_serializing_if = "Option::is_none")]
    pub bank_id: Option<String>,
    #[serde(default)]
    pub trade_refs: OrderedUniqueLog<String>,
    #[serde(default)]
    pub response_quantity: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "ioiID", default, skip_serializing_if = "Option::is_none")]
    pub ioi_id: Option<String>,
}

impl Instrument {
    pub fn notional(&self) -> Result<Decimal> {
        self.price
            .checked_mul(Decimal::from(self.quantity))
            .ok_or_else(|| Error::invalid_argument("price", format!("{} × {} overflows", self.price, self.quantity)))
    }
}

/// Business event recorded by a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransactionKind {
    #[serde(rename = "IOI Request")]
    IoiRequest,
    #[serde(rename = "IOI Issue")]
    IoiIssue,
    #[serde(rename = "Request/Publish")]
    Publish,
    #[serde(rename = "Response")]
    Response,
    #[serde(rename = "Execute")]
    Execute,
    #[serde(rename = "Cancel")]
    Cancel,
    #[serde(rename = "Settle")]
    Settle,
    #[serde(rename = "Coupon")]
    Coupon,
    #[serde(rename = "Call Out")]
    CallOut,
    /// Degraded status-only record
    #[default]
    #[serde(rename = "Failure")]
    Failure,
}

impl TransactionKind {
    /// Kinds that open a negotiation another party responds to.
    pub fn is_offer(&self) -> bool {
        matches!(self, TransactionKind::Publish | TransactionKind::IoiIssue)
    }
}

/// Audit record of one business step, keyed by `id` ("trans<N>").
///
/// Every field defaults so a status-only failure record still decodes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Transaction {
    pub id: String,
    #[serde(rename = "tradeID")]
    pub trade_id: String,
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    pub from_user: String,
    pub to_user: String,
    pub symbol: String,
    pub quantity: u64,
    pub price: Decimal,
    pub rate: Decimal,
    pub settlement_date: Option<NaiveDate>,
    pub status: String,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Minimal record written when an operation fails after its ID was chosen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub id: String,
    pub status: String,
}

/// Progress of a trade or IOI aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateStatus {
    New,
    Responded,
    Executed,
    Settled,
    Cancelled,
    Expired,
}

/// Negotiation over one instrument, keyed by `id` ("trade<N>").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub id: String,
    pub symbol: String,
    pub buyer: String,
    pub seller: String,
    pub quantity: u64,
    pub price: Decimal,
    pub status: AggregateStatus,
    #[serde(default)]
    pub transaction_history: OrderedUniqueLog<String>,
}

impl Trade {
    pub fn record(&mut self, transaction_id: &str, status: AggregateStatus) {
        self.transaction_history
            .push(transaction_id.to_string(), HistoryPolicy::Append);
        self.status = status;
    }
}

/// Indication of interest raised by a bank or investor, keyed by `id` ("ioi<N>").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ioi {
    pub id: String,
    pub requester: String,
    pub issuer: String,
    pub quantity: u64,
    pub rate: Decimal,
    pub settlement_date: NaiveDate,
    pub status: AggregateStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default)]
    pub transaction_history: OrderedUniqueLog<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    fn sample_instrument() -> Instrument {
        Instrument {
            symbol: "BOND1".into(),
            coupon: "5%".into(),
            quantity: 1000,
            price: dec!(100),
            rate: dec!(0.05),
            settlement_date: NaiveDate::from_ymd_opt(2030, 1, 1).unwrap(),
            issue_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            callable: true,
            status: InstrumentStatus::Published,
            owner: "BANK1".into(),
            issuer_id: "ISS1".into(),
            bank_id: Some("BANK1".into()),
            trade_refs: vec!["trans1001".to_string()].into(),
            response_quantity: 0,
            description: None,
            ioi_id: None,
        }
    }

    #[test]
    fn test_entity_round_trip() {
        let mut entity = Entity::new("ISS1", "Issuer 1", EntityType::Issuer, dec!(50000000.25));
        entity.credit_rating = Some("A".into());
        entity.adjust_holding("BOND1", "ISS1", 1000, dec!(0)).unwrap();
        entity.trade_history.push("trans1001".into(), HistoryPolicy::Append);

        let json = serde_json::to_vec(&entity).unwrap();
        let back: Entity = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, entity);
    }

    #[test]
    fn test_instrument_round_trip_uses_wire_names() {
        let inst = sample_instrument();
        let value = serde_json::to_value(&inst).unwrap();
        assert_eq!(value["issuerID"], "ISS1");
        assert_eq!(value["status"], "Published");
        assert_eq!(value["settlementDate"], "2030-01-01");

        let back: Instrument = serde_json::from_value(value).unwrap();
        assert_eq!(back, inst);
    }

    #[test]
    fn test_transaction_round_trip() {
        let tx = Transaction {
            id: "trans1001".into(),
            trade_id: "trade1001".into(),
            kind: TransactionKind::Publish,
            from_user: "ISS1".into(),
            to_user: "BANK1".into(),
            symbol: "BOND1".into(),
            quantity: 1000,
            price: dec!(100),
            rate: dec!(0.05),
            settlement_date: NaiveDate::from_ymd_opt(2030, 1, 1),
            status: "Published".into(),
            timestamp: Some(Utc::now()),
        };
        let json = serde_json::to_string(&tx).unwrap();
        assert!(json.contains(r#""type":"Request/Publish""#));
        let back: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tx);
    }

    #[test]
    fn test_failure_record_decodes_as_degraded_transaction() {
        let record = FailureRecord {
            id: "trans1002".into(),
            status: "trade id mismatch".into(),
        };
        let bytes = serde_json::to_vec(&record).unwrap();
        let tx: Transaction = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(tx.kind, TransactionKind::Failure);
        assert_eq!(tx.status, "trade id mismatch");
        assert_eq!(tx.quantity, 0);
    }

    #[test]
    fn test_balance_never_goes_negative() {
        let mut entity = Entity::new("INV1", "Investor 1", EntityType::Investor, dec!(10));
        assert!(matches!(
            entity.apply_balance_delta(dec!(-10.01)),
            Err(Error::InsufficientFunds { .. })
        ));
        assert_eq!(entity.balance, dec!(10));
        assert_eq!(entity.apply_balance_delta(dec!(-10)).unwrap(), dec!(0));
    }

    #[test]
    fn test_balance_overflow_is_rejected() {
        let mut entity = Entity::new("BANK1", "Bank 1", EntityType::Bank, Decimal::MAX);
        assert!(matches!(
            entity.apply_balance_delta(dec!(1)),
            Err(Error::InvalidArgument { name: "balance", .. })
        ));
        assert_eq!(entity.balance, Decimal::MAX);
    }

    #[test]
    fn test_holding_cannot_go_below_zero() {
        let mut entity = Entity::new("BANK1", "Bank 1", EntityType::Bank, dec!(0));
        entity.adjust_holding("BOND1", "ISS1", 10, dec!(1)).unwrap();
        assert!(matches!(
            entity.adjust_holding("BOND1", "INV1", -11, dec!(0)),
            Err(Error::QuantityExceeded { requested: 11, available: 10 })
        ));
        assert_eq!(entity.adjust_holding("BOND1", "INV1", -4, dec!(1)).unwrap(), 6);
        let holding = entity.holding("BOND1").unwrap();
        assert_eq!(holding.counterparty_id, "INV1");
        assert_eq!(holding.accrued_commission, dec!(2));
    }

    #[test]
    fn test_lifecycle_graph() {
        use InstrumentStatus::*;
        assert!(NewIssue.can_transition_to(Published));
        assert!(Published.can_transition_to(Responded));
        assert!(PublishedToBank.can_transition_to(Responded));
        assert!(Responded.can_transition_to(TradeExecuted));
        assert!(TradeExecuted.can_transition_to(TradeSettled));
        assert!(TradeSettled.can_transition_to(Expired));

        assert!(!NewIssue.can_transition_to(Responded));
        assert!(!TradeSettled.can_transition_to(Responded));
        assert!(!TradeCancelled.can_transition_to(Expired));
        assert!(!Expired.can_transition_to(Expired));
        for status in [TradeSettled, TradeExercised, TradeCancelled, TradeExpired, Expired] {
            assert!(status.is_terminal());
            assert!(!status.can_transition_to(Responded));
        }
    }

    #[test]
    fn test_entity_type_accepts_affiliation_codes() {
        assert_eq!("2".parse::<EntityType>().unwrap(), EntityType::Bank);
        assert_eq!("Investor".parse::<EntityType>().unwrap(), EntityType::Investor);
        assert!("broker".parse::<EntityType>().is_err());
    }
}
