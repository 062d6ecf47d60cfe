//! Invocation surface - dispatch table and typed commands

use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::core::{EntityType, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    /// May write
    Invoke,
    /// Read-only
    Query,
}

/// What happens to a domain failure raised after arguments are parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Returned to the caller
    Propagate,
    /// Converted into a failure record and an empty response
    RecordAll,
    /// As `RecordAll`, except quantity and funds failures are returned
    RecordExceptFunds,
}

impl FailurePolicy {
    pub fn records(&self, err: &Error) -> bool {
        let domain = !matches!(
            err,
            Error::Storage(_)
                | Error::Io(_)
                | Error::Serialization(_)
                | Error::VersionConflict(_)
                | Error::NotInitialized(_)
                | Error::Config(_)
        );
        match self {
            FailurePolicy::Propagate => false,
            FailurePolicy::RecordAll => domain,
            FailurePolicy::RecordExceptFunds => {
                domain && !matches!(err, Error::QuantityExceeded { .. } | Error::InsufficientFunds { .. })
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CommandEntry {
    pub name: &'static str,
    pub surface: Surface,
    pub arity: usize,
    pub policy: FailurePolicy,
}

const fn invoke(name: &'static str, arity: usize, policy: FailurePolicy) -> CommandEntry {
    CommandEntry {
        name,
        surface: Surface::Invoke,
        arity,
        policy,
    }
}

const fn query(name: &'static str, arity: usize) -> CommandEntry {
    CommandEntry {
        name,
        surface: Surface::Query,
        arity,
        policy: FailurePolicy::Propagate,
    }
}

pub static COMMANDS: &[CommandEntry] = &[
    invoke("registerEntity", 4, FailurePolicy::Propagate),
    invoke("requestIOI", 4, FailurePolicy::Propagate),
    invoke("createIssue", 8, FailurePolicy::Propagate),
    invoke("createIssueFromIoi", 5, FailurePolicy::Propagate),
    invoke("requestForIssue", 2, FailurePolicy::RecordAll),
    invoke("respondToIssue", 4, FailurePolicy::RecordExceptFunds),
    invoke("tradeExec", 4, FailurePolicy::RecordAll),
    invoke("tradeSettle", 2, FailurePolicy::RecordAll),
    invoke("payCoupon", 1, FailurePolicy::Propagate),
    invoke("callOut", 1, FailurePolicy::Propagate),
    query("read", 1),
    query("getEntity", 1),
    query("getEntityList", 0),
    query("getPortfolio", 1),
    query("getInstrument", 1),
    query("getTransaction", 1),
    query("getTransactionStatus", 1),
    query("getTrade", 1),
    query("getIoi", 1),
    query("getTradeHistory", 1),
    query("getInstrumentHistory", 1),
];

/// Look `name` up on `surface`; anything else is `UnknownFunction`.
pub fn lookup(name: &str, surface: Surface) -> Result<&'static CommandEntry> {
    COMMANDS
        .iter()
        .find(|entry| entry.name == name && entry.surface == surface)
        .ok_or_else(|| Error::UnknownFunction(name.to_string()))
}

impl CommandEntry {
    pub fn check_arity(&self, args: &[String]) -> Result<()> {
        if args.len() != self.arity {
            return Err(Error::InvalidArgumentCount {
                function: self.name.to_string(),
                expected: self.arity,
                got: args.len(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegisterEntityArgs {
    pub id: String,
    pub name: String,
    pub kind: EntityType,
    pub balance: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestIoiArgs {
    pub issuer_id: String,
    pub quantity: u64,
    pub rate: Decimal,
    pub settlement_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateIssueArgs {
    /// `None` allocates an `INST<N>` symbol
    pub symbol: Option<String>,
    pub coupon: String,
    pub quantity: u64,
    pub rate: Decimal,
    pub price: Decimal,
    pub settlement_date: NaiveDate,
    pub issue_date: NaiveDate,
    pub callable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateIssueFromIoiArgs {
    pub ioi_id: String,
    pub coupon: String,
    pub price: Decimal,
    pub issue_date: NaiveDate,
    pub callable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestForIssueArgs {
    pub symbol: String,
    pub to_user: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RespondArgs {
    pub symbol: String,
    pub accept: bool,
    pub quantity: u64,
    pub price: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradeExecArgs {
    pub symbol: String,
    pub trade_id: String,
    pub quote_transaction_id: String,
    pub confirm: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradeSettleArgs {
    pub symbol: String,
    pub trade_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    RegisterEntity(RegisterEntityArgs),
    RequestIoi(RequestIoiArgs),
    CreateIssue(CreateIssueArgs),
    CreateIssueFromIoi(CreateIssueFromIoiArgs),
    RequestForIssue(RequestForIssueArgs),
    RespondToIssue(RespondArgs),
    TradeExec(TradeExecArgs),
    TradeSettle(TradeSettleArgs),
    PayCoupon { symbol: String },
    CallOut { symbol: String },

    Read { key: String },
    GetEntity { id: String },
    GetEntityList,
    GetPortfolio { id: String },
    GetInstrument { symbol: String },
    GetTransaction { id: String },
    GetTransactionStatus { id: String },
    GetTrade { id: String },
    GetIoi { id: String },
    GetTradeHistory { id: String },
    GetInstrumentHistory { symbol: String },
}

impl Command {
    /// Check arity, then parse each positional argument into its typed form.
    pub fn parse(entry: &CommandEntry, args: &[String]) -> Result<Self> {
        entry.check_arity(args)?;
        let arg = |i: usize| args[i].trim().to_string();

        let command = match entry.name {
            "registerEntity" => Command::RegisterEntity(RegisterEntityArgs {
                id: required("id", &args[0])?,
                name: arg(1),
                kind: args[2].parse()?,
                balance: parse_decimal("balance", &args[3])?,
            }),
            "requestIOI" => Command::RequestIoi(RequestIoiArgs {
                issuer_id: required("issuerID", &args[0])?,
                quantity: parse_quantity("quantity", &args[1])?,
                rate: parse_rate("rate", &args[2])?,
                settlement_date: parse_date("settlementDate", &args[3])?,
            }),
            "createIssue" => Command::CreateIssue(CreateIssueArgs {
                symbol: Some(arg(0)).filter(|s| !s.is_empty()),
                coupon: arg(1),
                quantity: parse_quantity("quantity", &args[2])?,
                rate: parse_rate("rate", &args[3])?,
                price: parse_price("price", &args[4])?,
                settlement_date: parse_date("settlementDate", &args[5])?,
                issue_date: parse_date("issueDate", &args[6])?,
                callable: parse_flag("callable", &args[7])?,
            }),
            "createIssueFromIoi" => Command::CreateIssueFromIoi(CreateIssueFromIoiArgs {
                ioi_id: required("ioiID", &args[0])?,
                coupon: arg(1),
                price: parse_price("price", &args[2])?,
                issue_date: parse_date("issueDate", &args[3])?,
                callable: parse_flag("callable", &args[4])?,
            }),
            "requestForIssue" => Command::RequestForIssue(RequestForIssueArgs {
                symbol: required("symbol", &args[0])?,
                to_user: required("toUser", &args[1])?,
            }),
            "respondToIssue" => Command::RespondToIssue(RespondArgs {
                symbol: required("symbol", &args[0])?,
                accept: parse_flag("response", &args[1])?,
                quantity: parse_lot("quantity", &args[2])?,
                price: parse_price("price", &args[3])?,
            }),
            "tradeExec" => Command::TradeExec(TradeExecArgs {
                symbol: required("symbol", &args[0])?,
                trade_id: required("tradeID", &args[1])?,
                quote_transaction_id: required("quoteTransactionID", &args[2])?,
                confirm: parse_flag("confirm", &args[3])?,
            }),
            "tradeSettle" => Command::TradeSettle(TradeSettleArgs {
                symbol: required("symbol", &args[0])?,
                trade_id: required("tradeID", &args[1])?,
            }),
            "payCoupon" => Command::PayCoupon {
                symbol: required("symbol", &args[0])?,
            },
            "callOut" => Command::CallOut {
                symbol: required("symbol", &args[0])?,
            },
            "read" => Command::Read { key: arg(0) },
            "getEntity" => Command::GetEntity { id: arg(0) },
            "getEntityList" => Command::GetEntityList,
            "getPortfolio" => Command::GetPortfolio { id: arg(0) },
            "getInstrument" => Command::GetInstrument { symbol: arg(0) },
            "getTransaction" => Command::GetTransaction { id: arg(0) },
            "getTransactionStatus" => Command::GetTransactionStatus { id: arg(0) },
            "getTrade" => Command::GetTrade { id: arg(0) },
            "getIoi" => Command::GetIoi { id: arg(0) },
            "getTradeHistory" => Command::GetTradeHistory { id: arg(0) },
            "getInstrumentHistory" => Command::GetInstrumentHistory { symbol: arg(0) },
            other => return Err(Error::UnknownFunction(other.to_string())),
        };
        Ok(command)
    }
}

fn required(name: &'static str, raw: &str) -> Result<String> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(Error::invalid_argument(name, "must not be empty"));
    }
    Ok(value.to_string())
}

fn parse_decimal(name: &'static str, raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw.trim()).map_err(|e| Error::invalid_argument(name, format!("{:?}: {}", raw, e)))
}

fn parse_quantity(name: &'static str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse::<u64>()
        .map_err(|e| Error::invalid_argument(name, format!("{:?}: {}", raw, e)))
}

/// Strictly positive amount per unit
fn parse_price(name: &'static str, raw: &str) -> Result<Decimal> {
    let price = parse_decimal(name, raw)?;
    if price <= Decimal::ZERO {
        return Err(Error::invalid_argument(name, format!("{} must be positive", price)));
    }
    Ok(price)
}

fn parse_rate(name: &'static str, raw: &str) -> Result<Decimal> {
    let rate = parse_decimal(name, raw)?;
    if rate < Decimal::ZERO {
        return Err(Error::invalid_argument(name, format!("{} must not be negative", rate)));
    }
    Ok(rate)
}

/// Quantity that must move at least one unit
fn parse_lot(name: &'static str, raw: &str) -> Result<u64> {
    match parse_quantity(name, raw)? {
        0 => Err(Error::invalid_argument(name, "must be positive")),
        n => Ok(n),
    }
}

fn parse_date(name: &'static str, raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|e| Error::invalid_argument(name, format!("{:?}: {}", raw, e)))
}

/// yes/no, true/false, y/n in any case
fn parse_flag(name: &'static str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "yes" | "y" | "true" => Ok(true),
        "no" | "n" | "false" => Ok(false),
        _ => Err(Error::invalid_argument(name, format!("{:?} is not yes/no", raw))),
    }
}
