//! Trade workflow engine - executes invoke and query commands against the ledger

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::config::{EngineConfig, OnFailure};
use crate::core::{
    AggregateStatus, Caller, Clock, Entity, EntityType, Error, HistoryPolicy, IdentityResolver, Instrument,
    InstrumentStatus, Ioi, Ledger, OrderedUniqueLog, Result, SystemClock, Trade, Transaction,
    TransactionKind,
};
use crate::instruments::{InstrumentBook, IssueTerms};
use crate::ledger::Stage;
use crate::orchestrator::command::{
    self, Command, CommandEntry, CreateIssueArgs, CreateIssueFromIoiArgs, RegisterEntityArgs, RequestForIssueArgs,
    RequestIoiArgs, RespondArgs, Surface, TradeExecArgs, TradeSettleArgs,
};
use crate::registry::{EntityRegistry, is_reserved_key};
use crate::sequence::{Sequence, SequenceAllocator};
use crate::transactions::{TransactionDraft, TransactionLedger, status_key};

pub struct Engine {
    ledger: Arc<dyn Ledger>,
    identity: Arc<dyn IdentityResolver>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    allocator: SequenceAllocator,
    registry: EntityRegistry,
    transactions: TransactionLedger,
    instruments: InstrumentBook,
}

fn signed(quantity: u64) -> Result<i64> {
    i64::try_from(quantity).map_err(|_| Error::invalid_argument("quantity", format!("{} is too large", quantity)))
}

/// Issuers and banks accrue commission; investors are charged it.
fn signed_commission(kind: EntityType, commission: Decimal) -> Decimal {
    if kind.earns_commission() { commission } else { -commission }
}

fn require_role(caller: &Caller, allowed: &[EntityType], action: &str) -> Result<()> {
    if !allowed.contains(&caller.role) {
        return Err(Error::Forbidden(format!(
            "{} ({}) may not {}",
            caller.username, caller.role, action
        )));
    }
    Ok(())
}

fn require_owner(caller: &Caller, instrument: &Instrument) -> Result<()> {
    if caller.username != instrument.owner {
        return Err(Error::Forbidden(format!(
            "{} does not own {} (owner {})",
            caller.username, instrument.symbol, instrument.owner
        )));
    }
    Ok(())
}

fn require_issuer_or_regulator(caller: &Caller, instrument: &Instrument) -> Result<()> {
    if caller.username != instrument.issuer_id && caller.role != EntityType::Regulator {
        return Err(Error::Forbidden(format!(
            "{} is not the issuer of {}",
            caller.username, instrument.symbol
        )));
    }
    Ok(())
}

impl Engine {
    pub fn new(ledger: Arc<dyn Ledger>, identity: Arc<dyn IdentityResolver>, config: EngineConfig) -> Self {
        let allocator = SequenceAllocator::new(config.sequence, config.cas_retries);
        Self {
            ledger,
            identity,
            clock: Arc::new(SystemClock),
            allocator,
            registry: EntityRegistry::new(config.instrument_history),
            transactions: TransactionLedger::new(allocator, config.failure_records),
            instruments: InstrumentBook::new(config.commission_rate),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run a read-write command.
    ///
    /// Returns the created ID or symbol, or `None` when a failure was
    /// recorded in place of the operation's transaction.
    pub fn invoke(&self, function: &str, args: &[String]) -> Result<Option<Vec<u8>>> {
        let entry = command::lookup(function, Surface::Invoke)?;
        let command = Command::parse(entry, args)?;
        let caller = self.identity.resolve_caller(self.ledger.as_ref())?;
        debug!(function, caller = %caller.username, role = %caller.role, "invoke");

        let mut stage = Stage::new(self.ledger.as_ref());
        let mut intended = None;
        match self.execute(&mut stage, &mut intended, &caller, entry, command) {
            Ok(payload) => {
                let writes = stage.commit(self.config.optimistic_commit)?;
                info!(function, caller = %caller.username, writes, "invoke complete");
                Ok(Some(payload))
            }
            Err(err) => self.fail(entry, stage, intended, err),
        }
    }

    fn fail(
        &self,
        entry: &CommandEntry,
        stage: Stage<'_>,
        intended: Option<String>,
        err: Error,
    ) -> Result<Option<Vec<u8>>> {
        match self.config.on_failure {
            OnFailure::Keep => {
                let kept = stage.commit(self.config.optimistic_commit)?;
                if kept > 0 {
                    warn!(function = entry.name, kept, "writes before the failure point kept");
                }
            }
            OnFailure::Discard => {
                let dropped = stage.discard();
                debug!(function = entry.name, dropped, "staged writes discarded");
            }
        }

        match intended {
            Some(id) if entry.policy.records(&err) => {
                let key = self
                    .transactions
                    .record_failure(self.ledger.as_ref(), &id, &err.to_string())?;
                warn!(function = entry.name, tx = %id, key = %key, error = %err, "failure recorded");
                Ok(None)
            }
            _ => {
                warn!(function = entry.name, error = %err, "invoke failed");
                Err(err)
            }
        }
    }

    fn execute(
        &self,
        stage: &mut Stage<'_>,
        intended: &mut Option<String>,
        caller: &Caller,
        entry: &CommandEntry,
        command: Command,
    ) -> Result<Vec<u8>> {
        match command {
            Command::RegisterEntity(args) => self.register_entity(stage, caller, args),
            Command::RequestIoi(args) => self.request_ioi(stage, caller, args),
            Command::CreateIssue(args) => self.create_issue(stage, caller, args),
            Command::CreateIssueFromIoi(args) => self.create_issue_from_ioi(stage, caller, args),
            Command::RequestForIssue(args) => self.request_for_issue(stage, intended, caller, args),
            Command::RespondToIssue(args) => self.respond_to_issue(stage, intended, caller, args),
            Command::TradeExec(args) => self.trade_exec(stage, intended, caller, args),
            Command::TradeSettle(args) => self.trade_settle(stage, intended, args),
            Command::PayCoupon { symbol } => self.pay_coupon(stage, caller, &symbol),
            Command::CallOut { symbol } => self.call_out(stage, caller, &symbol),
            _ => Err(Error::UnknownFunction(entry.name.to_string())),
        }
    }

    /// Append `transaction_id` to each distinct party's trade history.
    fn record_parties(&self, stage: &mut Stage<'_>, parties: &[&str], transaction_id: &str) -> Result<()> {
        let mut seen: Vec<&str> = Vec::with_capacity(parties.len());
        for party in parties {
            if seen.contains(party) {
                continue;
            }
            seen.push(party);
            self.registry.append_trade_history(stage, party, transaction_id)?;
        }
        Ok(())
    }

    fn register_entity(&self, stage: &mut Stage<'_>, caller: &Caller, args: RegisterEntityArgs) -> Result<Vec<u8>> {
        require_role(caller, &[EntityType::Regulator], "register entities")?;
        let entity = Entity::new(args.id, args.name, args.kind, args.balance);
        self.registry.register(stage, &entity)?;
        info!(entity = %entity.id, kind = %entity.kind, balance = %entity.balance, "entity registered");
        Ok(entity.id.into_bytes())
    }

    fn request_ioi(&self, stage: &mut Stage<'_>, caller: &Caller, args: RequestIoiArgs) -> Result<Vec<u8>> {
        require_role(caller, &[EntityType::Bank, EntityType::Investor], "request an IOI")?;
        if args.quantity == 0 {
            return Err(Error::invalid_argument("quantity", "must be positive"));
        }
        let today = self.clock.today();
        if args.settlement_date < today {
            return Err(Error::SettlementExpired {
                settlement: args.settlement_date.to_string(),
                today: today.to_string(),
            });
        }
        let issuer = self.registry.get(stage, &args.issuer_id)?;
        if issuer.kind != EntityType::Issuer {
            return Err(Error::invalid_argument(
                "issuerID",
                format!("{} is a {}, not an issuer", issuer.id, issuer.kind),
            ));
        }
        let requester = self.registry.get(stage, &caller.username)?;

        let ioi_res = self.allocator.reserve(stage, Sequence::Ioi)?;
        let tx_res = self.transactions.reserve(stage)?;

        let mut ioi = Ioi {
            id: ioi_res.id.clone(),
            requester: requester.id.clone(),
            issuer: issuer.id.clone(),
            quantity: args.quantity,
            rate: args.rate,
            settlement_date: args.settlement_date,
            status: AggregateStatus::New,
            symbol: None,
            transaction_history: OrderedUniqueLog::new(),
        };
        ioi.transaction_history.push(tx_res.id.clone(), HistoryPolicy::Append);
        self.transactions.put_ioi(stage, &ioi)?;
        self.allocator.confirm(stage, &ioi_res);

        for party in [&requester.id, &issuer.id] {
            self.registry.append_ioi(stage, party, &ioi.id)?;
        }
        self.record_parties(stage, &[requester.id.as_str(), issuer.id.as_str()], &tx_res.id)?;

        let draft = TransactionDraft {
            trade_id: ioi.id.clone(),
            kind: TransactionKind::IoiRequest,
            from_user: requester.id.clone(),
            to_user: issuer.id.clone(),
            quantity: args.quantity,
            rate: args.rate,
            settlement_date: Some(args.settlement_date),
            status: "New".into(),
            ..Default::default()
        };
        self.transactions.write(stage, &tx_res, draft, self.clock.now())?;

        info!(ioi = %ioi.id, requester = %requester.id, issuer = %issuer.id, quantity = args.quantity, "IOI requested");
        Ok(ioi.id.into_bytes())
    }

    fn create_issue(&self, stage: &mut Stage<'_>, caller: &Caller, args: CreateIssueArgs) -> Result<Vec<u8>> {
        require_role(caller, &[EntityType::Issuer], "create an issue")?;
        let issuer = self.registry.get(stage, &caller.username)?;

        let (symbol, reservation) = match args.symbol {
            Some(symbol) if is_reserved_key(&symbol) => {
                return Err(Error::invalid_argument(
                    "symbol",
                    format!("{} collides with a generated ledger key", symbol),
                ));
            }
            Some(symbol) => (symbol, None),
            None => {
                let reservation = self.allocator.reserve(stage, Sequence::Instrument)?;
                (reservation.id.clone(), Some(reservation))
            }
        };

        let terms = IssueTerms {
            symbol,
            coupon: args.coupon,
            quantity: args.quantity,
            price: args.price,
            rate: args.rate,
            settlement_date: args.settlement_date,
            issue_date: args.issue_date,
            callable: args.callable,
            issuer_id: issuer.id.clone(),
            bank_id: None,
            ioi_id: None,
            description: None,
        };
        let instrument = self
            .instruments
            .create(stage, &issuer.id, terms, InstrumentStatus::NewIssue)?;

        self.registry.adjust_holding(
            stage,
            &issuer.id,
            &instrument.symbol,
            &issuer.id,
            signed(instrument.quantity)?,
            Decimal::ZERO,
        )?;
        self.registry
            .append_instrument_history(stage, &issuer.id, &instrument.symbol)?;
        if let Some(reservation) = reservation {
            self.allocator.confirm(stage, &reservation);
        }

        info!(
            symbol = %instrument.symbol,
            issuer = %issuer.id,
            quantity = instrument.quantity,
            price = %instrument.price,
            "issue created"
        );
        Ok(instrument.symbol.into_bytes())
    }

    fn create_issue_from_ioi(
        &self,
        stage: &mut Stage<'_>,
        caller: &Caller,
        args: CreateIssueFromIoiArgs,
    ) -> Result<Vec<u8>> {
        let mut ioi = self.transactions.get_ioi(stage, &args.ioi_id)?;
        if caller.username != ioi.requester {
            return Err(Error::Forbidden(format!(
                "{} did not request {}",
                caller.username, ioi.id
            )));
        }
        if ioi.status != AggregateStatus::New {
            return Err(Error::invalid_argument(
                "ioiID",
                format!("{} is already {:?}", ioi.id, ioi.status),
            ));
        }
        let creator = self.registry.get(stage, &caller.username)?;

        let inst_res = self.allocator.reserve(stage, Sequence::Instrument)?;
        let trade_res = self.allocator.reserve(stage, Sequence::Trade)?;
        let tx_res = self.transactions.reserve(stage)?;
        let symbol = format!("{}-{}", ioi.issuer, inst_res.value);

        let terms = IssueTerms {
            symbol,
            coupon: args.coupon,
            quantity: ioi.quantity,
            price: args.price,
            rate: ioi.rate,
            settlement_date: ioi.settlement_date,
            issue_date: args.issue_date,
            callable: args.callable,
            issuer_id: ioi.issuer.clone(),
            bank_id: (creator.kind == EntityType::Bank).then(|| creator.id.clone()),
            ioi_id: Some(ioi.id.clone()),
            description: Some(format!("Issued against {}", ioi.id)),
        };
        let mut instrument = self
            .instruments
            .create(stage, &creator.id, terms, InstrumentStatus::PublishedToBank)?;
        self.instruments.reference(&mut instrument, &tx_res.id);
        self.instruments.put(stage, &instrument)?;
        self.allocator.confirm(stage, &inst_res);

        self.registry.adjust_holding(
            stage,
            &ioi.issuer,
            &instrument.symbol,
            &ioi.issuer,
            signed(instrument.quantity)?,
            Decimal::ZERO,
        )?;

        let mut trade = Trade {
            id: trade_res.id.clone(),
            symbol: instrument.symbol.clone(),
            buyer: creator.id.clone(),
            seller: ioi.issuer.clone(),
            quantity: instrument.quantity,
            price: instrument.price,
            status: AggregateStatus::New,
            transaction_history: OrderedUniqueLog::new(),
        };
        trade.record(&tx_res.id, AggregateStatus::New);
        self.transactions.put_trade(stage, &trade)?;
        self.allocator.confirm(stage, &trade_res);

        ioi.symbol = Some(instrument.symbol.clone());
        ioi.status = AggregateStatus::Responded;
        ioi.transaction_history.push(tx_res.id.clone(), HistoryPolicy::Append);
        self.transactions.put_ioi(stage, &ioi)?;

        for party in [&creator.id, &ioi.issuer] {
            self.registry
                .append_instrument_history(stage, party, &instrument.symbol)?;
        }
        self.record_parties(stage, &[creator.id.as_str(), ioi.issuer.as_str()], &tx_res.id)?;

        let draft = TransactionDraft {
            trade_id: trade.id.clone(),
            kind: TransactionKind::IoiIssue,
            from_user: ioi.issuer.clone(),
            to_user: creator.id.clone(),
            symbol: instrument.symbol.clone(),
            quantity: instrument.quantity,
            price: instrument.price,
            rate: instrument.rate,
            settlement_date: Some(instrument.settlement_date),
            status: InstrumentStatus::PublishedToBank.to_string(),
        };
        self.transactions.write(stage, &tx_res, draft, self.clock.now())?;

        info!(symbol = %instrument.symbol, ioi = %ioi.id, trade = %trade.id, "issue created from IOI");
        Ok(instrument.symbol.into_bytes())
    }

    fn request_for_issue(
        &self,
        stage: &mut Stage<'_>,
        intended: &mut Option<String>,
        caller: &Caller,
        args: RequestForIssueArgs,
    ) -> Result<Vec<u8>> {
        let tx_res = self.transactions.reserve(stage)?;
        *intended = Some(tx_res.id.clone());

        let mut instrument = self.instruments.get(stage, &args.symbol)?;
        require_owner(caller, &instrument)?;
        let to = self.registry.get(stage, &args.to_user)?;
        if to.id == instrument.owner {
            return Err(Error::invalid_argument("toUser", "already owns the instrument"));
        }

        let trade_res = self.allocator.reserve(stage, Sequence::Trade)?;
        let seller = instrument.owner.clone();
        self.instruments.publish(&mut instrument, &to.id, &tx_res.id)?;
        if to.kind == EntityType::Bank {
            instrument.bank_id = Some(to.id.clone());
        }
        self.instruments.put(stage, &instrument)?;

        let mut trade = Trade {
            id: trade_res.id.clone(),
            symbol: instrument.symbol.clone(),
            buyer: to.id.clone(),
            seller: seller.clone(),
            quantity: instrument.quantity,
            price: instrument.price,
            status: AggregateStatus::New,
            transaction_history: OrderedUniqueLog::new(),
        };
        trade.record(&tx_res.id, AggregateStatus::New);
        self.transactions.put_trade(stage, &trade)?;
        self.allocator.confirm(stage, &trade_res);

        self.record_parties(stage, &[seller.as_str(), to.id.as_str()], &tx_res.id)?;
        self.registry
            .append_instrument_history(stage, &to.id, &instrument.symbol)?;

        let draft = TransactionDraft {
            trade_id: trade.id.clone(),
            kind: TransactionKind::Publish,
            from_user: seller.clone(),
            to_user: to.id.clone(),
            symbol: instrument.symbol.clone(),
            quantity: instrument.quantity,
            price: instrument.price,
            rate: instrument.rate,
            settlement_date: Some(instrument.settlement_date),
            status: instrument.status.to_string(),
        };
        self.transactions.write(stage, &tx_res, draft, self.clock.now())?;

        info!(symbol = %instrument.symbol, from = %seller, to = %to.id, tx = %tx_res.id, "issue published");
        Ok(tx_res.id.into_bytes())
    }

    fn respond_to_issue(
        &self,
        stage: &mut Stage<'_>,
        intended: &mut Option<String>,
        caller: &Caller,
        args: RespondArgs,
    ) -> Result<Vec<u8>> {
        let tx_res = self.transactions.reserve(stage)?;
        *intended = Some(tx_res.id.clone());

        let mut instrument = self.instruments.get(stage, &args.symbol)?;
        require_owner(caller, &instrument)?;
        if args.quantity > instrument.quantity {
            return Err(Error::QuantityExceeded {
                requested: args.quantity,
                available: instrument.quantity,
            });
        }

        let offer = self.instruments.active_offer(stage, &instrument)?;
        let mut trade = self.transactions.get_trade(stage, &offer.trade_id)?;
        let counterpart = offer.from_user;

        let status = if args.accept {
            self.instruments
                .transition(&mut instrument, InstrumentStatus::Responded)?;
            let amount = self.instruments.response_amount(args.quantity, args.price)?;
            self.registry
                .update_balance(stage, &caller.username, -amount)?;
            self.registry.update_balance(stage, &counterpart, amount)?;
            instrument.response_quantity = args.quantity;
            trade.quantity = args.quantity;
            trade.price = args.price;
            trade.record(&tx_res.id, AggregateStatus::Responded);
            info!(symbol = %instrument.symbol, responder = %caller.username, counterpart = %counterpart, %amount, "offer accepted");
            InstrumentStatus::Responded
        } else {
            self.instruments
                .transition(&mut instrument, InstrumentStatus::TradeCancelled)?;
            trade.record(&tx_res.id, AggregateStatus::Cancelled);
            info!(symbol = %instrument.symbol, responder = %caller.username, "offer declined");
            InstrumentStatus::TradeCancelled
        };

        instrument.owner = caller.username.clone();
        self.instruments.reference(&mut instrument, &tx_res.id);
        self.instruments.put(stage, &instrument)?;
        self.transactions.put_trade(stage, &trade)?;
        self.record_parties(stage, &[caller.username.as_str(), counterpart.as_str()], &tx_res.id)?;

        let draft = TransactionDraft {
            trade_id: trade.id.clone(),
            kind: TransactionKind::Response,
            from_user: caller.username.clone(),
            to_user: counterpart,
            symbol: instrument.symbol.clone(),
            quantity: args.quantity,
            price: args.price,
            rate: instrument.rate,
            settlement_date: Some(instrument.settlement_date),
            status: status.to_string(),
        };
        self.transactions.write(stage, &tx_res, draft, self.clock.now())?;
        Ok(tx_res.id.into_bytes())
    }

    fn trade_exec(
        &self,
        stage: &mut Stage<'_>,
        intended: &mut Option<String>,
        caller: &Caller,
        args: TradeExecArgs,
    ) -> Result<Vec<u8>> {
        let tx_res = self.transactions.reserve(stage)?;
        *intended = Some(tx_res.id.clone());

        let mut instrument = self.instruments.get(stage, &args.symbol)?;
        let quote = self.transactions.get(stage, &args.quote_transaction_id)?;
        if quote.trade_id != args.trade_id {
            return Err(Error::TradeIdMismatch {
                expected: args.trade_id,
                actual: quote.trade_id,
            });
        }
        let today = self.clock.today();
        if let Some(settlement) = quote.settlement_date.filter(|date| *date < today) {
            return Err(Error::SettlementExpired {
                settlement: settlement.to_string(),
                today: today.to_string(),
            });
        }
        if quote.kind != TransactionKind::Response || quote.symbol != instrument.symbol {
            return Err(Error::invalid_argument(
                "quoteTransactionID",
                format!("{} is not a response on {}", quote.id, instrument.symbol),
            ));
        }

        let mut trade = self.transactions.get_trade(stage, &args.trade_id)?;
        let buyer = self.registry.get(stage, &quote.from_user)?;
        let seller = self.registry.get(stage, &quote.to_user)?;

        let (kind, status) = if args.confirm {
            self.instruments
                .transition(&mut instrument, InstrumentStatus::TradeExecuted)?;
            let quantity = signed(quote.quantity)?;
            let commission = self.instruments.commission(quote.quantity, quote.price)?;
            self.registry.adjust_holding(
                stage,
                &seller.id,
                &instrument.symbol,
                &buyer.id,
                -quantity,
                signed_commission(seller.kind, commission),
            )?;
            self.registry.adjust_holding(
                stage,
                &buyer.id,
                &instrument.symbol,
                &seller.id,
                quantity,
                signed_commission(buyer.kind, commission),
            )?;
            trade.record(&tx_res.id, AggregateStatus::Executed);
            (TransactionKind::Execute, InstrumentStatus::TradeExecuted)
        } else {
            self.instruments
                .transition(&mut instrument, InstrumentStatus::TradeCancelled)?;
            trade.record(&tx_res.id, AggregateStatus::Cancelled);
            (TransactionKind::Cancel, InstrumentStatus::TradeCancelled)
        };

        self.instruments.reference(&mut instrument, &tx_res.id);
        self.instruments.put(stage, &instrument)?;
        self.transactions.put_trade(stage, &trade)?;
        self.record_parties(stage, &[buyer.id.as_str(), seller.id.as_str()], &tx_res.id)?;

        let draft = TransactionDraft {
            trade_id: trade.id.clone(),
            kind,
            from_user: buyer.id.clone(),
            to_user: seller.id.clone(),
            symbol: instrument.symbol.clone(),
            quantity: quote.quantity,
            price: quote.price,
            rate: instrument.rate,
            settlement_date: quote.settlement_date,
            status: status.to_string(),
        };
        self.transactions.write(stage, &tx_res, draft, self.clock.now())?;

        info!(symbol = %instrument.symbol, trade = %trade.id, by = %caller.username, status = %status, "trade decided");
        Ok(tx_res.id.into_bytes())
    }

    fn trade_settle(
        &self,
        stage: &mut Stage<'_>,
        intended: &mut Option<String>,
        args: TradeSettleArgs,
    ) -> Result<Vec<u8>> {
        let tx_res = self.transactions.reserve(stage)?;
        *intended = Some(tx_res.id.clone());

        let mut instrument = self.instruments.get(stage, &args.symbol)?;
        let mut trade = self.transactions.get_trade(stage, &args.trade_id)?;
        if trade.symbol != instrument.symbol {
            return Err(Error::invalid_argument(
                "tradeID",
                format!("{} belongs to {}", trade.id, trade.symbol),
            ));
        }

        let (next, aggregate) = if self.clock.today() > instrument.settlement_date {
            (InstrumentStatus::TradeExpired, AggregateStatus::Expired)
        } else {
            (InstrumentStatus::TradeSettled, AggregateStatus::Settled)
        };
        self.instruments.transition(&mut instrument, next)?;
        trade.record(&tx_res.id, aggregate);

        self.instruments.reference(&mut instrument, &tx_res.id);
        self.instruments.put(stage, &instrument)?;
        self.transactions.put_trade(stage, &trade)?;
        self.record_parties(stage, &[trade.buyer.as_str(), trade.seller.as_str()], &tx_res.id)?;

        let draft = TransactionDraft {
            trade_id: trade.id.clone(),
            kind: TransactionKind::Settle,
            from_user: trade.seller.clone(),
            to_user: trade.buyer.clone(),
            symbol: instrument.symbol.clone(),
            quantity: trade.quantity,
            price: trade.price,
            rate: instrument.rate,
            settlement_date: Some(instrument.settlement_date),
            status: next.to_string(),
        };
        self.transactions.write(stage, &tx_res, draft, self.clock.now())?;

        info!(symbol = %instrument.symbol, trade = %trade.id, status = %next, "trade settled");
        Ok(tx_res.id.into_bytes())
    }

    fn pay_coupon(&self, stage: &mut Stage<'_>, caller: &Caller, symbol: &str) -> Result<Vec<u8>> {
        let mut instrument = self.instruments.get(stage, symbol)?;
        require_issuer_or_regulator(caller, &instrument)?;
        if matches!(
            instrument.status,
            InstrumentStatus::Expired | InstrumentStatus::TradeCancelled
        ) {
            return Err(Error::invalid_argument(
                "symbol",
                format!("{} is {}", instrument.symbol, instrument.status),
            ));
        }

        let amount = self.instruments.coupon_amount(&instrument)?;
        let tx_res = self.transactions.reserve(stage)?;
        let issuer = instrument.issuer_id.clone();
        let owner = instrument.owner.clone();
        self.registry.update_balance(stage, &issuer, -amount)?;
        self.registry.update_balance(stage, &owner, amount)?;

        self.instruments.reference(&mut instrument, &tx_res.id);
        self.instruments.put(stage, &instrument)?;
        self.record_parties(stage, &[issuer.as_str(), owner.as_str()], &tx_res.id)?;

        // price carries the cash moved
        let draft = TransactionDraft {
            kind: TransactionKind::Coupon,
            from_user: issuer.clone(),
            to_user: owner.clone(),
            symbol: instrument.symbol.clone(),
            quantity: instrument.quantity,
            price: amount,
            rate: instrument.rate,
            settlement_date: Some(instrument.settlement_date),
            status: "Coupon Paid".into(),
            ..Default::default()
        };
        self.transactions.write(stage, &tx_res, draft, self.clock.now())?;

        info!(symbol, %issuer, %owner, %amount, "coupon paid");
        Ok(tx_res.id.into_bytes())
    }

    fn call_out(&self, stage: &mut Stage<'_>, caller: &Caller, symbol: &str) -> Result<Vec<u8>> {
        let mut instrument = self.instruments.get(stage, symbol)?;
        require_issuer_or_regulator(caller, &instrument)?;
        if !instrument.callable {
            return Err(Error::NotCallable(instrument.symbol));
        }
        self.instruments
            .transition(&mut instrument, InstrumentStatus::Expired)?;

        let amount = self.instruments.call_out_amount(&instrument)?;
        let tx_res = self.transactions.reserve(stage)?;
        let issuer = instrument.issuer_id.clone();
        let holder = instrument.owner.clone();
        self.registry.update_balance(stage, &issuer, -amount)?;
        self.registry.update_balance(stage, &holder, amount)?;

        instrument.owner = issuer.clone();
        self.instruments.reference(&mut instrument, &tx_res.id);
        self.instruments.put(stage, &instrument)?;
        self.record_parties(stage, &[issuer.as_str(), holder.as_str()], &tx_res.id)?;

        let draft = TransactionDraft {
            kind: TransactionKind::CallOut,
            from_user: issuer.clone(),
            to_user: holder.clone(),
            symbol: instrument.symbol.clone(),
            quantity: instrument.quantity,
            price: amount,
            rate: instrument.rate,
            settlement_date: Some(instrument.settlement_date),
            status: instrument.status.to_string(),
            ..Default::default()
        };
        self.transactions.write(stage, &tx_res, draft, self.clock.now())?;

        info!(symbol, %issuer, %holder, %amount, "instrument called out");
        Ok(tx_res.id.into_bytes())
    }

    /// Run a read-only command; the result is JSON except for `read`.
    pub fn query(&self, function: &str, args: &[String]) -> Result<Vec<u8>> {
        let entry = command::lookup(function, Surface::Query)?;
        let command = Command::parse(entry, args)?;
        debug!(function, "query");

        let mut stage = Stage::new(self.ledger.as_ref());
        let out = match command {
            Command::Read { key } => stage.get(&key)?.ok_or(Error::NotFound(key))?,
            Command::GetEntity { id } => serde_json::to_vec(&self.registry.get(&mut stage, &id)?)?,
            Command::GetEntityList => serde_json::to_vec(&self.registry.list(&mut stage)?)?,
            Command::GetPortfolio { id } => serde_json::to_vec(&self.registry.get(&mut stage, &id)?.portfolio)?,
            Command::GetInstrument { symbol } => serde_json::to_vec(&self.instruments.get(&mut stage, &symbol)?)?,
            Command::GetTransaction { id } => serde_json::to_vec(&self.transactions.get(&mut stage, &id)?)?,
            Command::GetTransactionStatus { id } => {
                let status = self.transactions.status(&mut stage, &id)?;
                serde_json::to_vec(&serde_json::json!({ "id": id, "status": status }))?
            }
            Command::GetTrade { id } => serde_json::to_vec(&self.transactions.get_trade(&mut stage, &id)?)?,
            Command::GetIoi { id } => serde_json::to_vec(&self.transactions.get_ioi(&mut stage, &id)?)?,
            Command::GetTradeHistory { id } => {
                let entity = self.registry.get(&mut stage, &id)?;
                serde_json::to_vec(&self.resolve(&mut stage, entity.trade_history.iter())?)?
            }
            Command::GetInstrumentHistory { symbol } => {
                let instrument = self.instruments.get(&mut stage, &symbol)?;
                serde_json::to_vec(&self.resolve(&mut stage, instrument.trade_refs.iter())?)?
            }
            _ => return Err(Error::UnknownFunction(entry.name.to_string())),
        };
        stage.discard();
        Ok(out)
    }

    /// Load referenced transactions, substituting failure records where no
    /// success record exists. References to nothing are skipped.
    fn resolve<'a>(
        &self,
        stage: &mut Stage<'_>,
        ids: impl Iterator<Item = &'a String>,
    ) -> Result<Vec<Transaction>> {
        let mut out = Vec::new();
        for id in ids {
            if let Some(tx) = stage.get_json::<Transaction>(id)? {
                out.push(tx);
            } else if let Some(tx) = stage.get_json::<Transaction>(&status_key(id))? {
                out.push(tx);
            }
        }
        Ok(out)
    }
}
