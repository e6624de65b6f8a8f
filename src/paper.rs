//! Paper venue - in-process simulated trading venue
//!
//! Implements [`Transport`] without any wire protocol: accounts and offers
//! come from [`PaperConfig`], orders are accepted (or rejected) on the spot,
//! and every outcome is published on the bus from a single notifier thread,
//! the way a real venue pushes events from its own delivery context.

use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::config::PaperConfig;
use crate::core::{
    Credentials, Error, RequestId, Result, SessionStatus, TableKind, TradingSessionDescriptor,
    Transport, columns,
};
use crate::events::{EventBus, ResponseEvent, StatusEvent};
use crate::requests::order::params;
use crate::requests::{ValueMap, WireRequest};
use crate::tables::{Row, SUBSCRIPTION_DISABLED, SUBSCRIPTION_TRADABLE, TableUpdate};

/// Failure injection for tests and demos.
#[derive(Debug, Clone, Default)]
pub struct PaperBehavior {
    /// Login fails unless the password matches
    pub password: Option<String>,
    /// Leg indexes (order of `terminal_ids`) the venue rejects
    pub reject_legs: HashSet<usize>,
    /// Leg indexes the venue accepts but never reports
    pub silent_legs: HashSet<usize>,
    /// Reject composites at the parent level
    pub reject_parent: bool,
    /// Table whose bulk load fails
    pub fail_table: Option<TableKind>,
    /// Refuse to create requests (no id is obtained)
    pub refuse_requests: bool,
}

enum Notice {
    Status(StatusEvent),
    Response(ResponseEvent),
}

struct VenueState {
    status: SessionStatus,
    accounts: Vec<Row>,
    offers: Vec<Row>,
    orders: Vec<Row>,
    trades: Vec<Row>,
    next_order: u64,
    ticks: u64,
}

pub struct PaperVenue {
    config: PaperConfig,
    bus: Arc<EventBus>,
    state: Mutex<VenueState>,
    behavior: Mutex<PaperBehavior>,
    outbox: Mutex<Option<flume::Sender<Notice>>>,
    notifier: Mutex<Option<JoinHandle<()>>>,
}

impl PaperVenue {
    pub fn new(config: PaperConfig) -> Result<Self> {
        let bus = Arc::new(EventBus::new());
        let (tx, rx) = flume::unbounded::<Notice>();

        let notifier_bus = bus.clone();
        let notifier = std::thread::Builder::new()
            .name("paper-notifier".into())
            .spawn(move || {
                while let Ok(notice) = rx.recv() {
                    match notice {
                        Notice::Status(event) => notifier_bus.publish_status(event),
                        Notice::Response(event) => notifier_bus.publish_response(event),
                    }
                }
            })
            .map_err(|e| Error::Transport(format!("failed to spawn notifier: {}", e)))?;

        let state = VenueState {
            status: SessionStatus::Disconnected,
            accounts: config.accounts.iter().map(account_row).collect(),
            offers: config.offers.iter().map(offer_row).collect(),
            orders: Vec::new(),
            trades: Vec::new(),
            next_order: 1,
            ticks: 0,
        };

        info!(
            "paper venue ready: {} accounts, {} offers",
            state.accounts.len(),
            state.offers.len()
        );
        Ok(Self {
            config,
            bus,
            state: Mutex::new(state),
            behavior: Mutex::new(PaperBehavior::default()),
            outbox: Mutex::new(Some(tx)),
            notifier: Mutex::new(Some(notifier)),
        })
    }

    pub fn with_behavior(self, behavior: PaperBehavior) -> Self {
        *self.behavior.lock() = behavior;
        self
    }

    pub fn set_behavior(&self, behavior: PaperBehavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn status(&self) -> SessionStatus {
        self.state.lock().status
    }

    /// Push a status change the venue decided on its own (e.g. a dropped link).
    pub fn emit_status(&self, status: SessionStatus) {
        self.state.lock().status = status;
        self.post(Notice::Status(StatusEvent::Changed(status)));
    }

    /// Move one offer's prices and stream the update.
    pub fn set_prices(&self, offer_id: &str, bid: Decimal, ask: Decimal) -> Result<()> {
        let mut state = self.state.lock();
        let offer = state
            .offers
            .iter_mut()
            .find(|o| o.id() == offer_id)
            .ok_or_else(|| Error::Validation(format!("unknown offer {}", offer_id)))?;
        offer.set(columns::BID, bid);
        offer.set(columns::ASK, ask);

        let update = Row::new(TableKind::Offers, offer_id)
            .with(columns::BID, bid)
            .with(columns::ASK, ask);
        self.post(Notice::Response(ResponseEvent::TablesUpdates(vec![TableUpdate::update(update)])));
        Ok(())
    }

    /// Switch an offer's subscription off; consumers see it disappear.
    pub fn disable_offer(&self, offer_id: &str) {
        let mut state = self.state.lock();
        if let Some(offer) = state.offers.iter_mut().find(|o| o.id() == offer_id) {
            offer.set(columns::SUBSCRIPTION_STATUS, SUBSCRIPTION_DISABLED);
        }
        let update =
            Row::new(TableKind::Offers, offer_id).with(columns::SUBSCRIPTION_STATUS, SUBSCRIPTION_DISABLED);
        self.post(Notice::Response(ResponseEvent::TablesUpdates(vec![TableUpdate::update(update)])));
    }

    /// Nudge every tradable offer by a pip or two in a fixed pattern.
    pub fn tick(&self) {
        const STEPS: [i64; 6] = [1, 2, -1, -3, 2, -1];
        let mut state = self.state.lock();
        state.ticks += 1;
        let ticks = state.ticks;

        let mut updates = Vec::new();
        for (i, offer) in state.offers.iter_mut().enumerate() {
            if offer.str(columns::SUBSCRIPTION_STATUS) != Some(SUBSCRIPTION_TRADABLE) {
                continue;
            }
            let (Some(bid), Some(ask), Some(point)) = (
                offer.decimal(columns::BID),
                offer.decimal(columns::ASK),
                offer.decimal(columns::POINT_SIZE),
            ) else {
                continue;
            };
            let step = Decimal::from(STEPS[(ticks as usize + i) % STEPS.len()]) * point;
            offer.set(columns::BID, bid + step);
            offer.set(columns::ASK, ask + step);
            updates.push(TableUpdate::update(
                Row::new(TableKind::Offers, offer.id())
                    .with(columns::BID, bid + step)
                    .with(columns::ASK, ask + step),
            ));
        }
        if !updates.is_empty() {
            self.post(Notice::Response(ResponseEvent::TablesUpdates(updates)));
        }
    }

    /// Stop the notifier after it drains what is already queued.
    pub fn shutdown(&self) {
        drop(self.outbox.lock().take());
        if let Some(thread) = self.notifier.lock().take() {
            if thread.join().is_err() {
                warn!("paper notifier panicked");
            }
        }
    }

    fn post(&self, notice: Notice) {
        match self.outbox.lock().as_ref() {
            Some(tx) => {
                let _ = tx.send(notice);
            }
            None => debug!("paper venue shut down, notice dropped"),
        }
    }

    fn post_status(&self, state: &mut VenueState, status: SessionStatus) {
        state.status = status;
        self.post(Notice::Status(StatusEvent::Changed(status)));
    }

    fn ensure_connected(&self) -> Result<()> {
        match self.status() {
            SessionStatus::Connected => Ok(()),
            other => Err(Error::Transport(format!("paper venue is {}", other))),
        }
    }

    fn assign_ids(message: ValueMap) -> WireRequest {
        let children = message.children().iter().cloned().map(Self::assign_ids).collect();
        WireRequest {
            id: RequestId::new(Uuid::new_v4().simple().to_string()),
            message,
            children,
        }
    }

    // Accept one order leg: book the order (market orders fill at once).
    fn accept_leg(&self, state: &mut VenueState, leg: &WireRequest) -> Result<Vec<TableUpdate>> {
        let message = &leg.message;
        let account_id = message.str(params::ACCOUNT_ID).unwrap_or_default();
        let offer_id = message.str(params::OFFER_ID).unwrap_or_default();
        let side = message.str(params::BUY_SELL).unwrap_or_default().to_string();
        let order_type = message.str(params::ORDER_TYPE).unwrap_or_default().to_string();

        if !state.accounts.iter().any(|a| a.id() == account_id) {
            return Err(Error::Validation(format!("unknown account {}", account_id)));
        }
        let offer = state
            .offers
            .iter()
            .find(|o| o.id() == offer_id && o.str(columns::SUBSCRIPTION_STATUS) == Some(SUBSCRIPTION_TRADABLE))
            .ok_or_else(|| Error::Validation(format!("offer {} is not tradable", offer_id)))?;
        let market_rate = if side == "B" {
            offer.decimal(columns::ASK)
        } else {
            offer.decimal(columns::BID)
        };

        let order_id = format!("O{}", state.next_order);
        state.next_order += 1;
        let mut order = Row::new(TableKind::Orders, order_id.as_str())
            .with(columns::REQUEST_ID, leg.id.as_str())
            .with(columns::ACCOUNT_ID, account_id)
            .with(columns::OFFER_ID, offer_id)
            .with(columns::BUY_SELL, side.as_str())
            .with(columns::ORDER_TYPE, order_type.as_str());
        if let Some(amount) = message.get(params::AMOUNT) {
            order.set(columns::AMOUNT, amount.clone());
        }
        if let Some(rate) = message.get(params::RATE).and_then(|r| r.as_decimal()).or(market_rate) {
            order.set(columns::RATE, rate);
        }

        let mut updates = vec![TableUpdate::insert(order.clone())];
        if order_type == "OM" {
            let trade_id = format!("T{}", order_id.trim_start_matches('O'));
            let mut trade = Row::new(TableKind::Trades, trade_id)
                .with(columns::ACCOUNT_ID, account_id)
                .with(columns::OFFER_ID, offer_id)
                .with(columns::BUY_SELL, side.as_str());
            if let Some(amount) = order.get(columns::AMOUNT) {
                trade.set(columns::AMOUNT, amount.clone());
            }
            if let Some(rate) = market_rate {
                trade.set(columns::OPEN_RATE, rate);
            }
            trade.set(columns::OPEN_TIME, Utc::now());
            state.trades.push(trade.clone());
            updates.push(TableUpdate::insert(trade));
            updates.push(TableUpdate::delete(TableKind::Orders, order_id));
        } else {
            state.orders.push(order);
        }
        Ok(updates)
    }
}

impl Transport for PaperVenue {
    fn name(&self) -> &str {
        "paper"
    }

    fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    fn login(&self, credentials: &Credentials) -> Result<()> {
        let behavior = self.behavior.lock().clone();
        let mut state = self.state.lock();
        self.post_status(&mut state, SessionStatus::Connecting);

        let password_ok = match &behavior.password {
            Some(expected) => *expected == credentials.password,
            None => !credentials.password.is_empty(),
        };
        if !password_ok {
            self.post(Notice::Status(StatusEvent::LoginFailed("invalid user name or password".into())));
            self.post_status(&mut state, SessionStatus::Disconnected);
        } else if self.config.require_trading_session {
            self.post_status(&mut state, SessionStatus::TradingSessionRequested);
        } else {
            self.post_status(&mut state, SessionStatus::Connected);
        }
        Ok(())
    }

    fn logout(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.post_status(&mut state, SessionStatus::Disconnecting);
        self.post_status(&mut state, SessionStatus::Disconnected);
        Ok(())
    }

    fn trading_sessions(&self) -> Result<Vec<TradingSessionDescriptor>> {
        Ok(self.config.trading_sessions.clone())
    }

    fn set_trading_session(&self, session_id: &str, _pin: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.status != SessionStatus::TradingSessionRequested {
            return Err(Error::Transport(format!("no trading session requested, venue is {}", state.status)));
        }
        if !self.config.trading_sessions.iter().any(|s| s.id == session_id) {
            return Err(Error::Transport(format!("unknown trading session {}", session_id)));
        }
        self.post_status(&mut state, SessionStatus::Connected);
        Ok(())
    }

    fn load_table(&self, kind: TableKind) -> Result<Vec<Row>> {
        if self.behavior.lock().fail_table == Some(kind) {
            return Err(Error::Transport(format!("{} table unavailable", kind)));
        }
        self.ensure_connected()?;
        let state = self.state.lock();
        Ok(match kind {
            TableKind::Accounts => state.accounts.clone(),
            TableKind::Offers => state.offers.clone(),
            TableKind::Orders => state.orders.clone(),
            TableKind::Trades => state.trades.clone(),
        })
    }

    fn create_request(&self, message: ValueMap) -> Result<WireRequest> {
        if self.behavior.lock().refuse_requests {
            return Err(Error::Transport("request factory unavailable".into()));
        }
        Ok(Self::assign_ids(message))
    }

    fn send_request(&self, request: &WireRequest) -> Result<()> {
        self.ensure_connected()?;
        let behavior = self.behavior.lock().clone();
        let mut state = self.state.lock();

        if behavior.reject_parent && !request.children.is_empty() {
            self.post(Notice::Response(ResponseEvent::RequestFailed {
                request_id: request.id.clone(),
                error: "composite order rejected".into(),
            }));
            return Ok(());
        }

        let legs: Vec<&WireRequest> = if request.children.is_empty() {
            vec![request]
        } else {
            request.children.iter().collect()
        };
        for (index, leg) in legs.into_iter().enumerate() {
            if behavior.silent_legs.contains(&index) {
                debug!("paper venue holding {}", leg.id);
                continue;
            }
            let accepted = if behavior.reject_legs.contains(&index) {
                Err(Error::Validation("not enough margin".into()))
            } else {
                self.accept_leg(&mut state, leg)
            };
            match accepted {
                Ok(updates) => {
                    self.post(Notice::Response(ResponseEvent::RequestCompleted {
                        request_id: leg.id.clone(),
                    }));
                    self.post(Notice::Response(ResponseEvent::TablesUpdates(updates)));
                }
                Err(e) => self.post(Notice::Response(ResponseEvent::RequestFailed {
                    request_id: leg.id.clone(),
                    error: e.to_string(),
                })),
            }
        }
        Ok(())
    }

    fn base_unit_size(&self, instrument: &str, account_id: &str) -> Result<i64> {
        let state = self.state.lock();
        if !state.accounts.iter().any(|a| a.id() == account_id) {
            return Err(Error::Validation(format!("unknown account {}", account_id)));
        }
        if !state.offers.iter().any(|o| o.str(columns::INSTRUMENT) == Some(instrument)) {
            return Err(Error::Validation(format!("unknown instrument {}", instrument)));
        }
        Ok(self.config.base_unit_size)
    }
}

impl Drop for PaperVenue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn account_row(account: &crate::core::config::PaperAccount) -> Row {
    Row::new(TableKind::Accounts, account.id.as_str())
        .with(columns::ACCOUNT_KIND, account.kind.as_str())
        .with(columns::MARGIN_CALL_FLAG, account.margin_call.as_str())
        .with(columns::BALANCE, account.balance)
}

fn offer_row(offer: &crate::core::config::PaperOffer) -> Row {
    Row::new(TableKind::Offers, offer.id.as_str())
        .with(columns::INSTRUMENT, offer.instrument.as_str())
        .with(columns::BID, offer.bid)
        .with(columns::ASK, offer.ask)
        .with(columns::POINT_SIZE, offer.point_size)
        .with(columns::DIGITS, offer.digits as i64)
        .with(columns::SUBSCRIPTION_STATUS, offer.status.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn venue() -> PaperVenue {
        PaperVenue::new(PaperConfig::default()).unwrap()
    }

    fn credentials() -> Credentials {
        Credentials {
            login: "user".into(),
            password: "secret".into(),
            ..Credentials::default()
        }
    }

    #[test]
    fn test_login_emits_status_sequence() {
        let venue = venue();
        let sub = venue.bus().subscribe_status();
        venue.login(&credentials()).unwrap();

        let first = sub.recv_timeout(Duration::from_secs(5));
        let second = sub.recv_timeout(Duration::from_secs(5));
        assert_eq!(first, Some(StatusEvent::Changed(SessionStatus::Connecting)));
        assert_eq!(second, Some(StatusEvent::Changed(SessionStatus::Connected)));
    }

    #[test]
    fn test_bad_password_reports_reason() {
        let venue = venue().with_behavior(PaperBehavior {
            password: Some("right".into()),
            ..PaperBehavior::default()
        });
        let sub = venue.bus().subscribe_status();
        venue.login(&credentials()).unwrap();

        let _connecting = sub.recv_timeout(Duration::from_secs(5));
        assert!(matches!(sub.recv_timeout(Duration::from_secs(5)), Some(StatusEvent::LoginFailed(_))));
        assert_eq!(
            sub.recv_timeout(Duration::from_secs(5)),
            Some(StatusEvent::Changed(SessionStatus::Disconnected))
        );
    }

    #[test]
    fn test_tables_require_connection() {
        let venue = venue();
        assert!(venue.load_table(TableKind::Accounts).is_err());

        venue.login(&credentials()).unwrap();
        let offers = venue.load_table(TableKind::Offers).unwrap();
        assert_eq!(offers.len(), 3);
        assert_eq!(offers[0].str(columns::INSTRUMENT), Some("EUR/USD"));
    }

    #[test]
    fn test_market_order_books_trade() {
        let venue = venue();
        venue.login(&credentials()).unwrap();
        let responses = venue.bus().subscribe_responses();

        let message = ValueMap::new("CreateOrder")
            .with(params::ORDER_TYPE, "OM")
            .with(params::ACCOUNT_ID, "00001")
            .with(params::OFFER_ID, "1")
            .with(params::BUY_SELL, "B")
            .with(params::AMOUNT, 1000i64);
        let request = venue.create_request(message).unwrap();
        venue.send_request(&request).unwrap();

        assert_eq!(
            responses.recv_timeout(Duration::from_secs(5)),
            Some(ResponseEvent::RequestCompleted { request_id: request.id.clone() })
        );
        match responses.recv_timeout(Duration::from_secs(5)) {
            Some(ResponseEvent::TablesUpdates(updates)) => {
                assert_eq!(updates.len(), 3);
                assert_eq!(updates[1].kind(), TableKind::Trades);
            }
            other => panic!("expected table updates, got {:?}", other),
        }
        assert_eq!(venue.load_table(TableKind::Trades).unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_offer_is_rejected() {
        let venue = venue();
        venue.login(&credentials()).unwrap();
        let responses = venue.bus().subscribe_responses();

        // GBP/USD is seeded disabled
        let message = ValueMap::new("CreateOrder")
            .with(params::ORDER_TYPE, "OM")
            .with(params::ACCOUNT_ID, "00001")
            .with(params::OFFER_ID, "3")
            .with(params::BUY_SELL, "S")
            .with(params::AMOUNT, 1000i64);
        let request = venue.create_request(message).unwrap();
        venue.send_request(&request).unwrap();

        assert!(matches!(
            responses.recv_timeout(Duration::from_secs(5)),
            Some(ResponseEvent::RequestFailed { .. })
        ));
    }

    #[test]
    fn test_base_unit_size() {
        let venue = venue();
        assert_eq!(venue.base_unit_size("EUR/USD", "00001").unwrap(), 1000);
        assert!(venue.base_unit_size("XAU/USD", "00001").is_err());
    }
}
