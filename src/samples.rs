//! Sample flows built on the core: print a table, place an OTO, watch offers
//!
//! [`Client`] wires one transport to a table cache, a session state machine
//! and a request correlator, and owns the pumps that feed them.

use rust_decimal::Decimal;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::core::config::{SampleConfig, TimeoutConfig};
use crate::core::{Credentials, Error, RequestId, Result, SessionStatus, TableKind, Transport, columns};
use crate::events::EventPump;
use crate::requests::{OrderSpec, RequestCorrelator, RequestOutcome, RequestSpec, Side};
use crate::session::SessionStateMachine;
use crate::tables::select::{find_eligible_account, find_tradable_offer, offset_by_pips, round_to_digits};
use crate::tables::{ChangeBatch, Direction, Row, TableCache, UpdateOp};

/// Pips below ask for the OTO's primary sell stop
pub const PRIMARY_OFFSET_PIPS: i64 = -30;
/// Pips below ask for the OTO's secondary buy stop
pub const SECONDARY_OFFSET_PIPS: i64 = -15;
/// How long a confirmed OTO waits for its order rows before printing ids only
pub const ORDER_ROW_WAIT: Duration = Duration::from_secs(2);

pub struct Client {
    transport: Arc<dyn Transport>,
    session: Arc<SessionStateMachine>,
    correlator: Arc<RequestCorrelator>,
    pumps: Vec<EventPump>,
    timeouts: TimeoutConfig,
}

impl Client {
    pub fn new(transport: Arc<dyn Transport>, timeouts: TimeoutConfig) -> Result<Self> {
        let bus = transport.bus();
        let cache = Arc::new(TableCache::new());
        let session = Arc::new(
            SessionStateMachine::new(transport.clone(), cache.clone())
                .with_timeouts(timeouts.login(), timeouts.logout()),
        );
        let correlator = Arc::new(RequestCorrelator::new(transport.clone()));

        let pumps = vec![
            session.attach(&bus)?,
            cache.attach(&bus)?,
            correlator.attach(&bus)?,
        ];
        Ok(Self {
            transport,
            session,
            correlator,
            pumps,
            timeouts,
        })
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn session(&self) -> &SessionStateMachine {
        &self.session
    }

    pub fn cache(&self) -> &TableCache {
        self.session.cache()
    }

    pub fn correlator(&self) -> &RequestCorrelator {
        &self.correlator
    }

    pub fn timeouts(&self) -> &TimeoutConfig {
        &self.timeouts
    }

    /// Log in and wait for the initial table load.
    pub fn login(&self, credentials: Credentials) -> Result<()> {
        self.session.login(credentials).into_result()?;
        self.cache().wait_for_load(self.timeouts.table_load())
    }

    /// Log out if still connected, then stop every pump.
    pub fn shutdown(mut self) -> Result<()> {
        let result = match self.session.status() {
            SessionStatus::Disconnected => Ok(()),
            _ => self.session.logout().into_result().map(|_| ()),
        };
        for pump in self.pumps.drain(..) {
            pump.stop();
        }
        info!("client shut down");
        result
    }
}

// ─────────────────────────────────────────────────────────────
// Print table
// ─────────────────────────────────────────────────────────────

/// List accounts, then the configured table's rows for the selected account.
pub fn print_table(client: &Client, sample: &SampleConfig, out: &mut impl Write) -> Result<()> {
    let cache = client.cache();
    for account in cache.query(TableKind::Accounts) {
        writeln!(
            out,
            "AccountID: {}, Balance: {}",
            account.id(),
            field(&account, columns::BALANCE)
        )?;
    }

    let account = find_eligible_account(cache, sample.account_id.as_deref())
        .ok_or_else(|| Error::Validation("no eligible account".into()))?;

    let kind = sample.table_kind();
    if cache.is_empty(kind) {
        writeln!(out, "Table is empty!")?;
    }
    for row in cache.query(kind).filter(|r| r.str(columns::ACCOUNT_ID) == Some(account.id())) {
        writeln!(out, "{}", describe(&row))?;
    }
    writeln!(out, "Done!")?;
    Ok(())
}

/// Write every row of `kind` as one JSON object per line.
pub fn dump_table(client: &Client, kind: TableKind, out: &mut impl Write) -> Result<usize> {
    let mut count = 0;
    for row in client.cache().query(kind) {
        writeln!(out, "{}", serde_json::to_string(&row)?)?;
        count += 1;
    }
    Ok(count)
}

fn field(row: &Row, column: &str) -> String {
    row.get(column).map(ToString::to_string).unwrap_or_default()
}

fn describe(row: &Row) -> String {
    match row.kind() {
        TableKind::Orders => format!(
            "OrderID: {}, AccountID: {}, Type: {}, BuySell: {}, Amount: {}, Rate: {}",
            row.id(),
            field(row, columns::ACCOUNT_ID),
            field(row, columns::ORDER_TYPE),
            field(row, columns::BUY_SELL),
            field(row, columns::AMOUNT),
            field(row, columns::RATE),
        ),
        TableKind::Trades => format!(
            "TradeID: {}, AccountID: {}, BuySell: {}, Amount: {}, OpenRate: {}",
            row.id(),
            field(row, columns::ACCOUNT_ID),
            field(row, columns::BUY_SELL),
            field(row, columns::AMOUNT),
            field(row, columns::OPEN_RATE),
        ),
        _ => format!("{}: {}", row.kind(), row.id()),
    }
}

// ─────────────────────────────────────────────────────────────
// Create OTO
// ─────────────────────────────────────────────────────────────

/// Place a sell stop 30 pips below ask that triggers a buy stop 15 pips
/// below ask, and wait for both legs.
pub fn create_oto(client: &Client, sample: &SampleConfig, out: &mut impl Write) -> Result<RequestOutcome> {
    let spec = build_oto(client, sample)?;
    if let RequestSpec::Oto { primary, secondary } = &spec {
        writeln!(
            out,
            "Creating OTO on {}: {} SE @ {:?} -> {} SE @ {:?}, amount {}",
            primary.offer_id, primary.side, primary.rate, secondary.side, secondary.rate, primary.amount
        )?;
    }

    // Order rows reach the cache on their own pump, possibly after the
    // correlator has already seen the confirmation.
    let (tx, rx) = flume::unbounded::<()>();
    let _subscription = client.cache().subscribe_changes(TableKind::Orders, move |_| {
        let _ = tx.send(());
    });

    let handle = client.correlator().submit(&spec)?;
    let outcome = client
        .correlator()
        .await_completion(&handle, client.timeouts().request())?;

    match &outcome {
        RequestOutcome::AllSucceeded => {
            let deadline = Instant::now() + ORDER_ROW_WAIT;
            for child in handle.children() {
                match await_order_row(client, &rx, child, deadline) {
                    Some(order) => writeln!(out, "{}", describe(&order))?,
                    None => writeln!(out, "Request {} completed", child)?,
                }
            }
            writeln!(out, "Done!")?;
        }
        RequestOutcome::PartialFailure(failed) => {
            for f in failed {
                writeln!(out, "Request {} failed: {}", f.request_id, f.error)?;
            }
        }
        RequestOutcome::Timeout { pending, .. } => {
            writeln!(out, "Timed out waiting for {} request(s)", pending.len())?;
        }
    }
    Ok(outcome)
}

/// Find the order created by `request_id`, waiting for order-table changes
/// until `deadline`.
fn await_order_row(
    client: &Client,
    changed: &flume::Receiver<()>,
    request_id: &RequestId,
    deadline: Instant,
) -> Option<Row> {
    loop {
        let order = client
            .cache()
            .query(TableKind::Orders)
            .find(|r| r.str(columns::REQUEST_ID) == Some(request_id.as_str()));
        if order.is_some() {
            return order;
        }
        let remaining = deadline.checked_duration_since(Instant::now())?;
        changed.recv_timeout(remaining).ok()?;
    }
}

/// Resolve account, offer, amount and rates into an OTO request.
pub fn build_oto(client: &Client, sample: &SampleConfig) -> Result<RequestSpec> {
    let cache = client.cache();
    let account = find_eligible_account(cache, sample.account_id.as_deref())
        .ok_or_else(|| Error::Validation("no eligible account".into()))?;
    let offer = find_tradable_offer(cache, &sample.instrument)
        .ok_or_else(|| Error::Validation(format!("instrument {} is not tradable", sample.instrument)))?;

    let (Some(ask), Some(point_size)) = (offer.decimal(columns::ASK), offer.decimal(columns::POINT_SIZE)) else {
        return Err(Error::Validation(format!("offer {} has no ask/point size", offer.id())));
    };
    let digits = offer
        .int(columns::DIGITS)
        .and_then(|d| u32::try_from(d).ok())
        .unwrap_or(5);

    let base_unit = client.transport().base_unit_size(&sample.instrument, account.id())?;
    let amount = base_unit * sample.lots;

    let rate = |pips: i64| round_to_digits(offset_by_pips(ask, Decimal::from(pips), point_size), digits);
    Ok(RequestSpec::Oto {
        primary: OrderSpec::stop_entry(account.id(), offer.id(), Side::Sell, amount, rate(PRIMARY_OFFSET_PIPS)),
        secondary: OrderSpec::stop_entry(account.id(), offer.id(), Side::Buy, amount, rate(SECONDARY_OFFSET_PIPS)),
    })
}

// ─────────────────────────────────────────────────────────────
// Watch offers
// ─────────────────────────────────────────────────────────────

/// Print the offers table, then repaint changed offers for `duration`.
/// Returns the number of change batches seen.
pub fn watch_offers(client: &Client, duration: Duration, out: &mut impl Write) -> Result<usize> {
    let cache = client.cache();
    let (tx, rx) = flume::unbounded::<ChangeBatch>();
    // Callback runs on the update thread; only hand the batch over.
    let _subscription = cache.subscribe_changes(TableKind::Offers, move |batch| {
        let _ = tx.send(batch.clone());
    });

    for offer in cache.query(TableKind::Offers) {
        writeln!(out, "{}", render_offer(&offer))?;
    }
    cache.clear_changed(TableKind::Offers);

    let deadline = Instant::now() + duration;
    let mut batches = 0;
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        let Ok(batch) = rx.recv_timeout(remaining) else {
            break;
        };
        batches += 1;
        for change in &batch.changes {
            match change.op {
                UpdateOp::Delete => writeln!(out, "{} removed", field(&change.row, columns::INSTRUMENT))?,
                _ if change.row.delta().is_changed => writeln!(out, "{}", render_offer(&change.row))?,
                _ => {}
            }
        }
        cache.clear_changed(TableKind::Offers);
    }
    if batches == 0 {
        warn!("no offer updates in {:?}", duration);
    }
    Ok(batches)
}

fn marker(direction: Direction) -> &'static str {
    match direction {
        Direction::Up => "↑",
        Direction::Down => "↓",
        Direction::Flat => " ",
    }
}

pub fn render_offer(row: &Row) -> String {
    let delta = row.delta();
    format!(
        "{:<10} {}{} {}{}",
        field(row, columns::INSTRUMENT),
        field(row, columns::BID),
        marker(delta.bid_direction),
        field(row, columns::ASK),
        marker(delta.ask_direction),
    )
}
