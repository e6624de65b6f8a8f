//! Table cache - thread-safe mirror of the venue's server tables
//!
//! Filled in bulk right after login and kept current by streamed row
//! insert/update/delete events. Every mutation and every snapshot copy
//! holds the cache mutex only for its own duration; change callbacks run
//! after the lock is released, so a callback may query the cache freely.

pub mod row;
pub mod select;

use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::core::{Error, Result, TableKind, TableSnapshotStatus, columns};
use crate::events::{EventBus, EventPump, Registry, ResponseEvent, SubscriptionHandle};

pub use row::{Direction, FieldValue, PriceDelta, Row, TableUpdate, UpdateOp};

/// Offer subscription status values that carry meaning for visibility.
pub const SUBSCRIPTION_TRADABLE: &str = "T";
pub const SUBSCRIPTION_DISABLED: &str = "D";

/// A mutation as it was actually applied (after normalization).
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    pub op: UpdateOp,
    /// State after the change; for deletes, the last cached state.
    pub row: Row,
}

/// Changes applied to one table by one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBatch {
    pub kind: TableKind,
    pub changes: Vec<RowChange>,
}

pub type ChangeCallback = Arc<dyn Fn(&ChangeBatch) + Send + Sync>;

#[derive(Default)]
struct Table {
    rows: Vec<Row>,
    index: HashMap<String, usize>,
}

impl Table {
    fn get(&self, id: &str) -> Option<&Row> {
        self.index.get(id).map(|&pos| &self.rows[pos])
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut Row> {
        match self.index.get(id) {
            Some(&pos) => Some(&mut self.rows[pos]),
            None => None,
        }
    }

    fn push(&mut self, row: Row) {
        self.index.insert(row.id().to_string(), self.rows.len());
        self.rows.push(row);
    }

    // Keeps arrival order of the remaining rows.
    fn remove(&mut self, id: &str) -> Option<Row> {
        let pos = self.index.remove(id)?;
        let row = self.rows.remove(pos);
        for later in &self.rows[pos..] {
            if let Some(slot) = self.index.get_mut(later.id()) {
                *slot -= 1;
            }
        }
        Some(row)
    }

    fn clear(&mut self) {
        self.rows.clear();
        self.index.clear();
    }
}

struct CacheInner {
    tables: HashMap<TableKind, Table>,
    status: TableSnapshotStatus,
    awaiting: BTreeSet<TableKind>,
    load_error: Option<String>,
    /// Session is Connected (not lost); set by the session state machine.
    live: bool,
}

/// In-memory snapshot of accounts, offers, orders and trades.
pub struct TableCache {
    inner: Mutex<CacheInner>,
    load_changed: Condvar,
    listeners: Arc<Registry<(TableKind, ChangeCallback)>>,
}

impl TableCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                tables: HashMap::new(),
                status: TableSnapshotStatus::Idle,
                awaiting: BTreeSet::new(),
                load_error: None,
                live: false,
            }),
            load_changed: Condvar::new(),
            listeners: Arc::new(Registry::new()),
        }
    }

    pub fn status(&self) -> TableSnapshotStatus {
        self.inner.lock().status
    }

    pub fn load_error(&self) -> Option<String> {
        self.inner.lock().load_error.clone()
    }

    /// Contents are trustworthy only while the session is connected and the
    /// last bulk load completed.
    pub fn is_authoritative(&self) -> bool {
        let inner = self.inner.lock();
        inner.live && inner.status == TableSnapshotStatus::Loaded
    }

    pub fn set_live(&self, live: bool) {
        self.inner.lock().live = live;
    }

    // ─────────────────────────────────────────────────────────────
    // Bulk load
    // ─────────────────────────────────────────────────────────────

    /// Start a fresh bulk load: drop prior rows of `kinds` and wait for them.
    pub fn begin_bulk_load(&self, kinds: &[TableKind]) {
        let mut inner = self.inner.lock();
        for kind in kinds {
            inner.tables.entry(*kind).or_default().clear();
        }
        inner.awaiting = kinds.iter().copied().collect();
        inner.load_error = None;
        inner.status = if inner.awaiting.is_empty() {
            TableSnapshotStatus::Loaded
        } else {
            TableSnapshotStatus::Loading
        };
        info!("bulk load started for {:?}", kinds);
        self.load_changed.notify_all();
    }

    /// Insert the full initial rows of one table.
    pub fn apply_bulk_rows(&self, kind: TableKind, rows: Vec<Row>) {
        let mut changes = Vec::with_capacity(rows.len());
        {
            let mut inner = self.inner.lock();
            let table = inner.tables.entry(kind).or_default();
            for mut row in rows {
                if row.kind() != kind {
                    warn!("skipping {} row {} in {} bulk load", row.kind(), row.id(), kind);
                    continue;
                }
                if kind == TableKind::Offers
                    && row.str(columns::SUBSCRIPTION_STATUS) != Some(SUBSCRIPTION_TRADABLE)
                {
                    continue;
                }
                row.set_delta(PriceDelta {
                    is_changed: true,
                    ..PriceDelta::default()
                });
                let op = match table.get_mut(row.id()) {
                    Some(existing) => {
                        *existing = row.clone();
                        UpdateOp::Update
                    }
                    None => {
                        table.push(row.clone());
                        UpdateOp::Insert
                    }
                };
                changes.push(RowChange { op, row });
            }

            inner.awaiting.remove(&kind);
            if inner.awaiting.is_empty() && inner.status == TableSnapshotStatus::Loading {
                inner.status = TableSnapshotStatus::Loaded;
                info!("bulk load complete");
                self.load_changed.notify_all();
            }
        }
        debug!("{} bulk rows applied to {}", changes.len(), kind);
        self.notify(vec![ChangeBatch { kind, changes }]);
    }

    /// Record that the collaborator could not load `kind`. Terminal until
    /// the next [`begin_bulk_load`](Self::begin_bulk_load).
    pub fn fail_load(&self, kind: TableKind, reason: impl Into<String>) {
        let reason = reason.into();
        let mut inner = self.inner.lock();
        warn!("bulk load of {} failed: {}", kind, reason);
        inner.status = TableSnapshotStatus::LoadFailed;
        inner.load_error = Some(format!("{}: {}", kind, reason));
        self.load_changed.notify_all();
    }

    /// Block until the current bulk load settles or `timeout` elapses.
    pub fn wait_for_load(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            match inner.status {
                TableSnapshotStatus::Loaded => return Ok(()),
                TableSnapshotStatus::LoadFailed => {
                    let reason = inner.load_error.clone().unwrap_or_default();
                    return Err(Error::SnapshotLoad(reason));
                }
                TableSnapshotStatus::Idle | TableSnapshotStatus::Loading => {
                    if self.load_changed.wait_until(&mut inner, deadline).timed_out() {
                        return Err(Error::Timeout(format!(
                            "tables still {:?} after {:?}",
                            inner.status, timeout
                        )));
                    }
                }
            }
        }
    }

    /// Drop every row and return to `Idle`.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        for table in inner.tables.values_mut() {
            table.clear();
        }
        inner.awaiting.clear();
        inner.load_error = None;
        inner.status = TableSnapshotStatus::Idle;
        inner.live = false;
        self.load_changed.notify_all();
    }

    // ─────────────────────────────────────────────────────────────
    // Streamed updates
    // ─────────────────────────────────────────────────────────────

    pub fn apply_update(&self, update: TableUpdate) -> Option<RowChange> {
        let kind = update.kind();
        let change = Self::apply_one(&mut self.inner.lock(), update);
        if let Some(change) = &change {
            self.notify(vec![ChangeBatch {
                kind,
                changes: vec![change.clone()],
            }]);
        }
        change
    }

    /// Apply one streamed batch in arrival order, then notify once per table.
    pub fn apply_updates(&self, updates: Vec<TableUpdate>) -> Vec<ChangeBatch> {
        let mut batches: Vec<ChangeBatch> = Vec::new();
        for update in updates {
            let kind = update.kind();
            let Some(change) = Self::apply_one(&mut self.inner.lock(), update) else {
                continue;
            };
            match batches.iter_mut().find(|b| b.kind == kind) {
                Some(batch) => batch.changes.push(change),
                None => batches.push(ChangeBatch {
                    kind,
                    changes: vec![change],
                }),
            }
        }
        self.notify(batches.clone());
        batches
    }

    /// Feed the bus's streamed table updates into this cache.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> Result<EventPump> {
        let cache = Arc::clone(self);
        EventPump::spawn("fxsync-tables", bus.subscribe_responses(), move |event| {
            if let ResponseEvent::TablesUpdates(updates) = event {
                cache.apply_updates(updates);
            }
        })
    }

    fn apply_one(inner: &mut CacheInner, update: TableUpdate) -> Option<RowChange> {
        let kind = update.kind();
        let table = inner.tables.entry(kind).or_default();
        let id = update.row.id().to_string();

        let mut op = update.op;
        if kind == TableKind::Offers && op != UpdateOp::Delete {
            let status = update
                .row
                .str(columns::SUBSCRIPTION_STATUS)
                .or_else(|| table.get(&id).and_then(|r| r.str(columns::SUBSCRIPTION_STATUS)))
                .map(str::to_string);
            match status.as_deref() {
                Some(SUBSCRIPTION_DISABLED) => op = UpdateOp::Delete,
                Some(SUBSCRIPTION_TRADABLE) => {}
                other => {
                    debug!("offer {} ignored, subscription status {:?}", id, other);
                    return None;
                }
            }
        }

        match op {
            UpdateOp::Delete => table.remove(&id).map(|row| RowChange {
                op: UpdateOp::Delete,
                row,
            }),
            UpdateOp::Insert | UpdateOp::Update => match table.get_mut(&id) {
                Some(existing) => {
                    let old_bid = existing.decimal(columns::BID);
                    let old_ask = existing.decimal(columns::ASK);
                    let changed = existing.merge_from(&update.row);

                    let mut delta = PriceDelta {
                        is_changed: changed,
                        ..PriceDelta::default()
                    };
                    if kind == TableKind::Offers {
                        delta.bid_direction = step(old_bid, update.row.decimal(columns::BID));
                        delta.ask_direction = step(old_ask, update.row.decimal(columns::ASK));
                    }
                    existing.set_delta(delta);
                    Some(RowChange {
                        op: UpdateOp::Update,
                        row: existing.clone(),
                    })
                }
                None => {
                    let mut row = update.row;
                    row.set_delta(PriceDelta {
                        is_changed: true,
                        ..PriceDelta::default()
                    });
                    table.push(row.clone());
                    Some(RowChange {
                        op: UpdateOp::Insert,
                        row,
                    })
                }
            },
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────

    /// Point-in-time copy of one table, in arrival order.
    pub fn query(&self, kind: TableKind) -> impl Iterator<Item = Row> + use<> {
        self.snapshot(kind).into_iter()
    }

    pub fn snapshot(&self, kind: TableKind) -> Vec<Row> {
        self.inner
            .lock()
            .tables
            .get(&kind)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn find(&self, kind: TableKind, id: &str) -> Option<Row> {
        self.inner.lock().tables.get(&kind)?.get(id).cloned()
    }

    pub fn len(&self, kind: TableKind) -> usize {
        self.inner.lock().tables.get(&kind).map(|t| t.rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, kind: TableKind) -> bool {
        self.len(kind) == 0
    }

    /// Acknowledge that the consumer has rendered every changed row.
    pub fn clear_changed(&self, kind: TableKind) {
        if let Some(table) = self.inner.lock().tables.get_mut(&kind) {
            for row in &mut table.rows {
                row.clear_changed();
            }
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Change notification
    // ─────────────────────────────────────────────────────────────

    /// Invoke `callback` after every applied batch touching `kind`.
    pub fn subscribe_changes<F>(&self, kind: TableKind, callback: F) -> SubscriptionHandle
    where
        F: Fn(&ChangeBatch) + Send + Sync + 'static,
    {
        let callback: ChangeCallback = Arc::new(callback);
        let id = self.listeners.add((kind, callback));
        SubscriptionHandle::new(id, &self.listeners)
    }

    // Called without the cache lock held.
    fn notify(&self, batches: Vec<ChangeBatch>) {
        let batches: Vec<ChangeBatch> = batches.into_iter().filter(|b| !b.changes.is_empty()).collect();
        if batches.is_empty() {
            return;
        }
        let listeners = self.listeners.snapshot();
        for batch in &batches {
            for (kind, callback) in &listeners {
                if *kind == batch.kind {
                    callback(batch);
                }
            }
        }
    }
}

impl Default for TableCache {
    fn default() -> Self {
        Self::new()
    }
}

fn step(old: Option<rust_decimal::Decimal>, new: Option<rust_decimal::Decimal>) -> Direction {
    match (old, new) {
        (Some(old), Some(new)) => Direction::between(old, new),
        _ => Direction::Flat,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn offer(id: &str, bid: i64, ask: i64) -> Row {
        Row::new(TableKind::Offers, id)
            .with(columns::INSTRUMENT, "EUR/USD")
            .with(columns::BID, Decimal::new(bid, 5))
            .with(columns::ASK, Decimal::new(ask, 5))
            .with(columns::SUBSCRIPTION_STATUS, "T")
    }

    fn loaded_cache() -> TableCache {
        let cache = TableCache::new();
        cache.begin_bulk_load(&[TableKind::Offers]);
        cache.apply_bulk_rows(TableKind::Offers, vec![offer("1", 110000, 110020)]);
        cache
    }

    #[test]
    fn test_bulk_load_lifecycle() {
        let cache = TableCache::new();
        assert_eq!(cache.status(), TableSnapshotStatus::Idle);

        cache.begin_bulk_load(&[TableKind::Accounts, TableKind::Offers]);
        assert_eq!(cache.status(), TableSnapshotStatus::Loading);

        cache.apply_bulk_rows(TableKind::Accounts, vec![Row::new(TableKind::Accounts, "A1")]);
        assert_eq!(cache.status(), TableSnapshotStatus::Loading);

        cache.apply_bulk_rows(TableKind::Offers, vec![offer("1", 1, 2)]);
        assert_eq!(cache.status(), TableSnapshotStatus::Loaded);
        assert!(cache.wait_for_load(Duration::from_millis(10)).is_ok());

        // not live until the session says so
        assert!(!cache.is_authoritative());
        cache.set_live(true);
        assert!(cache.is_authoritative());
    }

    #[test]
    fn test_load_failure_is_terminal() {
        let cache = TableCache::new();
        cache.begin_bulk_load(&[TableKind::Accounts, TableKind::Offers]);
        cache.fail_load(TableKind::Accounts, "refresh rejected");
        cache.apply_bulk_rows(TableKind::Offers, vec![offer("1", 1, 2)]);

        assert_eq!(cache.status(), TableSnapshotStatus::LoadFailed);
        assert!(matches!(
            cache.wait_for_load(Duration::from_millis(10)),
            Err(Error::SnapshotLoad(_))
        ));
    }

    #[test]
    fn test_wait_for_load_times_out() {
        let cache = TableCache::new();
        cache.begin_bulk_load(&[TableKind::Trades]);
        assert!(matches!(
            cache.wait_for_load(Duration::from_millis(20)),
            Err(Error::Timeout(_))
        ));
    }

    #[test]
    fn test_bulk_load_skips_non_tradable_offers() {
        let cache = TableCache::new();
        cache.begin_bulk_load(&[TableKind::Offers]);
        cache.apply_bulk_rows(
            TableKind::Offers,
            vec![
                offer("1", 1, 2),
                offer("2", 1, 2).with(columns::SUBSCRIPTION_STATUS, "D"),
                offer("3", 1, 2).with(columns::SUBSCRIPTION_STATUS, "V"),
            ],
        );
        let ids: Vec<String> = cache.query(TableKind::Offers).map(|r| r.id().to_string()).collect();
        assert_eq!(ids, vec!["1"]);
    }

    #[test]
    fn test_insert_update_delete_in_arrival_order() {
        let cache = TableCache::new();
        let order = |amount: i64| {
            Row::new(TableKind::Orders, "O1").with(columns::AMOUNT, amount)
        };

        cache.apply_updates(vec![
            TableUpdate::update(order(1000)), // absent id: insert
            TableUpdate::insert(order(2000)), // present id: update in place
            TableUpdate::delete(TableKind::Orders, "O1"),
            TableUpdate::update(order(3000)),
        ]);

        let rows = cache.snapshot(TableKind::Orders);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].int(columns::AMOUNT), Some(3000));
    }

    #[test]
    fn test_delete_of_absent_row_is_noop() {
        let cache = TableCache::new();
        assert!(cache.apply_update(TableUpdate::delete(TableKind::Trades, "T9")).is_none());

        // absent offer going straight to "D"
        let disabled = offer("9", 1, 2).with(columns::SUBSCRIPTION_STATUS, "D");
        assert!(cache.apply_update(TableUpdate::update(disabled)).is_none());
        assert!(cache.is_empty(TableKind::Offers));
    }

    #[test]
    fn test_disabled_status_deletes_offer() {
        let cache = loaded_cache();
        let disabled = Row::new(TableKind::Offers, "1").with(columns::SUBSCRIPTION_STATUS, "D");
        let change = cache.apply_update(TableUpdate::update(disabled)).unwrap();

        assert_eq!(change.op, UpdateOp::Delete);
        assert!(cache.find(TableKind::Offers, "1").is_none());
    }

    #[test]
    fn test_directions_follow_latest_step() {
        let cache = loaded_cache();
        assert_eq!(cache.find(TableKind::Offers, "1").unwrap().delta().bid_direction, Direction::Flat);

        cache.apply_update(TableUpdate::update(offer("1", 109990, 110030)));
        let row = cache.find(TableKind::Offers, "1").unwrap();
        assert_eq!(row.delta().bid_direction, Direction::Down);
        assert_eq!(row.delta().ask_direction, Direction::Up);

        // back to the original price: raw value restored, direction is the last step only
        cache.apply_update(TableUpdate::update(offer("1", 110000, 110020)));
        let row = cache.find(TableKind::Offers, "1").unwrap();
        assert_eq!(row.decimal(columns::BID), Some(Decimal::new(110000, 5)));
        assert_eq!(row.delta().bid_direction, Direction::Up);
        assert_eq!(row.delta().ask_direction, Direction::Down);
    }

    #[test]
    fn test_replayed_update_is_noop() {
        let cache = loaded_cache();
        cache.apply_update(TableUpdate::update(offer("1", 110010, 110030)));
        cache.apply_update(TableUpdate::update(offer("1", 110010, 110030)));

        let row = cache.find(TableKind::Offers, "1").unwrap();
        assert_eq!(row.delta(), PriceDelta::default());
        assert_eq!(row.decimal(columns::ASK), Some(Decimal::new(110030, 5)));
    }

    #[test]
    fn test_update_without_status_keeps_cached_status() {
        let cache = loaded_cache();
        let tick = Row::new(TableKind::Offers, "1").with(columns::BID, Decimal::new(110005, 5));
        let change = cache.apply_update(TableUpdate::update(tick)).unwrap();
        assert_eq!(change.row.delta().bid_direction, Direction::Up);
        assert_eq!(change.row.str(columns::INSTRUMENT), Some("EUR/USD"));
    }

    #[test]
    fn test_clear_changed() {
        let cache = loaded_cache();
        assert!(cache.find(TableKind::Offers, "1").unwrap().delta().is_changed);
        cache.clear_changed(TableKind::Offers);
        assert!(!cache.find(TableKind::Offers, "1").unwrap().delta().is_changed);
    }

    #[test]
    fn test_delete_keeps_order_of_remaining_rows() {
        let cache = TableCache::new();
        for id in ["a", "b", "c", "d"] {
            cache.apply_update(TableUpdate::insert(Row::new(TableKind::Trades, id)));
        }
        cache.apply_update(TableUpdate::delete(TableKind::Trades, "b"));
        cache.apply_update(TableUpdate::update(Row::new(TableKind::Trades, "d").with(columns::AMOUNT, 5)));

        let ids: Vec<String> = cache.query(TableKind::Trades).map(|r| r.id().to_string()).collect();
        assert_eq!(ids, vec!["a", "c", "d"]);
        assert_eq!(cache.find(TableKind::Trades, "d").unwrap().int(columns::AMOUNT), Some(5));
    }

    #[test]
    fn test_callback_may_query_cache() {
        let cache = Arc::new(loaded_cache());
        let calls = Arc::new(AtomicUsize::new(0));

        let reader = cache.clone();
        let counter = calls.clone();
        let handle = cache.subscribe_changes(TableKind::Offers, move |batch| {
            // would deadlock if the cache lock were still held
            assert_eq!(reader.len(TableKind::Offers), 1);
            counter.fetch_add(batch.changes.len(), Ordering::SeqCst);
        });

        cache.apply_updates(vec![
            TableUpdate::update(offer("1", 110001, 110021)),
            TableUpdate::insert(Row::new(TableKind::Trades, "T1")),
        ]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        handle.cancel();
        cache.apply_update(TableUpdate::update(offer("1", 110002, 110022)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clear_resets_everything() {
        let cache = loaded_cache();
        cache.set_live(true);
        cache.clear();
        assert_eq!(cache.status(), TableSnapshotStatus::Idle);
        assert!(cache.is_empty(TableKind::Offers));
        assert!(!cache.is_authoritative());
    }

    #[test]
    fn test_concurrent_writers_lose_no_updates() {
        let cache = Arc::new(TableCache::new());
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let id = format!("{}-{}", w, i);
                        cache.apply_update(TableUpdate::insert(Row::new(TableKind::Trades, id)));
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }
        assert_eq!(cache.len(TableKind::Trades), 200);
    }
}
