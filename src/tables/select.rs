//! Row selection rules shared by the samples

use rust_decimal::{Decimal, RoundingStrategy};

use super::{Row, SUBSCRIPTION_TRADABLE, TableCache};
use crate::core::{TableKind, columns};

/// Account kinds that may place orders.
pub const TRADABLE_ACCOUNT_KINDS: [&str; 2] = ["32", "36"];

/// First account (in table order) that is tradable and not under margin call,
/// optionally restricted to `account_id`.
pub fn find_eligible_account(cache: &TableCache, account_id: Option<&str>) -> Option<Row> {
    cache.query(TableKind::Accounts).find(|row| {
        is_eligible_account(row) && account_id.map(|id| row.id() == id).unwrap_or(true)
    })
}

pub fn is_eligible_account(row: &Row) -> bool {
    let kind_ok = row
        .str(columns::ACCOUNT_KIND)
        .map(|k| TRADABLE_ACCOUNT_KINDS.contains(&k))
        .unwrap_or(false);
    kind_ok && row.str(columns::MARGIN_CALL_FLAG) == Some("N")
}

/// First offer for `instrument` whose subscription status is tradable.
pub fn find_tradable_offer(cache: &TableCache, instrument: &str) -> Option<Row> {
    cache.query(TableKind::Offers).find(|row| {
        row.str(columns::INSTRUMENT) == Some(instrument)
            && row.str(columns::SUBSCRIPTION_STATUS) == Some(SUBSCRIPTION_TRADABLE)
    })
}

/// `price + pips * point_size`; negative pips move below the price.
pub fn offset_by_pips(price: Decimal, pips: Decimal, point_size: Decimal) -> Decimal {
    price + pips * point_size
}

/// Round a rate to the instrument's display precision.
pub fn round_to_digits(price: Decimal, digits: u32) -> Decimal {
    price.round_dp_with_strategy(digits, RoundingStrategy::MidpointAwayFromZero)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::TableUpdate;

    fn account(id: &str, margin_call: &str, kind: &str) -> Row {
        Row::new(TableKind::Accounts, id)
            .with(columns::MARGIN_CALL_FLAG, margin_call)
            .with(columns::ACCOUNT_KIND, kind)
    }

    fn accounts_cache() -> TableCache {
        let cache = TableCache::new();
        cache.begin_bulk_load(&[TableKind::Accounts]);
        cache.apply_bulk_rows(
            TableKind::Accounts,
            vec![account("A1", "N", "32"), account("A2", "Y", "36")],
        );
        cache
    }

    #[test]
    fn test_first_eligible_account() {
        let cache = accounts_cache();
        assert_eq!(find_eligible_account(&cache, None).unwrap().id(), "A1");
    }

    #[test]
    fn test_explicit_account_must_pass_margin_filter() {
        let cache = accounts_cache();
        assert!(find_eligible_account(&cache, Some("A2")).is_none());
        assert_eq!(find_eligible_account(&cache, Some("A1")).unwrap().id(), "A1");
    }

    #[test]
    fn test_account_kind_filter() {
        let cache = TableCache::new();
        cache.apply_update(TableUpdate::insert(account("A3", "N", "4")));
        assert!(find_eligible_account(&cache, None).is_none());
    }

    #[test]
    fn test_tradable_offer_lookup() {
        let cache = TableCache::new();
        cache.apply_update(TableUpdate::insert(
            Row::new(TableKind::Offers, "1")
                .with(columns::INSTRUMENT, "EUR/USD")
                .with(columns::SUBSCRIPTION_STATUS, "T"),
        ));
        assert_eq!(find_tradable_offer(&cache, "EUR/USD").unwrap().id(), "1");
        assert!(find_tradable_offer(&cache, "USD/JPY").is_none());
    }

    #[test]
    fn test_pip_offsets() {
        let ask = Decimal::new(112345, 5); // 1.12345
        let point = Decimal::new(1, 4); // 0.0001
        assert_eq!(offset_by_pips(ask, Decimal::from(-30), point), Decimal::new(112045, 5));
        assert_eq!(offset_by_pips(ask, Decimal::from(-15), point), Decimal::new(112195, 5));
        assert_eq!(round_to_digits(Decimal::new(1123456, 6), 5), Decimal::new(112346, 5));
    }
}
