//! Order request specs and their wire shape
//!
//! A request is a tree of value maps: simple orders are one `CreateOrder`
//! map, composites (OTO, OCO) are a parent map carrying the composite
//! command with one `CreateOrder` child per leg.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::{Error, RequestId, Result};
use crate::tables::FieldValue;

/// Value-map parameter names
pub mod params {
    pub const COMMAND: &str = "Command";
    pub const ORDER_TYPE: &str = "OrderType";
    pub const ACCOUNT_ID: &str = "AccountID";
    pub const OFFER_ID: &str = "OfferID";
    pub const BUY_SELL: &str = "BuySell";
    pub const AMOUNT: &str = "Amount";
    pub const RATE: &str = "Rate";
    pub const TIME_IN_FORCE: &str = "TimeInForce";
}

/// Command names
pub mod commands {
    pub const CREATE_ORDER: &str = "CreateOrder";
    pub const CREATE_OTO: &str = "CreateOTO";
    pub const CREATE_OCO: &str = "CreateOCO";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn code(&self) -> &'static str {
        match self {
            Side::Buy => "B",
            Side::Sell => "S",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    TrueMarketOpen,
    StopEntry,
    LimitEntry,
}

impl OrderKind {
    pub fn code(&self) -> &'static str {
        match self {
            OrderKind::TrueMarketOpen => "OM",
            OrderKind::StopEntry => "SE",
            OrderKind::LimitEntry => "LE",
        }
    }

    pub fn needs_rate(&self) -> bool {
        !matches!(self, OrderKind::TrueMarketOpen)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
    Day,
}

impl TimeInForce {
    pub fn code(&self) -> &'static str {
        match self {
            TimeInForce::Gtc => "GTC",
            TimeInForce::Ioc => "IOC",
            TimeInForce::Fok => "FOK",
            TimeInForce::Day => "DAY",
        }
    }
}

/// Parameters of one order leg.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderSpec {
    pub account_id: String,
    pub offer_id: String,
    pub side: Side,
    pub amount: i64,
    pub rate: Option<Decimal>,
    pub kind: OrderKind,
    pub time_in_force: Option<TimeInForce>,
}

impl OrderSpec {
    pub fn market(account_id: impl Into<String>, offer_id: impl Into<String>, side: Side, amount: i64) -> Self {
        Self {
            account_id: account_id.into(),
            offer_id: offer_id.into(),
            side,
            amount,
            rate: None,
            kind: OrderKind::TrueMarketOpen,
            time_in_force: None,
        }
    }

    pub fn stop_entry(
        account_id: impl Into<String>,
        offer_id: impl Into<String>,
        side: Side,
        amount: i64,
        rate: Decimal,
    ) -> Self {
        Self {
            rate: Some(rate),
            kind: OrderKind::StopEntry,
            ..Self::market(account_id, offer_id, side, amount)
        }
    }

    pub fn limit_entry(
        account_id: impl Into<String>,
        offer_id: impl Into<String>,
        side: Side,
        amount: i64,
        rate: Decimal,
    ) -> Self {
        Self {
            rate: Some(rate),
            kind: OrderKind::LimitEntry,
            ..Self::market(account_id, offer_id, side, amount)
        }
    }

    pub fn with_time_in_force(mut self, tif: TimeInForce) -> Self {
        self.time_in_force = Some(tif);
        self
    }

    pub fn to_value_map(&self) -> Result<ValueMap> {
        if self.account_id.trim().is_empty() {
            return Err(Error::Validation("order without account".into()));
        }
        if self.offer_id.trim().is_empty() {
            return Err(Error::Validation("order without offer".into()));
        }
        if self.amount <= 0 {
            return Err(Error::Validation(format!("order amount {} must be positive", self.amount)));
        }

        let mut map = ValueMap::new(commands::CREATE_ORDER)
            .with(params::ORDER_TYPE, self.kind.code())
            .with(params::ACCOUNT_ID, self.account_id.as_str())
            .with(params::OFFER_ID, self.offer_id.as_str())
            .with(params::BUY_SELL, self.side.code())
            .with(params::AMOUNT, self.amount);

        match (self.kind.needs_rate(), self.rate) {
            (true, Some(rate)) if rate > Decimal::ZERO => map.set(params::RATE, rate),
            (true, _) => {
                return Err(Error::Validation(format!(
                    "{:?} order needs a positive rate",
                    self.kind
                )));
            }
            (false, Some(rate)) => map.set(params::RATE, rate),
            (false, None) => {}
        }
        if let Some(tif) = self.time_in_force {
            map.set(params::TIME_IN_FORCE, tif.code());
        }
        Ok(map)
    }
}

/// What the caller wants sent.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestSpec {
    Single(OrderSpec),
    /// Secondary becomes live only after primary fills
    Oto { primary: OrderSpec, secondary: OrderSpec },
    /// Filling any leg cancels the others
    Oco(Vec<OrderSpec>),
}

impl RequestSpec {
    pub fn to_value_map(&self) -> Result<ValueMap> {
        match self {
            RequestSpec::Single(order) => order.to_value_map(),
            RequestSpec::Oto { primary, secondary } => {
                let mut map = ValueMap::new(commands::CREATE_OTO);
                map.append_child(primary.to_value_map()?);
                map.append_child(secondary.to_value_map()?);
                Ok(map)
            }
            RequestSpec::Oco(legs) => {
                if legs.len() < 2 {
                    return Err(Error::Validation(format!(
                        "OCO needs at least two legs, got {}",
                        legs.len()
                    )));
                }
                let mut map = ValueMap::new(commands::CREATE_OCO);
                for leg in legs {
                    map.append_child(leg.to_value_map()?);
                }
                Ok(map)
            }
        }
    }
}

/// Command parameters plus child maps.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueMap {
    params: BTreeMap<String, FieldValue>,
    children: Vec<ValueMap>,
}

impl ValueMap {
    pub fn new(command: &str) -> Self {
        let mut values = BTreeMap::new();
        values.insert(params::COMMAND.to_string(), FieldValue::from(command));
        Self {
            params: values,
            children: Vec::new(),
        }
    }

    pub fn with(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<FieldValue>) {
        self.params.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.params.get(name)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(FieldValue::as_str)
    }

    pub fn command(&self) -> &str {
        self.str(params::COMMAND).unwrap_or_default()
    }

    pub fn append_child(&mut self, child: ValueMap) {
        self.children.push(child);
    }

    pub fn children(&self) -> &[ValueMap] {
        &self.children
    }
}

/// A request after the venue assigned ids to it and its children.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireRequest {
    pub id: RequestId,
    pub message: ValueMap,
    pub children: Vec<WireRequest>,
}

impl WireRequest {
    /// Ids whose terminal events together mean the request is done.
    pub fn terminal_ids(&self) -> Vec<RequestId> {
        if self.children.is_empty() {
            vec![self.id.clone()]
        } else {
            self.children.iter().map(|c| c.id.clone()).collect()
        }
    }
}
