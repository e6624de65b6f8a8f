//! Core types - Strong typing for safety

use serde::{Deserialize, Serialize};

use super::error::Error;

/// Connectivity state of one login session, as pushed by the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Reconnecting,
    SessionLost,
    TradingSessionRequested,
}

impl SessionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionStatus::Connected)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionStatus::Disconnected => "Disconnected",
            SessionStatus::Connecting => "Connecting",
            SessionStatus::Connected => "Connected",
            SessionStatus::Disconnecting => "Disconnecting",
            SessionStatus::Reconnecting => "Reconnecting",
            SessionStatus::SessionLost => "SessionLost",
            SessionStatus::TradingSessionRequested => "TradingSessionRequested",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for TableKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        TableKind::ALL
            .into_iter()
            .find(|kind| kind.to_string().eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::Validation(format!("unknown table {:?}", s)))
    }
}

/// Whether the table cache contents can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableSnapshotStatus {
    Idle,
    Loading,
    Loaded,
    LoadFailed,
}

/// Server-maintained tables mirrored by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    Accounts,
    Offers,
    Orders,
    Trades,
}

impl TableKind {
    pub const ALL: [TableKind; 4] = [
        TableKind::Accounts,
        TableKind::Offers,
        TableKind::Orders,
        TableKind::Trades,
    ];

    /// Column holding the stable row identifier.
    pub fn key_column(&self) -> &'static str {
        match self {
            TableKind::Accounts => columns::ACCOUNT_ID,
            TableKind::Offers => columns::OFFER_ID,
            TableKind::Orders => columns::ORDER_ID,
            TableKind::Trades => columns::TRADE_ID,
        }
    }
}

impl std::fmt::Display for TableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TableKind::Accounts => "accounts",
            TableKind::Offers => "offers",
            TableKind::Orders => "orders",
            TableKind::Trades => "trades",
        };
        f.write_str(name)
    }
}

/// Venue-assigned request identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Login parameters handed to the transport.
#[derive(Clone, Default)]
pub struct Credentials {
    pub login: String,
    pub password: String,
    pub url: String,
    pub connection: String,
    pub session_id: Option<String>,
    pub pin: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("password", &"***")
            .field("url", &self.url)
            .field("connection", &self.connection)
            .field("session_id", &self.session_id)
            .field("pin", &self.pin.as_ref().map(|_| "***"))
            .finish()
    }
}

/// A trading sub-context offered by the venue after login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradingSessionDescriptor {
    pub id: String,
    pub description: String,
}

/// Column names used by the venue's tables.
pub mod columns {
    pub const ACCOUNT_ID: &str = "AccountID";
    pub const ACCOUNT_KIND: &str = "AccountKind";
    pub const BALANCE: &str = "Balance";
    pub const MARGIN_CALL_FLAG: &str = "MarginCallFlag";

    pub const OFFER_ID: &str = "OfferID";
    pub const INSTRUMENT: &str = "Instrument";
    pub const BID: &str = "Bid";
    pub const ASK: &str = "Ask";
    pub const POINT_SIZE: &str = "PointSize";
    pub const DIGITS: &str = "Digits";
    pub const SUBSCRIPTION_STATUS: &str = "SubscriptionStatus";

    pub const ORDER_ID: &str = "OrderID";
    pub const REQUEST_ID: &str = "RequestID";
    pub const TRADE_ID: &str = "TradeID";
    pub const BUY_SELL: &str = "BuySell";
    pub const AMOUNT: &str = "Amount";
    pub const RATE: &str = "Rate";
    pub const ORDER_TYPE: &str = "Type";
    pub const OPEN_RATE: &str = "OpenRate";
    pub const OPEN_TIME: &str = "OpenTime";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_kind_from_str() {
        assert_eq!("offers".parse::<TableKind>().unwrap(), TableKind::Offers);
        assert_eq!(" Trades ".parse::<TableKind>().unwrap(), TableKind::Trades);
        for kind in TableKind::ALL {
            assert_eq!(kind.to_string().parse::<TableKind>().unwrap(), kind);
        }
        assert!(matches!("positions".parse::<TableKind>(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_key_columns() {
        assert_eq!(TableKind::Accounts.key_column(), "AccountID");
        assert_eq!(TableKind::Offers.key_column(), "OfferID");
        assert_eq!(TableKind::Orders.key_column(), "OrderID");
        assert_eq!(TableKind::Trades.key_column(), "TradeID");
    }

    #[test]
    fn test_credentials_debug_hides_secrets() {
        let creds = Credentials {
            login: "demo".into(),
            password: "hunter2".into(),
            pin: Some("1234".into()),
            ..Default::default()
        };
        let printed = format!("{:?}", creds);
        assert!(!printed.contains("hunter2"));
        assert!(!printed.contains("1234"));
        assert!(printed.contains("demo"));
    }
}
