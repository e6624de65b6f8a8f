//! Core traits - the venue capability the engine rides on

use std::sync::Arc;

use crate::core::{Credentials, Result, TableKind, TradingSessionDescriptor};
use crate::events::EventBus;
use crate::requests::{ValueMap, WireRequest};
use crate::tables::Row;

/// Opaque session/transport to the trading venue.
///
/// Every call returns promptly; real outcomes (status transitions, request
/// completions, table updates) arrive later on the transport's [`EventBus`].
pub trait Transport: Send + Sync {
    /// Venue name, for logs
    fn name(&self) -> &str;

    /// Bus the transport publishes status and response events on
    fn bus(&self) -> Arc<EventBus>;

    /// Start logging in; the outcome is reported as status events
    fn login(&self, credentials: &Credentials) -> Result<()>;

    /// Start logging out; completion is reported as `Disconnected`
    fn logout(&self) -> Result<()>;

    /// Trading sessions the venue offers for the current login
    fn trading_sessions(&self) -> Result<Vec<TradingSessionDescriptor>>;

    /// Answer a `TradingSessionRequested` status
    fn set_trading_session(&self, session_id: &str, pin: &str) -> Result<()>;

    /// Full current contents of one server table
    fn load_table(&self, kind: TableKind) -> Result<Vec<Row>>;

    /// Turn a command value map into a request with venue-assigned ids
    fn create_request(&self, message: ValueMap) -> Result<WireRequest>;

    /// Send a request created by [`create_request`](Self::create_request)
    fn send_request(&self, request: &WireRequest) -> Result<()>;

    /// Contract size of one lot of `instrument` for `account_id`
    fn base_unit_size(&self, instrument: &str, account_id: &str) -> Result<i64>;
}
