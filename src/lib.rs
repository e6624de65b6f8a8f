//! fxsync - Core Library
//! Session lifecycle, table synchronization and request correlation for a
//! streaming trading venue

// Public modules
pub mod core;
pub mod events;
pub mod paper;
pub mod requests;
pub mod samples;
pub mod session;
pub mod tables;

// Re-exports
pub use core::{Config, Error, Result};
pub use events::{EventBus, EventPump, ResponseEvent, StatusEvent, Subscription, SubscriptionHandle};
pub use requests::{RequestCorrelator, RequestHandle, RequestOutcome, RequestSpec};
pub use session::{SessionOutcome, SessionStateMachine, WaitResult};
pub use tables::{Row, TableCache, TableUpdate};
