//! Error handling - one hierarchy for the session, table and request layers

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// fxsync error hierarchy
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Login/logout failed or did not finish in time
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// Bulk table load failed; the cache is unusable until a fresh load
    #[error("Snapshot load error: {0}")]
    SnapshotLoad(String),

    /// No eligible account, unknown instrument, malformed order
    #[error("Validation error: {0}")]
    Validation(String),

    /// Request could not be created or sent; nothing was registered
    #[error("Request send error: {0}")]
    RequestSend(String),

    /// One or more children of a request were rejected by the venue
    #[error("Request rejected: {}", failed.join(", "))]
    RequestRejected { failed: Vec<String> },

    /// A bounded wait elapsed; the final state is unknown
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Transport-level failure reported by the venue capability
    #[error("Transport error: {0}")]
    Transport(String),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Output errors while rendering sample results
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether an outer loop may reasonably try the operation again.
    ///
    /// The core itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Transport(_))
    }

    /// Errors after which the current session cannot be used for trading.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Connectivity(_) | Error::SnapshotLoad(_) | Error::RequestSend(_) | Error::Config(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(Error::Timeout("login".into()).is_retryable());
        assert!(Error::Transport("socket".into()).is_retryable());
        assert!(!Error::Validation("no account".into()).is_retryable());
    }

    #[test]
    fn test_fatal() {
        assert!(Error::SnapshotLoad("offers".into()).is_fatal());
        assert!(Error::RequestSend("no id".into()).is_fatal());
        assert!(!Error::Timeout("request".into()).is_fatal());
    }

    #[test]
    fn test_rejected_message_lists_ids() {
        let err = Error::RequestRejected {
            failed: vec!["R1".into(), "R2".into()],
        };
        assert_eq!(err.to_string(), "Request rejected: R1, R2");
    }
}
