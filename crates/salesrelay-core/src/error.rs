//! Error taxonomy shared by every SalesRelay crate.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Aggregation or retrieval against the record store failed or timed out.
    #[error("Record store unavailable: {0}")]
    StoreUnavailable(String),

    /// An aggregate left the representable range.
    #[error("Aggregate overflow: {0}")]
    AggregateOverflow(String),

    /// Summary could not be encoded, or a delivered payload could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Broker unreachable before the message left the process. Safe to retry.
    #[error("Broker connection lost: {0}")]
    BrokerConnectionLost(String),

    /// Message was handed to the broker but no confirm arrived.
    #[error("Delivery unconfirmed: {0}")]
    DeliveryUnconfirmed(String),

    /// Broker explicitly refused the message (nack or unroutable return).
    #[error("Delivery rejected: {0}")]
    DeliveryRejected(String),

    #[error("Handler failure: {0}")]
    HandlerFailure(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Only a connection that failed before anything was sent may be retried.
    /// Ambiguous or rejected deliveries are surfaced as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RelayError::BrokerConnectionLost(_))
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Serialization(e.to_string())
    }
}
