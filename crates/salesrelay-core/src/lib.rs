//! # SalesRelay Core
//!
//! Shared vocabulary for the daily sales summary pipeline:
//!
//! ```text
//! DailyScheduler ─▶ Aggregator ─▶ Publisher ─▶ [durable queue] ─▶ Consumer ─▶ SummaryHandler
//!                      │
//!                      └── RecordStore
//! ```
//!
//! Publisher and Consumer never talk to each other directly; the broker queue
//! is the only thing they share.

pub mod config;
pub mod error;
pub mod events;
pub mod traits;
pub mod types;

pub use config::SalesRelayConfig;
pub use error::{RelayError, Result};
pub use events::{EventLog, EventSink, PipelineEvent};
pub use traits::{BrokerTransport, DeliveryAcker, DeliverySource, RecordStore, SummaryHandler};
pub use types::{
    BrokerMessage, Delivery, DeliveryState, ItemQuantity, LineItem, SummaryMessage,
    TransactionRecord,
};
