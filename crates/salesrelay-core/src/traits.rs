//! Collaborator seams. Every component is built with explicit references to
//! these, never resolved from a global registry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{BrokerMessage, Delivery, ItemQuantity, SummaryMessage, TransactionRecord};

/// Queryable store of transaction records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Persist a new record. Implementations validate invariants first.
    async fn insert(&self, record: TransactionRecord) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<TransactionRecord>>;

    async fn list(&self) -> Result<Vec<TransactionRecord>>;

    /// Records with `occurred_at` in `[start, end)`.
    async fn records_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TransactionRecord>>;

    /// All line items across all records, summed per item key.
    async fn quantity_by_item(&self) -> Result<Vec<ItemQuantity>>;
}

/// Producer side of the broker channel.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Open (or reopen) the connection and declare the durable queue.
    async fn connect(&self) -> Result<()>;

    async fn is_connected(&self) -> bool;

    /// Hand a message to the broker and wait for its confirm.
    ///
    /// Returns `BrokerConnectionLost` only when nothing was sent.
    /// Once bytes are on the wire, failures are `DeliveryUnconfirmed`
    /// or `DeliveryRejected`.
    async fn publish(&self, message: &BrokerMessage) -> Result<()>;

    /// Release the connection.
    async fn close(&self) -> Result<()>;
}

/// Consumer side of the broker channel.
#[async_trait]
pub trait DeliverySource: Send + Sync {
    /// Declare the queue and start a subscription limited to `prefetch`
    /// unacknowledged messages.
    async fn subscribe(&self, prefetch: u16) -> Result<()>;

    /// Next delivery. `Ok(None)` means the subscription ended cleanly.
    async fn next(&self) -> Result<Option<Delivery>>;

    async fn close(&self) -> Result<()>;
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> Result<()>;

    /// Negative acknowledgement. `requeue = false` dead-letters.
    async fn reject(&self, requeue: bool) -> Result<()>;
}

/// The downstream action taken with a summary (e.g. sending an email).
#[async_trait]
pub trait SummaryHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, summary: &SummaryMessage) -> Result<()>;
}
