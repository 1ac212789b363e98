//! Domain types: transaction records, the summary contract, and broker envelopes.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};
use crate::traits::DeliveryAcker;

/// Event name carried in the AMQP `type` property of every summary.
pub const SUMMARY_EVENT: &str = "summary_created";

/// One line of a transaction: an item key and how many were sold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub item_key: String,
    pub quantity: u32,
}

impl LineItem {
    pub fn new(item_key: &str, quantity: u32) -> Self {
        Self {
            item_key: item_key.to_string(),
            quantity,
        }
    }
}

/// A persisted sale. Immutable once written to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub id: String,
    pub counterparty_name: String,
    pub amount: Decimal,
    pub reference_code: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
}

impl TransactionRecord {
    /// Check the record invariants before it is accepted by a store.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(RelayError::Validation("id should not be empty".into()));
        }
        if self.counterparty_name.trim().is_empty() {
            return Err(RelayError::Validation(
                "counterpartyName should not be empty".into(),
            ));
        }
        if self.reference_code.trim().is_empty() {
            return Err(RelayError::Validation(
                "referenceCode should not be empty".into(),
            ));
        }
        if self.amount.is_sign_negative() && !self.amount.is_zero() {
            return Err(RelayError::Validation(format!(
                "amount must not be negative (got {})",
                self.amount
            )));
        }
        if let Some(item) = self.line_items.iter().find(|i| i.item_key.trim().is_empty()) {
            return Err(RelayError::Validation(format!(
                "line item with quantity {} has an empty itemKey",
                item.quantity
            )));
        }
        Ok(())
    }
}

/// Total quantity sold for one item key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemQuantity {
    pub item_key: String,
    #[serde(rename = "totalQuantitySold")]
    pub total_quantity: u64,
}

impl ItemQuantity {
    pub fn new(item_key: &str, total_quantity: u64) -> Self {
        Self {
            item_key: item_key.to_string(),
            total_quantity,
        }
    }
}

/// The daily summary handed from the scheduler side to the consumer side.
///
/// Field names on the wire are the public contract: `totalSales`,
/// `quantityPerItem[].itemKey`, `quantityPerItem[].totalQuantitySold`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryMessage {
    #[serde(rename = "totalSales", with = "rust_decimal::serde::float")]
    pub total_amount: Decimal,
    #[serde(rename = "quantityPerItem")]
    pub quantity_per_item: Vec<ItemQuantity>,
}

impl SummaryMessage {
    pub fn new(total_amount: Decimal, quantity_per_item: Vec<ItemQuantity>) -> Self {
        Self {
            total_amount,
            quantity_per_item,
        }
    }

    /// Wrap the summary in a durable envelope with a fresh message id.
    pub fn to_broker_message(&self, routing_key: &str, message_id: &str) -> Result<BrokerMessage> {
        let payload = serde_json::to_vec(self)?;
        Ok(BrokerMessage {
            message_id: message_id.to_string(),
            routing_key: routing_key.to_string(),
            kind: SUMMARY_EVENT.to_string(),
            payload,
            durable: true,
            created_at: Utc::now(),
        })
    }

    /// Decode a delivered payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| RelayError::Serialization(format!("malformed summary payload: {e}")))
    }
}

/// The wire envelope owned by the publisher until the broker confirms it.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub message_id: String,
    pub routing_key: String,
    pub kind: String,
    pub payload: Vec<u8>,
    pub durable: bool,
    pub created_at: DateTime<Utc>,
}

/// Per-message consumer lifecycle.
///
/// `Received → Processing → {Acknowledged | Requeued → Processing | DeadLettered}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryState {
    Received,
    Processing,
    Acknowledged,
    Requeued,
    DeadLettered,
}

impl DeliveryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryState::Acknowledged | DeliveryState::DeadLettered)
    }
}

impl std::fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryState::Received => write!(f, "received"),
            DeliveryState::Processing => write!(f, "processing"),
            DeliveryState::Acknowledged => write!(f, "acknowledged"),
            DeliveryState::Requeued => write!(f, "requeued"),
            DeliveryState::DeadLettered => write!(f, "dead-lettered"),
        }
    }
}

/// A message handed to the consumer, together with the means to settle it.
pub struct Delivery {
    pub message_id: Option<String>,
    pub payload: Vec<u8>,
    pub redelivered: bool,
    /// Broker-side delivery count (quorum queues), when reported.
    pub delivery_count: Option<u32>,
    acker: Box<dyn DeliveryAcker>,
}

impl Delivery {
    pub fn new(payload: Vec<u8>, acker: Box<dyn DeliveryAcker>) -> Self {
        Self {
            message_id: None,
            payload,
            redelivered: false,
            delivery_count: None,
            acker,
        }
    }

    pub fn with_message_id(mut self, message_id: Option<String>) -> Self {
        self.message_id = message_id;
        self
    }

    pub fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    pub fn with_delivery_count(mut self, delivery_count: Option<u32>) -> Self {
        self.delivery_count = delivery_count;
        self
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn requeue(&self) -> Result<()> {
        self.acker.reject(true).await
    }

    pub async fn dead_letter(&self) -> Result<()> {
        self.acker.reject(false).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message_id", &self.message_id)
            .field("payload_len", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .field("delivery_count", &self.delivery_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(amount: i64) -> TransactionRecord {
        TransactionRecord {
            id: "inv-1".into(),
            counterparty_name: "Ahsan Amin".into(),
            amount: Decimal::from(amount),
            reference_code: "REF123".into(),
            occurred_at: Utc::now(),
            line_items: vec![LineItem::new("ITEM01", 3)],
        }
    }

    #[test]
    fn test_validate_accepts_well_formed_record() {
        assert!(record(200).validate().is_ok());
        assert!(record(0).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_negative_amount() {
        assert!(matches!(
            record(-1).validate(),
            Err(RelayError::Validation(_))
        ));
    }

    #[test]
    fn test_validate_rejects_missing_counterparty() {
        let mut r = record(100);
        r.counterparty_name = "  ".into();
        let err = r.validate().unwrap_err();
        assert!(err.to_string().contains("counterpartyName"));
    }

    #[test]
    fn test_summary_wire_field_names() {
        let summary = SummaryMessage::new(
            Decimal::from(300),
            vec![ItemQuantity::new("ITEM01", 5)],
        );
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["totalSales"].as_f64(), Some(300.0));
        assert_eq!(value["quantityPerItem"][0]["itemKey"], "ITEM01");
        assert_eq!(value["quantityPerItem"][0]["totalQuantitySold"], 5);
    }

    #[test]
    fn test_summary_parses_producer_payload() {
        let payload = br#"{"totalSales":300,"quantityPerItem":[{"itemKey":"ITEM01","totalQuantitySold":5}]}"#;
        let summary = SummaryMessage::from_payload(payload).unwrap();
        assert_eq!(summary.total_amount, Decimal::from(300));
        assert_eq!(summary.quantity_per_item, vec![ItemQuantity::new("ITEM01", 5)]);
    }

    #[test]
    fn test_malformed_payload_is_serialization_error() {
        let err = SummaryMessage::from_payload(b"{not json").unwrap_err();
        assert!(matches!(err, RelayError::Serialization(_)));
    }

    #[test]
    fn test_broker_message_is_durable() {
        let summary = SummaryMessage::new(Decimal::ZERO, vec![]);
        let msg = summary.to_broker_message("daily_sales_report", "m-1").unwrap();
        assert!(msg.durable);
        assert_eq!(msg.kind, SUMMARY_EVENT);
        assert_eq!(msg.routing_key, "daily_sales_report");
    }

    #[test]
    fn test_terminal_states() {
        assert!(DeliveryState::Acknowledged.is_terminal());
        assert!(DeliveryState::DeadLettered.is_terminal());
        assert!(!DeliveryState::Requeued.is_terminal());
    }
}
