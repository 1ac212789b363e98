//! In-memory record store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use salesrelay_core::error::{RelayError, Result};
use salesrelay_core::traits::RecordStore;
use salesrelay_core::types::{ItemQuantity, TransactionRecord};

#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<Vec<TransactionRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-filled with `records`, validating each.
    pub async fn with_records(records: Vec<TransactionRecord>) -> Result<Self> {
        let store = Self::new();
        for record in records {
            store.insert(record).await?;
        }
        Ok(store)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn insert(&self, record: TransactionRecord) -> Result<()> {
        record.validate()?;
        let mut records = self.records.write().await;
        if records.iter().any(|r| r.id == record.id) {
            return Err(RelayError::Validation(format!(
                "record '{}' already exists",
                record.id
            )));
        }
        records.push(record);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<TransactionRecord>> {
        let records = self.records.read().await;
        Ok(records.iter().find(|r| r.id == id).cloned())
    }

    async fn list(&self) -> Result<Vec<TransactionRecord>> {
        Ok(self.records.read().await.clone())
    }

    async fn records_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TransactionRecord>> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|r| r.occurred_at >= start && r.occurred_at < end)
            .cloned()
            .collect())
    }

    async fn quantity_by_item(&self) -> Result<Vec<ItemQuantity>> {
        let records = self.records.read().await;
        let mut totals: BTreeMap<&str, u64> = BTreeMap::new();
        for item in records.iter().flat_map(|r| r.line_items.iter()) {
            *totals.entry(item.item_key.as_str()).or_insert(0) += u64::from(item.quantity);
        }
        Ok(totals
            .into_iter()
            .map(|(key, total)| ItemQuantity::new(key, total))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal::Decimal;
    use salesrelay_core::types::LineItem;

    fn record(id: &str, amount: i64, at: DateTime<Utc>) -> TransactionRecord {
        TransactionRecord {
            id: id.into(),
            counterparty_name: "Acme".into(),
            amount: Decimal::from(amount),
            reference_code: format!("REF-{id}"),
            occurred_at: at,
            line_items: vec![LineItem::new("ITEM01", 1)],
        }
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicates_and_invalid() {
        let store = MemoryRecordStore::new();
        let now = Utc::now();
        store.insert(record("a", 10, now)).await.unwrap();
        assert!(store.insert(record("a", 10, now)).await.is_err());
        assert!(store.insert(record("b", -5, now)).await.is_err());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_range_is_half_open() {
        let end = Utc::now();
        let start = end - Duration::hours(24);
        let store = MemoryRecordStore::with_records(vec![
            record("at-start", 1, start),
            record("at-end", 2, end),
            record("before", 4, start - Duration::seconds(1)),
        ])
        .await
        .unwrap();

        let found = store.records_between(start, end).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "at-start");
    }
}
