//! Aggregator: turns stored records into a `SummaryMessage`.
//!
//! Both operations are read-only and bounded by the query timeout; a timeout or
//! store fault surfaces as `StoreUnavailable` and aborts only the current firing.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use salesrelay_core::error::{RelayError, Result};
use salesrelay_core::traits::RecordStore;
use salesrelay_core::types::{ItemQuantity, SummaryMessage};

pub struct Aggregator {
    store: Arc<dyn RecordStore>,
    query_timeout: Duration,
}

impl Aggregator {
    pub fn new(store: Arc<dyn RecordStore>, query_timeout: Duration) -> Self {
        Self {
            store,
            query_timeout,
        }
    }

    /// `[end - length, end)`.
    pub fn trailing_window(
        end: DateTime<Utc>,
        length: chrono::Duration,
    ) -> (DateTime<Utc>, DateTime<Utc>) {
        (end - length, end)
    }

    /// Sum of `amount` over records with `occurred_at` in `[start, end)`.
    /// Zero when nothing matches; `AggregateOverflow` past `Decimal::MAX`.
    pub async fn compute_total_amount(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Decimal> {
        let records = self
            .bounded("records_between", self.store.records_between(start, end))
            .await?;
        let total = records
            .iter()
            .try_fold(Decimal::ZERO, |acc, r| acc.checked_add(r.amount))
            .ok_or_else(|| {
                RelayError::AggregateOverflow(format!(
                    "total of {} records in [{start}, {end}) exceeds the decimal range",
                    records.len()
                ))
            })?;
        tracing::debug!(
            "🧮 {} records in [{start}, {end}) → total {total}",
            records.len()
        );
        Ok(total)
    }

    /// Quantity per item key over ALL records, ordered by item key.
    ///
    /// Not windowed, unlike `compute_total_amount`. The two stay distinct
    /// until the report owners decide whether the all-time count is intended.
    pub async fn compute_quantity_by_item(&self) -> Result<Vec<ItemQuantity>> {
        let grouped = self
            .bounded("quantity_by_item", self.store.quantity_by_item())
            .await?;
        let mut totals: BTreeMap<String, u64> = BTreeMap::new();
        for entry in grouped {
            let total = totals.entry(entry.item_key).or_insert(0);
            *total = total.checked_add(entry.total_quantity).ok_or_else(|| {
                RelayError::AggregateOverflow("item quantity exceeds u64".into())
            })?;
        }
        Ok(totals
            .into_iter()
            .map(|(item_key, total_quantity)| ItemQuantity {
                item_key,
                total_quantity,
            })
            .collect())
    }

    /// Both aggregations for a trailing window ending at `now`.
    pub async fn summarize(
        &self,
        now: DateTime<Utc>,
        window: chrono::Duration,
    ) -> Result<SummaryMessage> {
        let (start, end) = Self::trailing_window(now, window);
        let total_amount = self.compute_total_amount(start, end).await?;
        let quantity_per_item = self.compute_quantity_by_item().await?;
        Ok(SummaryMessage::new(total_amount, quantity_per_item))
    }

    async fn bounded<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.query_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::StoreUnavailable(format!(
                "{what} timed out after {:?}",
                self.query_timeout
            ))),
        }
    }
}
