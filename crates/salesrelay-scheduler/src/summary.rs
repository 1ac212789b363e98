//! The daily firing body: aggregate, then publish.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use salesrelay_broker::Publisher;
use salesrelay_core::error::Result;
use salesrelay_core::events::{EventSink, PipelineEvent};
use salesrelay_store::Aggregator;

use crate::engine::FiringJob;

pub struct SummaryJob {
    aggregator: Aggregator,
    publisher: Publisher,
    window: chrono::Duration,
    events: Arc<dyn EventSink>,
}

impl SummaryJob {
    pub fn new(
        aggregator: Aggregator,
        publisher: Publisher,
        window: chrono::Duration,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            aggregator,
            publisher,
            window,
            events,
        }
    }

    /// Summarize the window ending at `now` and publish it.
    /// Returns the published message id.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<String> {
        let summary = self.aggregator.summarize(now, self.window).await?;
        self.events.record(PipelineEvent::SummaryComputed {
            total_amount: summary.total_amount,
            item_count: summary.quantity_per_item.len(),
        });
        for item in &summary.quantity_per_item {
            tracing::debug!("📦 {}: {} sold", item.item_key, item.total_quantity);
        }
        self.publisher.publish(&summary).await
    }

    /// Release the broker connection.
    pub async fn close(&self) -> Result<()> {
        self.publisher.close().await
    }
}

#[async_trait]
impl FiringJob for SummaryJob {
    fn name(&self) -> &str {
        "daily-sales-summary"
    }

    async fn run(&self) -> Result<()> {
        self.run_at(Utc::now()).await.map(|_| ())
    }
}
