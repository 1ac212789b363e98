//! Publisher: serialize a summary, hand it to the broker, wait for the confirm.
//!
//! Reconnects under a bounded `ReconnectPolicy` while nothing has been sent.
//! Once a message may have reached the broker (lost or negative confirm) the
//! failure is returned immediately and the message is never resent.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use salesrelay_core::config::BrokerConfig;
use salesrelay_core::error::{RelayError, Result};
use salesrelay_core::events::{EventSink, PipelineEvent};
use salesrelay_core::traits::BrokerTransport;
use salesrelay_core::types::{BrokerMessage, SummaryMessage};

use crate::retry::ReconnectPolicy;

#[derive(Debug, Clone)]
pub struct PublisherSettings {
    /// Queue name; summaries go through the default exchange.
    pub routing_key: String,
    pub operation_timeout: Duration,
    pub policy: ReconnectPolicy,
}

impl PublisherSettings {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            routing_key: config.queue.clone(),
            operation_timeout: config.operation_timeout(),
            policy: ReconnectPolicy::from_config(config),
        }
    }
}

pub struct Publisher {
    transport: Arc<dyn BrokerTransport>,
    settings: PublisherSettings,
    events: Arc<dyn EventSink>,
}

impl Publisher {
    pub fn new(
        transport: Arc<dyn BrokerTransport>,
        settings: PublisherSettings,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            transport,
            settings,
            events,
        }
    }

    /// Publish one summary as a durable message. Returns its message id once
    /// the broker has confirmed it.
    pub async fn publish(&self, summary: &SummaryMessage) -> Result<String> {
        let message_id = Uuid::new_v4().to_string();
        let message = summary.to_broker_message(&self.settings.routing_key, &message_id)?;

        let mut failures = 0u32;
        loop {
            match self.attempt(&message).await {
                Ok(()) => {
                    self.events.record(PipelineEvent::Published {
                        message_id: message_id.clone(),
                        attempts: failures + 1,
                    });
                    return Ok(message_id);
                }
                Err(e) if e.is_retryable() && self.settings.policy.should_retry(failures + 1) => {
                    failures += 1;
                    self.events.record(PipelineEvent::PublishRetry {
                        attempt: failures,
                        error: e.to_string(),
                    });
                    tokio::time::sleep(self.settings.policy.delay_for_attempt(failures)).await;
                }
                Err(e) => {
                    self.events.record(PipelineEvent::PublishFailed {
                        message_id,
                        error: e.to_string(),
                    });
                    return Err(e);
                }
            }
        }
    }

    async fn attempt(&self, message: &BrokerMessage) -> Result<()> {
        let limit = self.settings.operation_timeout;

        if !self.transport.is_connected().await {
            tokio::time::timeout(limit, self.transport.connect())
                .await
                .map_err(|_| {
                    RelayError::BrokerConnectionLost(format!("connect timed out after {limit:?}"))
                })??;
        }

        match tokio::time::timeout(limit, self.transport.publish(message)).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::DeliveryUnconfirmed(format!(
                "no confirm for {} within {limit:?}",
                message.message_id
            ))),
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.transport.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use rust_decimal::Decimal;
    use salesrelay_core::events::EventLog;
    use salesrelay_core::types::ItemQuantity;

    fn summary() -> SummaryMessage {
        SummaryMessage::new(Decimal::from(300), vec![ItemQuantity::new("ITEM01", 5)])
    }

    fn publisher(broker: &MemoryBroker, policy: ReconnectPolicy) -> (Publisher, Arc<EventLog>) {
        let events = Arc::new(EventLog::new());
        let publisher = Publisher::new(
            Arc::new(broker.clone()),
            PublisherSettings {
                routing_key: "daily_sales_report".into(),
                operation_timeout: Duration::from_secs(1),
                policy,
            },
            events.clone(),
        );
        (publisher, events)
    }

    #[tokio::test]
    async fn test_publish_enqueues_one_durable_message() {
        let broker = MemoryBroker::new();
        let (publisher, events) = publisher(&broker, ReconnectPolicy::default());

        let id = publisher.publish(&summary()).await.unwrap();

        let queued = broker.queued();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].message_id.as_deref(), Some(id.as_str()));
        assert_eq!(SummaryMessage::from_payload(&queued[0].payload).unwrap(), summary());
        assert_eq!(events.count("published"), 1);
    }

    #[tokio::test]
    async fn test_reconnects_after_outage() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let (publisher, events) =
            publisher(&broker, ReconnectPolicy::fixed(Duration::from_millis(20), 10));

        let restore = {
            let broker = broker.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                broker.set_available(true);
            })
        };

        publisher.publish(&summary()).await.unwrap();
        restore.await.unwrap();

        assert_eq!(broker.queue_len(), 1);
        assert!(events.count("publish_retry") >= 1);
        assert_eq!(events.count("publish_failed"), 0);
    }

    #[tokio::test]
    async fn test_gives_up_after_retry_budget() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let (publisher, events) =
            publisher(&broker, ReconnectPolicy::fixed(Duration::from_millis(1), 2));

        let err = publisher.publish(&summary()).await.unwrap_err();

        assert!(matches!(err, RelayError::BrokerConnectionLost(_)));
        assert_eq!(events.count("publish_retry"), 2);
        assert_eq!(events.count("publish_failed"), 1);
        assert_eq!(broker.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_unconfirmed_publish_is_not_resent() {
        let broker = MemoryBroker::new();
        broker.lose_next_confirm();
        let (publisher, events) =
            publisher(&broker, ReconnectPolicy::fixed(Duration::from_millis(1), 5));

        let err = publisher.publish(&summary()).await.unwrap_err();

        assert!(matches!(err, RelayError::DeliveryUnconfirmed(_)));
        assert_eq!(broker.publish_calls(), 1);
        assert_eq!(broker.queue_len(), 1);
        assert_eq!(events.count("publish_retry"), 0);
    }
}
