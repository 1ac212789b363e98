//! Consumer: bounded-prefetch processing of summaries with explicit settlement.
//!
//! A delivery is fetched only when a prefetch permit is free, so with
//! `prefetch = 1` the next message is not pulled until the previous one has
//! been acknowledged, requeued or dead-lettered.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use salesrelay_core::config::{BrokerConfig, ConsumerConfig};
use salesrelay_core::error::{RelayError, Result};
use salesrelay_core::events::{EventSink, PipelineEvent};
use salesrelay_core::traits::{DeliverySource, SummaryHandler};
use salesrelay_core::types::{Delivery, DeliveryState, SummaryMessage};

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub prefetch: u16,
    /// Handler attempts before a message is dead-lettered.
    pub max_attempts: u32,
    pub handler_timeout: Duration,
    pub reconnect_interval: Duration,
    /// Messages whose attempt count is remembered; the oldest is dropped first.
    pub tracked_messages: usize,
}

impl ConsumerSettings {
    pub fn from_config(consumer: &ConsumerConfig, broker: &BrokerConfig) -> Self {
        Self {
            prefetch: consumer.prefetch,
            max_attempts: consumer.max_attempts,
            handler_timeout: consumer.handler_timeout(),
            reconnect_interval: broker.reconnect_interval(),
            ..Self::default()
        }
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            prefetch: 1,
            max_attempts: 3,
            handler_timeout: Duration::from_secs(60),
            reconnect_interval: Duration::from_secs(5),
            tracked_messages: 1024,
        }
    }
}

/// Key used to track attempts for a delivery. Falls back to a payload digest
/// when the producer set no message id.
pub fn delivery_key(delivery: &Delivery) -> String {
    match &delivery.message_id {
        Some(id) if !id.is_empty() => id.clone(),
        _ => format!("sha256:{:x}", Sha256::digest(&delivery.payload)),
    }
}

/// Attempt counts per delivery key, bounded to `capacity` entries.
/// Entries that never reach a terminal state here (a requeue picked up by
/// another consumer, a lost ack) age out instead of accumulating.
struct AttemptLedger {
    counts: HashMap<String, u32>,
    order: VecDeque<String>,
    capacity: usize,
}

impl AttemptLedger {
    fn new(capacity: usize) -> Self {
        Self {
            counts: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Count one more attempt for `key`, never below `floor`.
    fn bump(&mut self, key: &str, floor: u32) -> u32 {
        if !self.counts.contains_key(key) {
            while self.counts.len() >= self.capacity {
                let Some(oldest) = self.order.pop_front() else {
                    break;
                };
                self.counts.remove(&oldest);
            }
            self.order.push_back(key.to_string());
        }
        let count = self.counts.entry(key.to_string()).or_insert(0);
        *count = (*count + 1).max(floor);
        *count
    }

    fn forget(&mut self, key: &str) {
        if self.counts.remove(key).is_some() {
            self.order.retain(|k| k != key);
        }
    }

    fn len(&self) -> usize {
        self.counts.len()
    }
}

pub struct Consumer {
    source: Arc<dyn DeliverySource>,
    handler: Arc<dyn SummaryHandler>,
    settings: ConsumerSettings,
    events: Arc<dyn EventSink>,
    attempts: Mutex<AttemptLedger>,
}

impl Consumer {
    pub fn new(
        source: Arc<dyn DeliverySource>,
        handler: Arc<dyn SummaryHandler>,
        settings: ConsumerSettings,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let attempts = Mutex::new(AttemptLedger::new(settings.tracked_messages));
        Self {
            source,
            handler,
            settings,
            events,
            attempts,
        }
    }

    /// Consume until `token` is cancelled, resubscribing whenever the
    /// subscription drops. In-flight messages are settled before returning.
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> Result<()> {
        let permits = Arc::new(Semaphore::new(usize::from(self.settings.prefetch.max(1))));
        let mut in_flight = JoinSet::new();
        let mut subscribed = false;
        let mut reconnects = 0u32;

        tracing::info!(
            "📥 Consumer started (handler '{}', prefetch {})",
            self.handler.name(),
            self.settings.prefetch
        );

        loop {
            while in_flight.try_join_next().is_some() {}

            if !subscribed {
                match self.source.subscribe(self.settings.prefetch).await {
                    Ok(()) => {
                        subscribed = true;
                        reconnects = 0;
                    }
                    Err(e) => {
                        reconnects += 1;
                        self.events.record(PipelineEvent::ConsumerReconnect {
                            attempt: reconnects,
                            error: e.to_string(),
                        });
                        if self.pause(&token).await {
                            break;
                        }
                        continue;
                    }
                }
            }

            let permit = tokio::select! {
                _ = token.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let next = tokio::select! {
                _ = token.cancelled() => break,
                next = self.source.next() => next,
            };

            match next {
                Ok(Some(delivery)) => {
                    let consumer = Arc::clone(&self);
                    in_flight.spawn(async move {
                        let _permit = permit;
                        consumer.process(delivery).await
                    });
                }
                Ok(None) => {
                    subscribed = false;
                    reconnects += 1;
                    self.events.record(PipelineEvent::ConsumerReconnect {
                        attempt: reconnects,
                        error: "subscription ended".into(),
                    });
                    if self.pause(&token).await {
                        break;
                    }
                }
                Err(e) => {
                    subscribed = false;
                    reconnects += 1;
                    self.events.record(PipelineEvent::ConsumerReconnect {
                        attempt: reconnects,
                        error: e.to_string(),
                    });
                    if self.pause(&token).await {
                        break;
                    }
                }
            }
        }

        if !in_flight.is_empty() {
            tracing::info!("⏳ Draining {} in-flight message(s)", in_flight.len());
        }
        while in_flight.join_next().await.is_some() {}

        if let Err(e) = self.source.close().await {
            tracing::warn!("⚠️ Consumer close failed: {e}");
        }
        tracing::info!("🛑 Consumer stopped");
        Ok(())
    }

    /// Wait one reconnect interval. Returns true if cancelled meanwhile.
    async fn pause(&self, token: &CancellationToken) -> bool {
        tokio::select! {
            _ = token.cancelled() => true,
            _ = tokio::time::sleep(self.settings.reconnect_interval) => false,
        }
    }

    /// Handle and settle one delivery, returning the state it ended in.
    pub async fn process(&self, delivery: Delivery) -> DeliveryState {
        let key = delivery_key(&delivery);
        let attempt = self.next_attempt(&key, &delivery);
        self.transition(&key, DeliveryState::Received, attempt);

        let summary = match SummaryMessage::from_payload(&delivery.payload) {
            Ok(summary) => summary,
            Err(e) => {
                self.report(&key, &e);
                return self.dead_letter(&key, &delivery, attempt).await;
            }
        };

        self.transition(&key, DeliveryState::Processing, attempt);
        let outcome =
            match tokio::time::timeout(self.settings.handler_timeout, self.handler.handle(&summary))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(RelayError::HandlerFailure(format!(
                    "handler '{}' timed out after {:?}",
                    self.handler.name(),
                    self.settings.handler_timeout
                ))),
            };

        match outcome {
            Ok(()) => match delivery.ack().await {
                Ok(()) => {
                    self.forget(&key);
                    self.transition(&key, DeliveryState::Acknowledged, attempt);
                    DeliveryState::Acknowledged
                }
                Err(e) => {
                    // Unacked on a dead channel: the broker redelivers it.
                    self.report(&key, &e);
                    self.transition(&key, DeliveryState::Requeued, attempt);
                    DeliveryState::Requeued
                }
            },
            Err(e) => {
                self.report(&key, &e);
                if attempt < self.settings.max_attempts {
                    if let Err(e) = delivery.requeue().await {
                        self.report(&key, &e);
                    }
                    self.transition(&key, DeliveryState::Requeued, attempt);
                    DeliveryState::Requeued
                } else {
                    self.dead_letter(&key, &delivery, attempt).await
                }
            }
        }
    }

    async fn dead_letter(&self, key: &str, delivery: &Delivery, attempt: u32) -> DeliveryState {
        match delivery.dead_letter().await {
            Ok(()) => {
                self.forget(key);
                self.transition(key, DeliveryState::DeadLettered, attempt);
                DeliveryState::DeadLettered
            }
            Err(e) => {
                self.report(key, &e);
                self.transition(key, DeliveryState::Requeued, attempt);
                DeliveryState::Requeued
            }
        }
    }

    /// 1-based attempt number: the larger of the local count and the
    /// broker-reported delivery count.
    fn next_attempt(&self, key: &str, delivery: &Delivery) -> u32 {
        let from_broker = delivery.delivery_count.map_or(1, |count| count.saturating_add(1));
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .bump(key, from_broker)
    }

    fn forget(&self, key: &str) {
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .forget(key);
    }

    /// Number of messages with a remembered attempt count.
    pub fn tracked_len(&self) -> usize {
        self.attempts.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn transition(&self, key: &str, state: DeliveryState, attempt: u32) {
        self.events.record(PipelineEvent::DeliveryTransition {
            message_id: key.to_string(),
            state,
            attempt,
        });
    }

    fn report(&self, key: &str, error: &RelayError) {
        self.events.record(PipelineEvent::DeliveryError {
            message_id: key.to_string(),
            error: error.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use salesrelay_core::events::EventLog;
    use salesrelay_core::types::ItemQuantity;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct RecordingHandler {
        calls: Mutex<Vec<SummaryMessage>>,
        failures_left: AtomicU32,
        delay: Duration,
    }

    impl RecordingHandler {
        fn new() -> Self {
            Self::failing(0)
        }

        fn failing(times: u32) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                failures_left: AtomicU32::new(times),
                delay: Duration::ZERO,
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::new()
            }
        }

        fn calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl SummaryHandler for RecordingHandler {
        fn name(&self) -> &str {
            "recording"
        }

        async fn handle(&self, summary: &SummaryMessage) -> Result<()> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.calls.lock().unwrap().push(summary.clone());
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(RelayError::HandlerFailure("smtp down".into()));
            }
            Ok(())
        }
    }

    fn payload(total: i64) -> Vec<u8> {
        let summary = SummaryMessage::new(Decimal::from(total), vec![ItemQuantity::new("ITEM01", 5)]);
        serde_json::to_vec(&summary).unwrap()
    }

    fn settings() -> ConsumerSettings {
        ConsumerSettings {
            prefetch: 1,
            max_attempts: 3,
            handler_timeout: Duration::from_secs(1),
            reconnect_interval: Duration::from_millis(10),
            tracked_messages: 16,
        }
    }

    fn consumer(
        broker: &MemoryBroker,
        handler: Arc<RecordingHandler>,
        settings: ConsumerSettings,
    ) -> (Arc<Consumer>, Arc<EventLog>) {
        let events = Arc::new(EventLog::new());
        let consumer = Consumer::new(Arc::new(broker.clone()), handler, settings, events.clone());
        (Arc::new(consumer), events)
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_successful_delivery_is_acknowledged() {
        let broker = MemoryBroker::new();
        broker.push_raw(&payload(300), Some("m1"));
        let handler = Arc::new(RecordingHandler::new());
        let (consumer, events) = consumer(&broker, handler.clone(), settings());

        broker.subscribe(1).await.unwrap();
        let delivery = broker.next().await.unwrap().unwrap();
        assert_eq!(consumer.process(delivery).await, DeliveryState::Acknowledged);

        assert_eq!(handler.calls(), 1);
        assert_eq!(broker.queue_len(), 0);
        assert_eq!(broker.unacked_len(), 0);
        assert_eq!(events.count("delivery_acknowledged"), 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dead_lettered_without_handler() {
        let broker = MemoryBroker::new();
        broker.push_raw(b"{not json", Some("bad"));
        let handler = Arc::new(RecordingHandler::new());
        let (consumer, events) = consumer(&broker, handler.clone(), settings());

        broker.subscribe(1).await.unwrap();
        let delivery = broker.next().await.unwrap().unwrap();
        assert_eq!(consumer.process(delivery).await, DeliveryState::DeadLettered);

        assert_eq!(handler.calls(), 0);
        assert_eq!(broker.dead_letters().len(), 1);
        assert_eq!(broker.queue_len(), 0);
        assert_eq!(events.count("delivery_error"), 1);
    }

    #[tokio::test]
    async fn test_failing_handler_is_retried_then_dead_lettered() {
        let broker = MemoryBroker::new();
        broker.push_raw(&payload(300), Some("m1"));
        let handler = Arc::new(RecordingHandler::failing(u32::MAX));
        let (consumer, _events) = consumer(&broker, handler.clone(), settings());

        broker.subscribe(1).await.unwrap();
        let mut states = Vec::new();
        for _ in 0..3 {
            let delivery = broker.next().await.unwrap().unwrap();
            states.push(consumer.process(delivery).await);
        }

        assert_eq!(
            states,
            vec![
                DeliveryState::Requeued,
                DeliveryState::Requeued,
                DeliveryState::DeadLettered
            ]
        );
        assert_eq!(handler.calls(), 3);
        assert_eq!(broker.dead_letters().len(), 1);
        assert_eq!(broker.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_recovers_on_redelivery() {
        let broker = MemoryBroker::new();
        broker.push_raw(&payload(300), Some("m1"));
        let handler = Arc::new(RecordingHandler::failing(1));
        let (consumer, _events) = consumer(&broker, handler.clone(), settings());

        broker.subscribe(1).await.unwrap();
        let first = broker.next().await.unwrap().unwrap();
        assert_eq!(consumer.process(first).await, DeliveryState::Requeued);
        let second = broker.next().await.unwrap().unwrap();
        assert!(second.redelivered);
        assert_eq!(consumer.process(second).await, DeliveryState::Acknowledged);
        assert!(broker.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_handler_timeout_counts_as_failure() {
        let broker = MemoryBroker::new();
        broker.push_raw(&payload(1), Some("slow"));
        let handler = Arc::new(RecordingHandler::slow(Duration::from_secs(5)));
        let (consumer, _events) = consumer(
            &broker,
            handler,
            ConsumerSettings {
                max_attempts: 1,
                handler_timeout: Duration::from_millis(20),
                ..settings()
            },
        );

        broker.subscribe(1).await.unwrap();
        let delivery = broker.next().await.unwrap().unwrap();
        assert_eq!(consumer.process(delivery).await, DeliveryState::DeadLettered);
    }

    #[tokio::test]
    async fn test_prefetch_one_is_strictly_sequential() {
        let broker = MemoryBroker::new();
        for (i, total) in [100, 200, 300].into_iter().enumerate() {
            broker.push_raw(&payload(total), Some(&format!("m{i}")));
        }
        let handler = Arc::new(RecordingHandler::slow(Duration::from_millis(10)));
        let (consumer, events) = consumer(&broker, handler.clone(), settings());

        let token = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&consumer).run(token.clone()));
        wait_until(|| events.count("delivery_acknowledged") == 3).await;
        token.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(broker.max_unacked(), 1);
        let order: Vec<DeliveryState> = events
            .events()
            .into_iter()
            .filter_map(|e| match e {
                PipelineEvent::DeliveryTransition { state, .. }
                    if matches!(state, DeliveryState::Processing | DeliveryState::Acknowledged) =>
                {
                    Some(state)
                }
                _ => None,
            })
            .collect();
        assert_eq!(order.len(), 6);
        for pair in order.chunks(2) {
            assert_eq!(pair, [DeliveryState::Processing, DeliveryState::Acknowledged]);
        }
    }

    #[tokio::test]
    async fn test_resubscribes_after_outage() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let handler = Arc::new(RecordingHandler::new());
        let (consumer, events) = consumer(&broker, handler.clone(), settings());

        let token = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&consumer).run(token.clone()));
        wait_until(|| events.count("consumer_reconnect") >= 1).await;

        broker.set_available(true);
        broker.push_raw(&payload(300), Some("after-outage"));
        wait_until(|| handler.calls() == 1).await;

        token.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(broker.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_drains_in_flight_message() {
        let broker = MemoryBroker::new();
        broker.push_raw(&payload(300), Some("m1"));
        let handler = Arc::new(RecordingHandler::slow(Duration::from_millis(50)));
        let (consumer, events) = consumer(&broker, handler.clone(), settings());

        let token = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&consumer).run(token.clone()));
        wait_until(|| events.count("delivery_processing") == 1).await;
        token.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(handler.calls(), 1);
        assert_eq!(events.count("delivery_acknowledged"), 1);
        assert_eq!(broker.unacked_len(), 0);
    }

    #[tokio::test]
    async fn test_attempt_ledger_is_bounded() {
        let broker = MemoryBroker::new();
        for i in 0..5 {
            broker.push_raw(&payload(i), Some(&format!("m{i}")));
        }
        let handler = Arc::new(RecordingHandler::failing(u32::MAX));
        let (consumer, _events) = consumer(
            &broker,
            handler,
            ConsumerSettings {
                max_attempts: 10,
                tracked_messages: 2,
                ..settings()
            },
        );

        broker.subscribe(0).await.unwrap();
        let mut deliveries = Vec::new();
        for _ in 0..5 {
            deliveries.push(broker.next().await.unwrap().unwrap());
        }
        for delivery in deliveries {
            assert_eq!(consumer.process(delivery).await, DeliveryState::Requeued);
        }
        assert_eq!(consumer.tracked_len(), 2);
    }

    #[test]
    fn test_ledger_evicts_oldest_and_forgets_settled() {
        let mut ledger = AttemptLedger::new(2);
        assert_eq!(ledger.bump("a", 1), 1);
        assert_eq!(ledger.bump("a", 1), 2);
        assert_eq!(ledger.bump("b", 1), 1);
        assert_eq!(ledger.bump("c", 1), 1);
        assert_eq!(ledger.len(), 2);

        // "a" was evicted, so it starts over from the broker floor
        assert_eq!(ledger.bump("a", 3), 3);
        assert_eq!(ledger.len(), 2);

        ledger.forget("a");
        assert_eq!(ledger.len(), 1);
        assert!(ledger.order.iter().all(|k| k != "a"));
    }

    #[test]
    fn test_delivery_key_falls_back_to_digest() {
        struct NoopAcker;

        #[async_trait]
        impl salesrelay_core::traits::DeliveryAcker for NoopAcker {
            async fn ack(&self) -> Result<()> {
                Ok(())
            }
            async fn reject(&self, _: bool) -> Result<()> {
                Ok(())
            }
        }

        let with_id = Delivery::new(b"x".to_vec(), Box::new(NoopAcker))
            .with_message_id(Some("m1".into()));
        assert_eq!(delivery_key(&with_id), "m1");

        let a = Delivery::new(b"same".to_vec(), Box::new(NoopAcker));
        let b = Delivery::new(b"same".to_vec(), Box::new(NoopAcker));
        assert!(delivery_key(&a).starts_with("sha256:"));
        assert_eq!(delivery_key(&a), delivery_key(&b));
    }
}
