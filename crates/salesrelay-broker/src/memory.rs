//! In-process broker with the same semantics as the AMQP channel:
//! one durable queue, prefetch-limited delivery, explicit ack/nack and a
//! dead-letter list. Outages and lost confirms can be injected.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;

use salesrelay_core::error::{RelayError, Result};
use salesrelay_core::traits::{BrokerTransport, DeliveryAcker, DeliverySource};
use salesrelay_core::types::{BrokerMessage, Delivery};

/// A message sitting in (or dead-lettered from) the memory queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub message_id: Option<String>,
    pub payload: Vec<u8>,
    pub redelivered: bool,
    /// Times this message has been handed to a consumer.
    pub deliveries: u32,
}

impl QueuedMessage {
    fn from_broker(message: &BrokerMessage) -> Self {
        Self {
            message_id: Some(message.message_id.clone()),
            payload: message.payload.clone(),
            redelivered: false,
            deliveries: 0,
        }
    }
}

struct State {
    available: bool,
    producer_connected: bool,
    subscribed: bool,
    closed: bool,
    prefetch: u16,
    queue: VecDeque<QueuedMessage>,
    unacked: HashMap<u64, QueuedMessage>,
    dead_letters: Vec<QueuedMessage>,
    next_tag: u64,
    lose_next_confirm: bool,
    publish_calls: u32,
    max_unacked: usize,
}

impl Default for State {
    fn default() -> Self {
        Self {
            available: true,
            producer_connected: false,
            subscribed: false,
            closed: false,
            prefetch: 1,
            queue: VecDeque::new(),
            unacked: HashMap::new(),
            dead_letters: Vec::new(),
            next_tag: 1,
            lose_next_confirm: false,
            publish_calls: 0,
            max_unacked: 0,
        }
    }
}

impl State {
    /// Unacked messages go back to the head of the queue, as on channel close.
    fn requeue_unacked(&mut self) {
        let mut tags: Vec<u64> = self.unacked.keys().copied().collect();
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            if let Some(mut message) = self.unacked.remove(&tag) {
                message.redelivered = true;
                self.queue.push_front(message);
            }
        }
    }

    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked.len() < usize::from(self.prefetch)
    }
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Cloneable handle; all clones share one queue.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the broker going down or coming back. Going down drops both
    /// connections and returns unacked messages to the queue.
    pub fn set_available(&self, available: bool) {
        {
            let mut state = self.inner.lock();
            state.available = available;
            if !available {
                state.producer_connected = false;
                state.subscribed = false;
                state.requeue_unacked();
            }
        }
        self.inner.notify.notify_one();
    }

    /// The next publish is enqueued but its confirm never arrives.
    pub fn lose_next_confirm(&self) {
        self.inner.lock().lose_next_confirm = true;
    }

    /// Enqueue a payload directly, bypassing the producer side.
    pub fn push_raw(&self, payload: &[u8], message_id: Option<&str>) {
        self.inner.lock().queue.push_back(QueuedMessage {
            message_id: message_id.map(str::to_string),
            payload: payload.to_vec(),
            redelivered: false,
            deliveries: 0,
        });
        self.inner.notify.notify_one();
    }

    /// End all subscriptions; `next` returns `Ok(None)` from now on.
    pub fn shutdown(&self) {
        self.inner.lock().closed = true;
        self.inner.notify.notify_one();
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn queued(&self) -> Vec<QueuedMessage> {
        self.inner.lock().queue.iter().cloned().collect()
    }

    pub fn unacked_len(&self) -> usize {
        self.inner.lock().unacked.len()
    }

    pub fn dead_letters(&self) -> Vec<QueuedMessage> {
        self.inner.lock().dead_letters.clone()
    }

    pub fn publish_calls(&self) -> u32 {
        self.inner.lock().publish_calls
    }

    /// High-water mark of simultaneously unacknowledged deliveries.
    pub fn max_unacked(&self) -> usize {
        self.inner.lock().max_unacked
    }

    fn unreachable() -> RelayError {
        RelayError::BrokerConnectionLost("memory broker unavailable".into())
    }
}

#[async_trait]
impl BrokerTransport for MemoryBroker {
    async fn connect(&self) -> Result<()> {
        let mut state = self.inner.lock();
        if !state.available {
            return Err(Self::unreachable());
        }
        state.producer_connected = true;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        let state = self.inner.lock();
        state.available && state.producer_connected
    }

    async fn publish(&self, message: &BrokerMessage) -> Result<()> {
        {
            let mut state = self.inner.lock();
            state.publish_calls += 1;
            if !state.available || !state.producer_connected {
                return Err(Self::unreachable());
            }
            if !message.durable {
                return Err(RelayError::DeliveryRejected(
                    "queue only accepts persistent messages".into(),
                ));
            }
            state.queue.push_back(QueuedMessage::from_broker(message));
            if state.lose_next_confirm {
                state.lose_next_confirm = false;
                state.producer_connected = false;
                drop(state);
                self.inner.notify.notify_one();
                return Err(RelayError::DeliveryUnconfirmed(format!(
                    "confirm for {} lost",
                    message.message_id
                )));
            }
        }
        self.inner.notify.notify_one();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.lock().producer_connected = false;
        Ok(())
    }
}

#[async_trait]
impl DeliverySource for MemoryBroker {
    async fn subscribe(&self, prefetch: u16) -> Result<()> {
        let mut state = self.inner.lock();
        if !state.available {
            return Err(Self::unreachable());
        }
        state.subscribed = true;
        state.prefetch = prefetch;
        Ok(())
    }

    async fn next(&self) -> Result<Option<Delivery>> {
        loop {
            {
                let mut state = self.inner.lock();
                if state.closed {
                    return Ok(None);
                }
                if !state.available || !state.subscribed {
                    return Err(Self::unreachable());
                }
                if state.has_capacity() {
                    if let Some(mut message) = state.queue.pop_front() {
                        message.deliveries += 1;
                        let tag = state.next_tag;
                        state.next_tag += 1;
                        state.unacked.insert(tag, message.clone());
                        state.max_unacked = state.max_unacked.max(state.unacked.len());

                        let acker = MemoryAcker {
                            inner: Arc::clone(&self.inner),
                            tag,
                        };
                        return Ok(Some(
                            Delivery::new(message.payload, Box::new(acker))
                                .with_message_id(message.message_id)
                                .with_redelivered(message.redelivered)
                                .with_delivery_count(Some(message.deliveries - 1)),
                        ));
                    }
                }
            }
            self.inner.notify.notified().await;
        }
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.inner.lock();
        state.subscribed = false;
        state.requeue_unacked();
        Ok(())
    }
}

struct MemoryAcker {
    inner: Arc<Inner>,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self, action: impl FnOnce(&mut State, QueuedMessage)) -> Result<()> {
        {
            let mut state = self.inner.lock();
            let Some(message) = state.unacked.remove(&self.tag) else {
                return Err(RelayError::BrokerConnectionLost(format!(
                    "delivery tag {} is no longer valid",
                    self.tag
                )));
            };
            action(&mut state, message);
        }
        self.inner.notify.notify_one();
        Ok(())
    }
}

#[async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle(|_, _| {})
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.settle(|state, mut message| {
            if requeue {
                message.redelivered = true;
                state.queue.push_front(message);
            } else {
                state.dead_letters.push(message);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    fn message(id: &str) -> BrokerMessage {
        BrokerMessage {
            message_id: id.into(),
            routing_key: "daily_sales_report".into(),
            kind: "summary_created".into(),
            payload: b"{}".to_vec(),
            durable: true,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let broker = MemoryBroker::new();
        let err = broker.publish(&message("m1")).await.unwrap_err();
        assert!(err.is_retryable());

        broker.connect().await.unwrap();
        broker.publish(&message("m1")).await.unwrap();
        assert_eq!(broker.queue_len(), 1);
    }

    #[tokio::test]
    async fn test_prefetch_blocks_until_ack() {
        let broker = MemoryBroker::new();
        broker.push_raw(b"one", Some("m1"));
        broker.push_raw(b"two", Some("m2"));
        broker.subscribe(1).await.unwrap();

        let first = broker.next().await.unwrap().unwrap();
        assert_eq!(first.message_id.as_deref(), Some("m1"));

        let blocked = tokio::time::timeout(Duration::from_millis(30), broker.next()).await;
        assert!(blocked.is_err(), "second delivery must wait for the first ack");

        first.ack().await.unwrap();
        let second = broker.next().await.unwrap().unwrap();
        assert_eq!(second.message_id.as_deref(), Some("m2"));
        assert_eq!(broker.max_unacked(), 1);
    }

    #[tokio::test]
    async fn test_requeue_goes_to_head_and_counts_deliveries() {
        let broker = MemoryBroker::new();
        broker.push_raw(b"one", Some("m1"));
        broker.push_raw(b"two", Some("m2"));
        broker.subscribe(1).await.unwrap();

        let first = broker.next().await.unwrap().unwrap();
        assert_eq!(first.delivery_count, Some(0));
        first.requeue().await.unwrap();

        let again = broker.next().await.unwrap().unwrap();
        assert_eq!(again.message_id.as_deref(), Some("m1"));
        assert!(again.redelivered);
        assert_eq!(again.delivery_count, Some(1));

        again.dead_letter().await.unwrap();
        assert_eq!(broker.dead_letters().len(), 1);
        assert_eq!(broker.queue_len(), 1);
    }

    #[tokio::test]
    async fn test_outage_requeues_unacked_and_invalidates_tags() {
        let broker = MemoryBroker::new();
        broker.push_raw(b"one", Some("m1"));
        broker.subscribe(1).await.unwrap();
        let delivery = broker.next().await.unwrap().unwrap();

        broker.set_available(false);
        assert!(delivery.ack().await.is_err());
        assert!(broker.next().await.is_err());
        assert_eq!(broker.queue_len(), 1);

        broker.set_available(true);
        broker.subscribe(1).await.unwrap();
        let redelivered = broker.next().await.unwrap().unwrap();
        assert!(redelivered.redelivered);
    }

    #[tokio::test]
    async fn test_lost_confirm_still_enqueues() {
        let broker = MemoryBroker::new();
        broker.connect().await.unwrap();
        broker.lose_next_confirm();

        let err = broker.publish(&message("m1")).await.unwrap_err();
        assert!(matches!(err, RelayError::DeliveryUnconfirmed(_)));
        assert_eq!(broker.queue_len(), 1);
        assert!(!broker.is_connected().await);
    }

    #[tokio::test]
    async fn test_shutdown_ends_subscription() {
        let broker = MemoryBroker::new();
        broker.subscribe(1).await.unwrap();
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.next().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        broker.shutdown();
        assert!(waiter.await.unwrap().unwrap().is_none());
    }
}
